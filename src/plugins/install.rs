//! Plugin install path resolution
//!
//! Turns an untrusted plugin identifier into a directory under the install
//! root. The order of checks matters:
//! 1. sanitize the identifier (empty, length, control characters, `.`/`..`
//!    segments, reserved names; `/` and `\` become `__`)
//! 2. canonicalize the install root
//! 3. require the candidate to be a direct child of the canonical root
//! 4. refuse a candidate that already exists as a symlink (checked with
//!    `symlink_metadata`, so the link itself is never followed)

use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::error::RejectionCategory;
use crate::logging::audit::{self, AuditEvent};

/// Maximum identifier length in bytes
pub const MAX_ID_LENGTH: usize = 255;

/// Placeholder for path separators inside an identifier
pub const SEPARATOR_PLACEHOLDER: &str = "__";

/// Names that may never be used as an install directory (case-insensitive)
const RESERVED_NAMES: &[&str] = &[
    ".",
    "..",
    ".git",
    ".hg",
    ".svn",
    ".ssh",
    ".gnupg",
    ".aws",
    ".config",
    ".cache",
    "node_modules",
];

/// Windows device names, reserved with or without an extension
const DEVICE_NAMES: &[&str] = &["con", "prn", "aux", "nul"];

/// Why an install path was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathRejected {
    #[error("plugin identifier is empty")]
    Empty,

    #[error("plugin identifier too long: {len} bytes (max {max})")]
    TooLong { len: usize, max: usize },

    #[error("plugin identifier '{0}' is reserved")]
    Reserved(String),

    #[error("plugin identifier contains control characters")]
    ControlCharacter,

    #[error("plugin identifier '{0}' contains a path traversal segment")]
    Traversal(String),

    #[error("install path {path} escapes the install directory")]
    Escape { path: PathBuf },

    #[error("install path {path} is a symbolic link")]
    Symlink { path: PathBuf },

    #[error("install directory {path} is unavailable: {reason}")]
    BaseUnavailable { path: PathBuf, reason: String },

    #[error("cannot inspect {path}: {reason}")]
    StatFailed { path: PathBuf, reason: String },
}

impl PathRejected {
    pub fn category(&self) -> RejectionCategory {
        match self {
            PathRejected::Empty
            | PathRejected::TooLong { .. }
            | PathRejected::ControlCharacter
            | PathRejected::Traversal(_) => RejectionCategory::MalformedInput,
            PathRejected::Reserved(_) | PathRejected::Escape { .. } | PathRejected::Symlink { .. } => {
                RejectionCategory::Policy
            }
            PathRejected::BaseUnavailable { .. } | PathRejected::StatFailed { .. } => {
                RejectionCategory::Internal
            }
        }
    }
}

/// A resolved install location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallTarget {
    pub requested_id: String,
    /// Install root as given by the caller
    pub base_dir: PathBuf,
    /// Direct child of the canonical install root
    pub resolved_path: PathBuf,
}

/// Resolve `requested_id` to a directory under `base_dir`.
///
/// Rejections are logged and audited; the returned reason is meant for the
/// operator.
pub fn resolve_install_path(
    base_dir: &Path,
    requested_id: &str,
) -> Result<InstallTarget, PathRejected> {
    match resolve(base_dir, requested_id) {
        Ok(target) => {
            tracing::debug!(
                id = %requested_id,
                path = %target.resolved_path.display(),
                "install path resolved"
            );
            Ok(target)
        }
        Err(e) => {
            tracing::warn!(
                id = %requested_id.escape_debug(),
                base_dir = %base_dir.display(),
                category = %e.category(),
                "install path rejected: {}",
                e
            );
            audit::audit(AuditEvent::InstallPathRejected {
                requested_id: requested_id.escape_debug().to_string(),
                reason: e.to_string(),
                category: e.category(),
            });
            Err(e)
        }
    }
}

fn resolve(base_dir: &Path, requested_id: &str) -> Result<InstallTarget, PathRejected> {
    let name = sanitize_id(requested_id)?;

    let canonical_base = base_dir
        .canonicalize()
        .map_err(|e| PathRejected::BaseUnavailable {
            path: base_dir.to_path_buf(),
            reason: e.to_string(),
        })?;

    let candidate = canonical_base.join(&name);
    ensure_direct_child(&canonical_base, &candidate)?;
    ensure_not_symlink(&candidate)?;

    Ok(InstallTarget {
        requested_id: requested_id.to_string(),
        base_dir: base_dir.to_path_buf(),
        resolved_path: candidate,
    })
}

/// Reduce an identifier to a single safe path segment.
pub fn sanitize_id(requested_id: &str) -> Result<String, PathRejected> {
    let id = requested_id.trim();
    if id.is_empty() {
        return Err(PathRejected::Empty);
    }
    if id.len() > MAX_ID_LENGTH {
        return Err(PathRejected::TooLong {
            len: id.len(),
            max: MAX_ID_LENGTH,
        });
    }
    if id.chars().any(char::is_control) {
        return Err(PathRejected::ControlCharacter);
    }
    if id.split(['/', '\\']).any(|segment| segment == "." || segment == "..") {
        return Err(PathRejected::Traversal(id.to_string()));
    }
    if is_reserved(id) {
        return Err(PathRejected::Reserved(id.to_string()));
    }

    Ok(id.replace(['/', '\\'], SEPARATOR_PLACEHOLDER))
}

fn is_reserved(id: &str) -> bool {
    let lower = id.to_ascii_lowercase();
    if RESERVED_NAMES.contains(&lower.as_str()) {
        return true;
    }
    let stem = lower.split('.').next().unwrap_or_default();
    DEVICE_NAMES.contains(&stem)
}

fn ensure_direct_child(base: &Path, candidate: &Path) -> Result<(), PathRejected> {
    let escape = || PathRejected::Escape {
        path: candidate.to_path_buf(),
    };
    let relative = candidate.strip_prefix(base).map_err(|_| escape())?;

    let mut components = relative.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(escape()),
    }
}

fn ensure_not_symlink(candidate: &Path) -> Result<(), PathRejected> {
    match candidate.symlink_metadata() {
        Ok(meta) if meta.file_type().is_symlink() => Err(PathRejected::Symlink {
            path: candidate.to_path_buf(),
        }),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PathRejected::StatFailed {
            path: candidate.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_plain_id() {
        assert_eq!(sanitize_id("my-plugin").unwrap(), "my-plugin");
        assert_eq!(sanitize_id("  padded  ").unwrap(), "padded");
    }

    #[test]
    fn test_sanitize_replaces_separators() {
        assert_eq!(sanitize_id("a/b").unwrap(), "a__b");
        assert_eq!(sanitize_id("@scope/pkg").unwrap(), "@scope__pkg");
        assert_eq!(sanitize_id("win\\style").unwrap(), "win__style");
    }

    #[test]
    fn test_sanitize_rejects_traversal_segments() {
        for id in ["..", "../../etc/passwd", "a/../b", "./x", "a\\..\\b"] {
            let err = sanitize_id(id).unwrap_err();
            assert!(
                matches!(err, PathRejected::Traversal(_)),
                "{id}: {err:?}"
            );
        }
        // Dots inside a segment are fine.
        assert_eq!(sanitize_id("..plugin").unwrap(), "..plugin");
        assert_eq!(sanitize_id("v1.2.3").unwrap(), "v1.2.3");
    }

    #[test]
    fn test_sanitize_rejects_empty_and_control() {
        assert_eq!(sanitize_id(""), Err(PathRejected::Empty));
        assert_eq!(sanitize_id("   "), Err(PathRejected::Empty));
        assert_eq!(sanitize_id("bad\0id"), Err(PathRejected::ControlCharacter));
        assert_eq!(sanitize_id("bad\nid"), Err(PathRejected::ControlCharacter));
    }

    #[test]
    fn test_sanitize_rejects_too_long() {
        let id = "a".repeat(MAX_ID_LENGTH + 1);
        assert!(matches!(
            sanitize_id(&id),
            Err(PathRejected::TooLong { len: 256, max: 255 })
        ));
        assert!(sanitize_id(&"a".repeat(MAX_ID_LENGTH)).is_ok());
    }

    #[test]
    fn test_sanitize_rejects_reserved_names() {
        for id in [".git", ".SSH", "node_modules", "CON", "nul.txt", ".config"] {
            assert!(
                matches!(sanitize_id(id), Err(PathRejected::Reserved(_))),
                "{id} should be reserved"
            );
        }
        assert!(sanitize_id("console").is_ok());
    }

    #[test]
    fn test_direct_child_check() {
        let base = Path::new("/srv/plugins");
        assert!(ensure_direct_child(base, &base.join("ok")).is_ok());
        assert!(ensure_direct_child(base, base).is_err());
        assert!(ensure_direct_child(base, &base.join("a").join("b")).is_err());
        assert!(ensure_direct_child(base, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn test_categories() {
        assert_eq!(PathRejected::Empty.category(), RejectionCategory::MalformedInput);
        assert_eq!(
            PathRejected::Reserved(".git".into()).category(),
            RejectionCategory::Policy
        );
        assert_eq!(
            PathRejected::StatFailed {
                path: PathBuf::from("/x"),
                reason: "denied".into()
            }
            .category(),
            RejectionCategory::Internal
        );
    }
}
