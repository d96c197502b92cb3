//! Rejection taxonomy shared by every guard

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::secret::WeakSecret;
use crate::config::ConfigError;
use crate::plugins::install::PathRejected;
use crate::server::origin::OriginRejected;
use crate::server::ratelimit::RateLimited;
use crate::ssrf::FetchError;

/// Why a guard said no.
///
/// Lets the audit trail tell "blocked by policy" apart from "malformed input"
/// and "internal error".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCategory {
    /// The input was well-formed but the policy forbids it.
    Policy,
    /// The input could not be parsed or violates a structural rule.
    MalformedInput,
    /// The guard could not reach a decision (I/O, DNS, timeouts).
    Internal,
}

impl RejectionCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectionCategory::Policy => "policy",
            RejectionCategory::MalformedInput => "malformed_input",
            RejectionCategory::Internal => "internal",
        }
    }
}

impl fmt::Display for RejectionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any guard rejection.
#[derive(Error, Debug)]
pub enum GuardError {
    #[error(transparent)]
    RateLimited(#[from] RateLimited),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    WeakSecret(#[from] WeakSecret),

    #[error(transparent)]
    OriginRejected(#[from] OriginRejected),

    #[error(transparent)]
    PathRejected(#[from] PathRejected),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GuardError {
    pub fn category(&self) -> RejectionCategory {
        match self {
            GuardError::RateLimited(_) => RejectionCategory::Policy,
            GuardError::Fetch(e) => e.category(),
            GuardError::WeakSecret(_) => RejectionCategory::Policy,
            GuardError::OriginRejected(e) => e.category(),
            GuardError::PathRejected(e) => e.category(),
            GuardError::Config(e) => e.category(),
        }
    }

    /// Stable snake_case identifier for logs and API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            GuardError::RateLimited(_) => "rate_limited",
            GuardError::Fetch(e) => e.kind(),
            GuardError::WeakSecret(_) => "weak_secret",
            GuardError::OriginRejected(_) => "origin_rejected",
            GuardError::PathRejected(_) => "path_rejected",
            GuardError::Config(_) => "config",
        }
    }
}
