//! Defences for externally sourced text entering agent context
//!
//! - [`normalize`]: canonical form used for marker comparison
//! - [`markers`]: trust-boundary markers, spoof sanitisation and wrapping

pub mod markers;
pub mod normalize;

pub use markers::{
    detect_suspicious_patterns, sanitize_markers, wrap_external_content, ContentSource, Sanitized,
    EXTERNAL_CONTENT_END, EXTERNAL_CONTENT_START,
};
pub use normalize::normalize;
