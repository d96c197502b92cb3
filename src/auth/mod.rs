//! Authentication helpers
//!
//! Webhook token extraction and comparison. Attempt gating lives in
//! [`crate::server::ratelimit`] and secret strength in [`secret`].

pub mod secret;

use axum::http::header::{AsHeaderName, AUTHORIZATION};
use axum::http::HeaderMap;

/// Header carrying the webhook token when `Authorization` is not used.
pub const WEBHOOK_TOKEN_HEADER: &str = "x-carapace-token";

const BEARER_PREFIX: &str = "Bearer ";

fn header_str(headers: &HeaderMap, name: impl AsHeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Token presented with a webhook call.
///
/// `Authorization: Bearer <token>` wins over `X-Carapace-Token`. Any other
/// authorization scheme is ignored rather than treated as a token.
pub fn extract_webhook_token(headers: &HeaderMap) -> Option<String> {
    let bearer =
        header_str(headers, AUTHORIZATION).and_then(|v| v.strip_prefix(BEARER_PREFIX));
    bearer
        .or_else(|| header_str(headers, WEBHOOK_TOKEN_HEADER))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right)
        .fold(0u8, |diff, (l, r)| diff | (l ^ r))
        == 0
}

/// Check a presented webhook token. Empty tokens never match.
pub fn validate_webhook_token(provided: &str, configured: &str) -> bool {
    !provided.is_empty()
        && !configured.is_empty()
        && constant_time_eq(provided.as_bytes(), configured.as_bytes())
}
