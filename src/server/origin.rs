//! WebSocket origin validation
//!
//! Defends the upgrade endpoint against cross-site WebSocket hijacking:
//! - no `Origin` header: accepted (non-browser clients do not send one)
//! - `Origin` host equal to the `Host` header's host: accepted
//! - `Origin` host on the loopback allow-list, or a loopback IP literal: accepted
//! - `Origin` listed in `allowed_origins`: accepted
//! - anything else, including `null` and non-http(s) origins: 403 before the
//!   upgrade handler runs

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::error::RejectionCategory;
use crate::logging::audit::{self, AuditEvent};
use crate::ssrf::{classify, parse_ip_literal, AddressClass};

/// Hosts treated as loopback when no list is configured
pub const DEFAULT_LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1"];

/// Origin check failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OriginRejected {
    #[error("Origin mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },

    #[error("opaque origin 'null' is not accepted")]
    NullOrigin,

    #[error("origin scheme '{0}' is not http or https")]
    UnsupportedScheme(String),

    #[error("malformed Origin header: {0}")]
    MalformedOrigin(String),

    #[error("Host header missing or malformed")]
    MalformedHost,
}

impl OriginRejected {
    pub fn category(&self) -> RejectionCategory {
        match self {
            OriginRejected::Mismatch { .. }
            | OriginRejected::NullOrigin
            | OriginRejected::UnsupportedScheme(_) => RejectionCategory::Policy,
            OriginRejected::MalformedOrigin(_) | OriginRejected::MalformedHost => {
                RejectionCategory::MalformedInput
            }
        }
    }
}

/// Outcome of one origin check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginDecision {
    pub presented_origin: Option<String>,
    pub expected_host: String,
    pub accepted: bool,
}

/// Accept or reject a presented origin for a request to `request_host`.
pub fn validate_origin(
    presented_origin: Option<&str>,
    request_host: &str,
    loopback_allow_list: &[String],
) -> OriginDecision {
    let result = evaluate(presented_origin, Some(request_host), &[], loopback_allow_list);
    OriginDecision {
        presented_origin: presented_origin.map(str::to_string),
        expected_host: request_host.to_string(),
        accepted: result.is_ok(),
    }
}

/// Origin policy for the gateway's upgrade endpoints
#[derive(Debug, Clone)]
pub struct OriginValidator {
    allowed_origins: Vec<String>,
    loopback_hosts: Vec<String>,
}

impl Default for OriginValidator {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

impl OriginValidator {
    /// Empty `loopback_hosts` falls back to [`DEFAULT_LOOPBACK_HOSTS`].
    /// Allowed origins that do not parse as http(s) URLs are ignored.
    pub fn new(allowed_origins: Vec<String>, loopback_hosts: Vec<String>) -> Self {
        let allowed_origins = allowed_origins
            .iter()
            .filter_map(|o| normalize_origin(o))
            .collect();
        let loopback_hosts = if loopback_hosts.is_empty() {
            DEFAULT_LOOPBACK_HOSTS.iter().map(|h| h.to_string()).collect()
        } else {
            loopback_hosts
                .into_iter()
                .map(|h| strip_brackets(&h).to_ascii_lowercase())
                .collect()
        };
        OriginValidator {
            allowed_origins,
            loopback_hosts,
        }
    }

    pub fn validate(
        &self,
        presented_origin: Option<&str>,
        request_host: Option<&str>,
    ) -> Result<OriginDecision, OriginRejected> {
        evaluate(
            presented_origin,
            request_host,
            &self.allowed_origins,
            &self.loopback_hosts,
        )?;
        Ok(OriginDecision {
            presented_origin: presented_origin.map(str::to_string),
            expected_host: request_host.unwrap_or_default().to_string(),
            accepted: true,
        })
    }

    /// Validate the `Origin` and `Host` headers of an upgrade request.
    pub fn validate_headers(&self, headers: &HeaderMap) -> Result<OriginDecision, OriginRejected> {
        let origin = match headers.get(header::ORIGIN) {
            None => None,
            Some(value) => Some(value.to_str().map_err(|_| {
                OriginRejected::MalformedOrigin("header is not valid text".to_string())
            })?),
        };
        let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
        self.validate(origin, host)
    }
}

fn evaluate(
    presented_origin: Option<&str>,
    request_host: Option<&str>,
    allowed_origins: &[String],
    loopback_hosts: &[String],
) -> Result<(), OriginRejected> {
    let Some(origin) = presented_origin.map(str::trim) else {
        return Ok(());
    };

    if origin.eq_ignore_ascii_case("null") {
        return Err(OriginRejected::NullOrigin);
    }

    let parsed =
        Url::parse(origin).map_err(|e| OriginRejected::MalformedOrigin(e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(OriginRejected::UnsupportedScheme(parsed.scheme().to_string()));
    }
    let origin_host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| OriginRejected::MalformedOrigin("origin has no host".to_string()))?
        .to_ascii_lowercase();

    let serialized = parsed.origin().ascii_serialization();
    if allowed_origins.iter().any(|o| *o == serialized) {
        return Ok(());
    }

    if is_loopback_host(&origin_host, loopback_hosts) {
        return Ok(());
    }

    let (expected, expected_port) = request_host
        .and_then(host_component)
        .ok_or(OriginRejected::MalformedHost)?;

    // An explicit Host port must equal the origin's effective port. Without
    // one the origin may not name a non-default port either.
    let ports_match = match expected_port {
        Some(port) => parsed.port_or_known_default() == Some(port),
        None => parsed.port().is_none() || parsed.port() == Some(80),
    };
    if origin_host == expected && ports_match {
        return Ok(());
    }

    Err(OriginRejected::Mismatch {
        expected: authority(&expected, expected_port),
        actual: authority(&origin_host, parsed.port()),
    })
}

/// Host and explicit port of a `Host` header value, host lowercased. Port 80
/// is indistinguishable from no port.
fn host_component(request_host: &str) -> Option<(String, Option<u16>)> {
    let request_host = request_host.trim();
    if request_host.is_empty() {
        return None;
    }
    let url = Url::parse(&format!("http://{request_host}")).ok()?;
    if url.path() != "/" || url.query().is_some() || !url.username().is_empty() {
        return None;
    }
    let host = url.host_str()?.to_ascii_lowercase();
    Some((host, url.port()))
}

fn authority(host: &str, port: Option<u16>) -> String {
    match port {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn is_loopback_host(host: &str, loopback_hosts: &[String]) -> bool {
    let bare = strip_brackets(host);
    if loopback_hosts.iter().any(|h| h.eq_ignore_ascii_case(bare)) {
        return true;
    }
    matches!(parse_ip_literal(bare).map(classify), Some(AddressClass::Loopback))
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

fn normalize_origin(origin: &str) -> Option<String> {
    let url = Url::parse(origin.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    Some(url.origin().ascii_serialization())
}

/// 403 response for a rejected origin
pub fn origin_rejected_response(error: &OriginRejected) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "code": "ORIGIN_REJECTED",
            "message": error.to_string(),
        }
    });
    (
        StatusCode::FORBIDDEN,
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        body.to_string(),
    )
        .into_response()
}

/// Middleware that refuses requests with a disallowed `Origin`.
///
/// Runs before the wrapped handler, so a rejected WebSocket upgrade never
/// reaches the handshake.
pub async fn origin_guard_middleware(
    State(validator): State<Arc<OriginValidator>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    match validator.validate_headers(request.headers()) {
        Ok(decision) => {
            debug!(
                origin = ?decision.presented_origin,
                host = %decision.expected_host,
                "origin accepted"
            );
            next.run(request).await
        }
        Err(e) => {
            let headers = request.headers();
            let origin = header_text(headers, header::ORIGIN.as_str());
            let host = header_text(headers, header::HOST.as_str());
            warn!(
                origin = %origin,
                host = %host,
                category = %e.category(),
                "origin rejected: {}",
                e
            );
            audit::audit(AuditEvent::OriginRejected {
                origin,
                host,
                reason: e.to_string(),
                category: e.category(),
            });
            origin_rejected_response(&e)
        }
    }
}

fn header_text(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default()
}
