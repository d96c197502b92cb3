//! Guarded outbound fetch
//!
//! Every hop of a fetch goes through the same stages:
//! - URL validation (length, `http`/`https` only, host present)
//! - hostname classification and resolution, pinned per hostname for the
//!   whole chain
//! - classification of every resolved address against the [`SsrfPolicy`]
//! - the request itself, with the client forced onto the pinned addresses,
//!   automatic redirects disabled and environment proxies ignored
//!
//! Redirects are followed by hand in a bounded loop so that each target is
//! re-validated and the overall deadline covers the whole chain.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE,
    LOCATION, PROXY_AUTHORIZATION,
};
use reqwest::{Client, Method, StatusCode};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::{Host, Url};

use super::address::{canonical_ip, classify, classify_hostname, parse_ip_literal, AddressClass};
use super::resolver::{HostResolver, PinnedEndpoints, ResolvedEndpoint, SystemResolver};
use super::SsrfPolicy;
use crate::error::RejectionCategory;
use crate::logging::audit::{self, AuditEvent};

/// Maximum URL length (2KB)
pub const MAX_URL_LENGTH: usize = 2048;

/// Default fetch timeout in milliseconds (30s)
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 30_000;

/// Maximum fetch timeout in milliseconds (5 minutes)
pub const MAX_FETCH_TIMEOUT_MS: u64 = 300_000;

/// Default maximum response size (50MB)
pub const DEFAULT_MAX_BYTES: u64 = 50 * 1024 * 1024;

/// Errors that can occur during a guarded fetch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("SSRF blocked: {host}: {reason}")]
    SsrfBlocked {
        host: String,
        class: AddressClass,
        reason: String,
    },

    #[error("too many redirects (max {max})")]
    TooManyRedirects { max: u32 },

    #[error("URL too long: {size} chars (max {max})")]
    UrlTooLong { size: usize, max: usize },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("DNS resolution failed: {0}")]
    DnsResolution(String),

    #[error("HTTP request failed: {0}")]
    HttpRequest(String),

    #[error("Response too large: {size} bytes (max {max})")]
    ResponseTooLarge { size: u64, max: u64 },

    #[error("Stream read error: {0}")]
    StreamRead(String),

    #[error("fetch timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn category(&self) -> RejectionCategory {
        match self {
            FetchError::SsrfBlocked { .. }
            | FetchError::TooManyRedirects { .. }
            | FetchError::ResponseTooLarge { .. } => RejectionCategory::Policy,
            FetchError::UrlTooLong { .. } | FetchError::InvalidUrl(_) => {
                RejectionCategory::MalformedInput
            }
            FetchError::DnsResolution(_)
            | FetchError::HttpRequest(_)
            | FetchError::StreamRead(_)
            | FetchError::Timeout { .. }
            | FetchError::Cancelled => RejectionCategory::Internal,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::SsrfBlocked { .. } => "ssrf_blocked",
            FetchError::TooManyRedirects { .. } => "too_many_redirects",
            FetchError::UrlTooLong { .. } => "url_too_long",
            FetchError::InvalidUrl(_) => "invalid_url",
            FetchError::DnsResolution(_) => "dns_resolution",
            FetchError::HttpRequest(_) => "http_request",
            FetchError::ResponseTooLarge { .. } => "response_too_large",
            FetchError::StreamRead(_) => "stream_read",
            FetchError::Timeout { .. } => "timeout",
            FetchError::Cancelled => "cancelled",
        }
    }
}

/// Per-request options
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Wall-clock budget for the whole redirect chain (capped at 5 minutes)
    pub timeout: Duration,
    /// Maximum response body size in bytes
    pub max_bytes: u64,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            timeout: Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS),
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl FetchOptions {
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout = Duration::from_millis(timeout_ms.min(MAX_FETCH_TIMEOUT_MS));
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Options for the next hop after a redirect response.
    fn redirected(mut self, status: StatusCode, cross_origin: bool) -> Self {
        let to_get = match status {
            StatusCode::SEE_OTHER => self.method != Method::HEAD,
            StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => {
                self.method != Method::GET && self.method != Method::HEAD
            }
            _ => false,
        };
        if to_get {
            self.method = Method::GET;
            self.body = None;
            self.headers.remove(CONTENT_TYPE);
            self.headers.remove(CONTENT_LENGTH);
        }
        if cross_origin {
            self.headers.remove(AUTHORIZATION);
            self.headers.remove(PROXY_AUTHORIZATION);
            self.headers.remove(COOKIE);
        }
        self
    }
}

/// Result of a successful fetch
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// URL of the hop that produced this response
    pub final_url: Url,
    /// Number of redirects followed
    pub redirects: u32,
}

impl FetchResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}

/// Outbound HTTP client that refuses disallowed destinations.
///
/// The resolver is injectable so callers can pin hosts explicitly.
#[derive(Clone)]
pub struct SsrfGuardedFetcher {
    resolver: Arc<dyn HostResolver>,
}

impl Default for SsrfGuardedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SsrfGuardedFetcher {
    /// Fetcher using the system DNS configuration
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(SystemResolver::new()))
    }

    pub fn with_resolver(resolver: Arc<dyn HostResolver>) -> Self {
        Self { resolver }
    }

    /// Fetch `url`, following redirects within the policy.
    ///
    /// Fails with [`FetchError::SsrfBlocked`] when the destination or any
    /// redirect target resolves to a disallowed address, and with
    /// [`FetchError::Cancelled`] or [`FetchError::Timeout`] when the token
    /// fires or the budget runs out at any point in the chain. No partial
    /// response is ever returned.
    pub async fn fetch(
        &self,
        url: &str,
        options: FetchOptions,
        policy: &SsrfPolicy,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse, FetchError> {
        let target = parse_target(url)?;
        let timeout = options
            .timeout
            .min(Duration::from_millis(MAX_FETCH_TIMEOUT_MS));

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            outcome = tokio::time::timeout(timeout, self.follow_chain(target, options, policy, cancel)) => {
                outcome.unwrap_or_else(|_| {
                    Err(FetchError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    })
                })
            }
        };

        match &result {
            Ok(response) => tracing::debug!(
                url = %url,
                final_url = %response.final_url,
                status = response.status.as_u16(),
                redirects = response.redirects,
                bytes = response.body.len(),
                "guarded fetch completed"
            ),
            Err(e) => tracing::warn!(
                url = %url,
                kind = e.kind(),
                category = %e.category(),
                error = %e,
                "guarded fetch rejected"
            ),
        }
        result
    }

    /// Run URL validation, resolution and address checks without sending a
    /// request. Returns the endpoint a fetch would be pinned to.
    pub async fn preflight(
        &self,
        url: &str,
        policy: &SsrfPolicy,
    ) -> Result<ResolvedEndpoint, FetchError> {
        let target = parse_target(url)?;
        let mut pins = PinnedEndpoints::default();
        self.pin(&target, policy, &mut pins, 0).await
    }

    async fn follow_chain(
        &self,
        start: Url,
        mut options: FetchOptions,
        policy: &SsrfPolicy,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse, FetchError> {
        let mut pins = PinnedEndpoints::default();
        let mut current = start;
        let mut redirects: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let endpoint = self.pin(&current, policy, &mut pins, redirects).await?;
            let response = send(&current, &endpoint, &options).await?;
            let status = response.status();

            let location = if status.is_redirection() {
                response.headers().get(LOCATION).cloned()
            } else {
                None
            };

            let Some(location) = location else {
                return read_final(response, current, redirects, options.max_bytes).await;
            };

            if redirects >= policy.max_redirects {
                return Err(FetchError::TooManyRedirects {
                    max: policy.max_redirects,
                });
            }

            let location = location
                .to_str()
                .map_err(|_| FetchError::InvalidUrl("redirect location is not valid text".into()))?;
            let next = current
                .join(location)
                .map_err(|e| FetchError::InvalidUrl(format!("redirect location: {e}")))?;
            let next = check_target(next)?;

            redirects += 1;
            let cross_origin = current.origin() != next.origin();
            tracing::debug!(
                from = %current,
                to = %next,
                status = status.as_u16(),
                hop = redirects,
                "following redirect"
            );
            options = options.redirected(status, cross_origin);
            current = next;
        }
    }

    /// Validate the host of `url` and return the address set the request
    /// must use. Hostnames already pinned earlier in the chain are reused.
    async fn pin(
        &self,
        url: &Url,
        policy: &SsrfPolicy,
        pins: &mut PinnedEndpoints,
        hop: u32,
    ) -> Result<ResolvedEndpoint, FetchError> {
        let host = url
            .host()
            .ok_or_else(|| FetchError::InvalidUrl("URL has no host".to_string()))?;

        let name = match host {
            Host::Ipv4(v4) => return self.pin_literal(url, IpAddr::V4(v4), policy, hop),
            Host::Ipv6(v6) => return self.pin_literal(url, IpAddr::V6(v6), policy, hop),
            Host::Domain(name) => name,
        };

        if let Some(ip) = parse_ip_literal(name) {
            return self.pin_literal(url, ip, policy, hop);
        }

        if let Some(class) = classify_hostname(name) {
            if !policy.permits(class) {
                return Err(blocked(url, name, None, class, hop));
            }
        }

        if let Some(endpoint) = pins.get(name) {
            return Ok(endpoint.clone());
        }

        let addrs = self
            .resolver
            .lookup(name)
            .await
            .map_err(|e| FetchError::DnsResolution(e.to_string()))?;

        let mut pinned: Vec<IpAddr> = Vec::with_capacity(addrs.len());
        for ip in addrs.into_iter().map(canonical_ip) {
            let class = classify(ip);
            if !policy.permits(class) {
                return Err(blocked(url, name, Some(ip), class, hop));
            }
            if !pinned.contains(&ip) {
                pinned.push(ip);
            }
        }

        if pinned.is_empty() {
            return Err(FetchError::DnsResolution(format!(
                "no addresses returned for {name}"
            )));
        }

        tracing::debug!(host = %name, addresses = ?pinned, "resolved and pinned");
        let endpoint = ResolvedEndpoint::new(name, pinned);
        pins.insert(endpoint.clone());
        Ok(endpoint)
    }

    fn pin_literal(
        &self,
        url: &Url,
        ip: IpAddr,
        policy: &SsrfPolicy,
        hop: u32,
    ) -> Result<ResolvedEndpoint, FetchError> {
        let ip = canonical_ip(ip);
        let class = classify(ip);
        let host = url.host_str().unwrap_or_default();
        if !policy.permits(class) {
            return Err(blocked(url, host, Some(ip), class, hop));
        }
        Ok(ResolvedEndpoint::new(host, vec![ip]))
    }
}

fn blocked(
    url: &Url,
    host: &str,
    address: Option<IpAddr>,
    class: AddressClass,
    hop: u32,
) -> FetchError {
    let reason = match address {
        Some(ip) => format!("resolves to {ip} ({class})"),
        None => format!("hostname is {class}"),
    };
    audit::audit(AuditEvent::SsrfBlocked {
        url: url.to_string(),
        host: host.to_string(),
        address: address.map(|ip| ip.to_string()),
        class: class.as_str().to_string(),
        hop,
    });
    FetchError::SsrfBlocked {
        host: host.to_string(),
        class,
        reason,
    }
}

fn parse_target(raw: &str) -> Result<Url, FetchError> {
    if raw.len() > MAX_URL_LENGTH {
        return Err(FetchError::UrlTooLong {
            size: raw.len(),
            max: MAX_URL_LENGTH,
        });
    }
    let url = Url::parse(raw).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
    check_target(url)
}

fn check_target(url: Url) -> Result<Url, FetchError> {
    let size = url.as_str().len();
    if size > MAX_URL_LENGTH {
        return Err(FetchError::UrlTooLong {
            size,
            max: MAX_URL_LENGTH,
        });
    }
    if !matches!(url.scheme(), "http" | "https") {
        return Err(FetchError::InvalidUrl(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(FetchError::InvalidUrl("URL has no host".to_string()));
    }
    Ok(url)
}

async fn send(
    url: &Url,
    endpoint: &ResolvedEndpoint,
    options: &FetchOptions,
) -> Result<reqwest::Response, FetchError> {
    let port = url.port_or_known_default().unwrap_or(80);

    let mut builder = Client::builder()
        // Redirects are followed by hand so each hop is re-validated.
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy();

    if let Some(domain) = url.domain() {
        builder = builder.resolve_to_addrs(domain, &endpoint.socket_addrs(port));
    }

    let client = builder
        .build()
        .map_err(|e| FetchError::HttpRequest(format!("Failed to create HTTP client: {}", e)))?;

    let mut request = client
        .request(options.method.clone(), url.clone())
        .headers(options.headers.clone());
    if let Some(body) = &options.body {
        request = request.body(body.clone());
    }

    request
        .send()
        .await
        .map_err(|e| FetchError::HttpRequest(format!("Request failed: {}", e)))
}

async fn read_final(
    response: reqwest::Response,
    final_url: Url,
    redirects: u32,
    max_bytes: u64,
) -> Result<FetchResponse, FetchError> {
    if let Some(content_length) = response.content_length() {
        if content_length > max_bytes {
            return Err(FetchError::ResponseTooLarge {
                size: content_length,
                max: max_bytes,
            });
        }
    }

    let status = response.status();
    let headers = response.headers().clone();
    let body = read_response_with_limit(response, max_bytes).await?;

    Ok(FetchResponse {
        status,
        headers,
        body,
        final_url,
        redirects,
    })
}

async fn read_response_with_limit(
    response: reqwest::Response,
    max_bytes: u64,
) -> Result<Bytes, FetchError> {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result
            .map_err(|e| FetchError::StreamRead(format!("Failed to read chunk: {}", e)))?;

        let new_size = body.len() as u64 + chunk.len() as u64;
        if new_size > max_bytes {
            return Err(FetchError::ResponseTooLarge {
                size: new_size,
                max: max_bytes,
            });
        }

        body.extend_from_slice(&chunk);
    }

    Ok(Bytes::from(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssrf::StaticResolver;

    fn fetcher_with(resolver: StaticResolver) -> SsrfGuardedFetcher {
        SsrfGuardedFetcher::with_resolver(Arc::new(resolver))
    }

    #[test]
    fn test_fetch_options_defaults() {
        let options = FetchOptions::default();
        assert_eq!(options.method, Method::GET);
        assert_eq!(options.timeout, Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS));
        assert_eq!(options.max_bytes, DEFAULT_MAX_BYTES);
        assert!(options.body.is_none());
    }

    #[test]
    fn test_fetch_options_timeout_capped() {
        let options = FetchOptions::default().with_timeout_ms(MAX_FETCH_TIMEOUT_MS + 100_000);
        assert_eq!(options.timeout, Duration::from_millis(MAX_FETCH_TIMEOUT_MS));
    }

    #[test]
    fn test_redirect_303_switches_to_get_and_drops_body() {
        let options = FetchOptions::default()
            .with_method(Method::POST)
            .with_body("payload")
            .with_header(CONTENT_TYPE, HeaderValue::from_static("text/plain"))
            .redirected(StatusCode::SEE_OTHER, false);
        assert_eq!(options.method, Method::GET);
        assert!(options.body.is_none());
        assert!(options.headers.get(CONTENT_TYPE).is_none());
    }

    #[test]
    fn test_redirect_307_keeps_method_and_body() {
        let options = FetchOptions::default()
            .with_method(Method::PUT)
            .with_body("payload")
            .redirected(StatusCode::TEMPORARY_REDIRECT, false);
        assert_eq!(options.method, Method::PUT);
        assert_eq!(options.body.as_deref(), Some(&b"payload"[..]));
    }

    #[test]
    fn test_redirect_302_keeps_head() {
        let options = FetchOptions::default()
            .with_method(Method::HEAD)
            .redirected(StatusCode::FOUND, false);
        assert_eq!(options.method, Method::HEAD);
    }

    #[test]
    fn test_cross_origin_redirect_drops_credentials() {
        let options = FetchOptions::default()
            .with_header(AUTHORIZATION, HeaderValue::from_static("Bearer secret"))
            .with_header(COOKIE, HeaderValue::from_static("sid=1"))
            .with_header(
                HeaderName::from_static("x-trace"),
                HeaderValue::from_static("abc"),
            );

        let same = options.clone().redirected(StatusCode::FOUND, false);
        assert!(same.headers.get(AUTHORIZATION).is_some());

        let cross = options.redirected(StatusCode::FOUND, true);
        assert!(cross.headers.get(AUTHORIZATION).is_none());
        assert!(cross.headers.get(COOKIE).is_none());
        assert!(cross.headers.get("x-trace").is_some());
    }

    #[test]
    fn test_parse_target_rejects_bad_urls() {
        assert!(matches!(
            parse_target("file:///etc/passwd"),
            Err(FetchError::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_target("ftp://example.com/"),
            Err(FetchError::InvalidUrl(_))
        ));
        assert!(matches!(parse_target("not a url"), Err(FetchError::InvalidUrl(_))));

        let long = format!("https://example.com/{}", "a".repeat(MAX_URL_LENGTH));
        assert!(matches!(
            parse_target(&long),
            Err(FetchError::UrlTooLong { .. })
        ));
    }

    #[tokio::test]
    async fn test_preflight_blocks_private_resolution() {
        let fetcher = fetcher_with(
            StaticResolver::new().with_host("intranet.test", vec!["10.1.2.3".parse().unwrap()]),
        );
        let err = fetcher
            .preflight("https://intranet.test/", &SsrfPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FetchError::SsrfBlocked {
                class: AddressClass::Private,
                ..
            }
        ));

        let endpoint = fetcher
            .preflight("https://intranet.test/", &SsrfPolicy::default().allow_private())
            .await
            .unwrap();
        assert_eq!(endpoint.pinned_addresses, vec!["10.1.2.3".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_preflight_rejects_when_any_address_disallowed() {
        let fetcher = fetcher_with(StaticResolver::new().with_host(
            "mixed.test",
            vec!["93.184.216.34".parse().unwrap(), "127.0.0.1".parse().unwrap()],
        ));
        let err = fetcher
            .preflight("http://mixed.test/", &SsrfPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ssrf_blocked");
    }

    #[tokio::test]
    async fn test_preflight_folds_mapped_ipv6_answers() {
        let fetcher = fetcher_with(
            StaticResolver::new().with_host("mapped.test", vec!["::ffff:127.0.0.1".parse().unwrap()]),
        );
        let err = fetcher
            .preflight("http://mapped.test/", &SsrfPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FetchError::SsrfBlocked {
                class: AddressClass::Loopback,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_preflight_unresolvable_fails_closed() {
        let fetcher = fetcher_with(StaticResolver::new().with_host("empty.test", vec![]));
        let err = fetcher
            .preflight("http://nowhere.test/", &SsrfPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::DnsResolution(_)));

        let err = fetcher
            .preflight("http://empty.test/", &SsrfPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::DnsResolution(_)));
    }

    #[tokio::test]
    async fn test_preflight_blocks_metadata_even_when_private_allowed() {
        let fetcher = fetcher_with(StaticResolver::new());
        let policy = SsrfPolicy::default().allow_private().allow_loopback();

        let err = fetcher
            .preflight("http://169.254.169.254/latest/meta-data/", &policy)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FetchError::SsrfBlocked {
                class: AddressClass::Metadata,
                ..
            }
        ));

        let err = fetcher
            .preflight("http://metadata.google.internal/", &policy)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ssrf_blocked");
    }

    #[tokio::test]
    async fn test_preflight_literal_skips_resolver() {
        let resolver = Arc::new(StaticResolver::new());
        let fetcher = SsrfGuardedFetcher::with_resolver(resolver.clone());
        let endpoint = fetcher
            .preflight("https://93.184.216.34/", &SsrfPolicy::default())
            .await
            .unwrap();
        assert_eq!(endpoint.pinned_addresses.len(), 1);
        assert_eq!(resolver.lookups(), 0);
    }

    #[tokio::test]
    async fn test_fetch_cancelled_before_start() {
        let fetcher = fetcher_with(
            StaticResolver::new().with_host("public.test", vec!["93.184.216.34".parse().unwrap()]),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fetcher
            .fetch(
                "https://public.test/",
                FetchOptions::default(),
                &SsrfPolicy::default(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::Cancelled);
    }
}
