//! Authentication attempt limiting
//!
//! Fixed-window failure counting per caller key with a hard lockout:
//! - a failed attempt increments the key's count, restarting the window
//!   when it has elapsed
//! - once the count exceeds `max_attempts` the key is locked for `lockout`
//!   and every attempt, successful or not, is refused until it expires
//! - a successful attempt before lockout clears the key
//! - loopback keys are exempt when `exempt_loopback` is set, but only when
//!   the key is the socket peer rather than a proxy header
//!
//! The limiter is an owned instance injected into the HTTP layer. Its map is
//! behind a single mutex that is only held for the in-memory update.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::logging::audit::{self, AuditEvent};
use crate::ssrf::address::is_loopback_key;

/// Default failed attempts allowed per window
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default counting window
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Default lockout once the limit is exceeded
pub const DEFAULT_LOCKOUT: Duration = Duration::from_secs(900);

/// Default cleanup interval (remove idle records)
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Attempt refused because the key is locked out.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("too many failed attempts, retry after {retry_after:?}")]
pub struct RateLimited {
    pub retry_after: Duration,
}

impl RateLimited {
    /// Retry-after rounded up to whole seconds, at least one.
    pub fn retry_after_secs(&self) -> u64 {
        retry_after_secs(self.retry_after)
    }
}

fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

/// Outcome of a limiter call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub retry_after: Option<Duration>,
}

impl Decision {
    fn allow() -> Self {
        Decision {
            allowed: true,
            retry_after: None,
        }
    }

    fn deny(retry_after: Duration) -> Self {
        Decision {
            allowed: false,
            retry_after: Some(retry_after),
        }
    }

    pub fn into_result(self) -> Result<(), RateLimited> {
        if self.allowed {
            Ok(())
        } else {
            Err(RateLimited {
                retry_after: self.retry_after.unwrap_or(Duration::ZERO),
            })
        }
    }
}

/// Limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Failed attempts tolerated within one window
    pub max_attempts: u32,
    /// Counting window
    pub window: Duration,
    /// Lockout duration once `max_attempts` is exceeded
    pub lockout: Duration,
    /// Never limit loopback callers (local CLI)
    pub exempt_loopback: bool,
    /// How often idle records are pruned
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            window: DEFAULT_WINDOW,
            lockout: DEFAULT_LOCKOUT,
            exempt_loopback: true,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

impl RateLimitConfig {
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::default()
    }
}

/// Builder for RateLimitConfig
#[derive(Default)]
pub struct RateLimitConfigBuilder {
    config: RateLimitConfig,
}

impl RateLimitConfigBuilder {
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.max_attempts = max_attempts;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.config.window = window;
        self
    }

    pub fn lockout(mut self, lockout: Duration) -> Self {
        self.config.lockout = lockout;
        self
    }

    pub fn exempt_loopback(mut self, exempt: bool) -> Self {
        self.config.exempt_loopback = exempt;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_interval = interval;
        self
    }

    pub fn build(self) -> RateLimitConfig {
        self.config
    }
}

/// Failure history for one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub key: String,
    pub count: u32,
    pub window_start: Instant,
    pub locked_until: Option<Instant>,
}

impl AttemptRecord {
    fn fresh(key: &str, now: Instant) -> Self {
        AttemptRecord {
            key: key.to_string(),
            count: 0,
            window_start: now,
            locked_until: None,
        }
    }

    fn lock_remaining(&self, now: Instant) -> Option<Duration> {
        self.locked_until
            .filter(|until| now < *until)
            .map(|until| until - now)
    }

    /// Nothing left to remember: not locked and the window has passed.
    fn is_idle(&self, now: Instant, window: Duration) -> bool {
        self.lock_remaining(now).is_none() && now.duration_since(self.window_start) >= window
    }
}

struct LimiterState {
    records: HashMap<String, AttemptRecord>,
    last_cleanup: Instant,
}

/// Per-key authentication attempt limiter
#[derive(Clone)]
pub struct AuthRateLimiter {
    state: Arc<Mutex<LimiterState>>,
    config: Arc<RateLimitConfig>,
}

impl AuthRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        AuthRateLimiter {
            state: Arc::new(Mutex::new(LimiterState {
                records: HashMap::new(),
                last_cleanup: Instant::now(),
            })),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn is_exempt(&self, key: &str) -> bool {
        self.config.exempt_loopback && is_loopback_key(key)
    }

    /// Record the outcome of an authentication attempt.
    pub fn record_attempt(&self, key: &str, success: bool) -> Decision {
        self.record_attempt_at(key, success, Instant::now())
    }

    /// [`record_attempt`](Self::record_attempt) against an explicit clock.
    pub fn record_attempt_at(&self, key: &str, success: bool, now: Instant) -> Decision {
        if self.is_exempt(key) {
            return Decision::allow();
        }
        self.count_attempt(key, success, now)
    }

    /// Record an attempt from an extracted caller address. A forwarded
    /// address is counted even when it claims to be loopback.
    pub fn record_client_attempt(&self, client: &ClientAddr, success: bool) -> Decision {
        let key = client.ip.to_string();
        if client.exemptable() {
            self.record_attempt(&key, success)
        } else {
            self.count_attempt(&key, success, Instant::now())
        }
    }

    /// Pre-flight [`check`](Self::check) for an extracted caller address.
    pub fn check_client(&self, client: &ClientAddr) -> Decision {
        let key = client.ip.to_string();
        if client.exemptable() {
            self.check(&key)
        } else {
            self.lookup_lock(&key, Instant::now())
        }
    }

    fn count_attempt(&self, key: &str, success: bool, now: Instant) -> Decision {
        let mut lockout_started = None;
        let decision = {
            let mut state = self.state.lock();
            self.maybe_cleanup(&mut state, now);

            let locked = state
                .records
                .get(key)
                .and_then(|record| record.lock_remaining(now));

            if let Some(remaining) = locked {
                Decision::deny(remaining)
            } else if success {
                state.records.remove(key);
                Decision::allow()
            } else {
                let config = &self.config;
                let record = state
                    .records
                    .entry(key.to_string())
                    .or_insert_with(|| AttemptRecord::fresh(key, now));

                // An expired lockout or window starts over.
                if record.locked_until.is_some()
                    || now.duration_since(record.window_start) >= config.window
                {
                    *record = AttemptRecord::fresh(key, now);
                }
                record.count += 1;

                if record.count > config.max_attempts {
                    record.locked_until = Some(now + config.lockout);
                    lockout_started = Some(record.count);
                    Decision::deny(config.lockout)
                } else {
                    Decision::allow()
                }
            }
        };

        if let Some(attempts) = lockout_started {
            warn!(
                key = %key,
                attempts,
                lockout_secs = self.config.lockout.as_secs(),
                "auth lockout started"
            );
            audit::audit(AuditEvent::LockoutStarted {
                key: key.to_string(),
                attempts,
                lockout_secs: self.config.lockout.as_secs(),
            });
        } else if let Some(retry_after) = decision.retry_after {
            self.report_rejection(key, retry_after);
        }

        decision
    }

    /// Read-only pre-flight check; never changes a record.
    pub fn check(&self, key: &str) -> Decision {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> Decision {
        if self.is_exempt(key) {
            return Decision::allow();
        }
        self.lookup_lock(key, now)
    }

    fn lookup_lock(&self, key: &str, now: Instant) -> Decision {
        let remaining = {
            let state = self.state.lock();
            state
                .records
                .get(key)
                .and_then(|record| record.lock_remaining(now))
        };

        match remaining {
            Some(retry_after) => {
                self.report_rejection(key, retry_after);
                Decision::deny(retry_after)
            }
            None => Decision::allow(),
        }
    }

    fn report_rejection(&self, key: &str, retry_after: Duration) {
        let retry_after_secs = retry_after_secs(retry_after);
        warn!(key = %key, retry_after_secs, "auth attempt rejected: locked out");
        audit::audit(AuditEvent::RateLimited {
            key: key.to_string(),
            retry_after_secs,
        });
    }

    /// Clear a key (operator unlock). Returns whether a record existed.
    pub fn reset(&self, key: &str) -> bool {
        self.state.lock().records.remove(key).is_some()
    }

    /// Drop idle records. Returns how many were removed.
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    pub fn prune_at(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        state.last_cleanup = now;
        Self::retain_active(&mut state.records, now, self.config.window)
    }

    fn maybe_cleanup(&self, state: &mut LimiterState, now: Instant) {
        if now.saturating_duration_since(state.last_cleanup) < self.config.cleanup_interval {
            return;
        }
        state.last_cleanup = now;
        let removed = Self::retain_active(&mut state.records, now, self.config.window);
        debug!(
            removed,
            remaining = state.records.len(),
            "auth limiter cleanup"
        );
    }

    fn retain_active(
        records: &mut HashMap<String, AttemptRecord>,
        now: Instant,
        window: Duration,
    ) -> usize {
        let before = records.len();
        records.retain(|_, record| !record.is_idle(now, window));
        before - records.len()
    }

    /// Snapshot of a key's record, if any.
    pub fn record(&self, key: &str) -> Option<AttemptRecord> {
        self.state.lock().records.get(key).cloned()
    }

    pub fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let state = self.state.lock();
        RateLimiterStats {
            tracked_keys: state.records.len(),
            locked_keys: state
                .records
                .values()
                .filter(|r| r.lock_remaining(now).is_some())
                .count(),
        }
    }
}

/// Limiter statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub tracked_keys: usize,
    pub locked_keys: usize,
}

/// Where a caller address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrSource {
    /// The TCP peer of the connection.
    Peer,
    /// A proxy header, only consulted with `trust_proxy`.
    Forwarded,
}

/// Caller identity used as the limiter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr {
    pub ip: IpAddr,
    pub source: AddrSource,
}

impl ClientAddr {
    pub fn peer(ip: IpAddr) -> Self {
        ClientAddr {
            ip,
            source: AddrSource::Peer,
        }
    }

    pub fn forwarded(ip: IpAddr) -> Self {
        ClientAddr {
            ip,
            source: AddrSource::Forwarded,
        }
    }

    /// The loopback exemption only ever applies to the socket peer; a
    /// header can claim any address.
    pub fn exemptable(&self) -> bool {
        self.source == AddrSource::Peer
    }
}

/// Caller address for rate limiting.
///
/// With `trust_proxy`, the rightmost `X-Forwarded-For` entry (the address
/// the trusted proxy itself saw), then `X-Real-IP`, take precedence over the
/// socket address. Entries further left are client-supplied and ignored.
pub fn extract_client_ip(
    remote_addr: Option<SocketAddr>,
    headers: &HeaderMap,
    trust_proxy: bool,
) -> Option<ClientAddr> {
    if trust_proxy {
        let header_value = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        let forwarded = header_value("x-forwarded-for")
            .and_then(|xff| xff.rsplit(',').next())
            .or_else(|| header_value("x-real-ip"))
            .and_then(|ip| ip.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return Some(ClientAddr::forwarded(ip));
        }
    }

    remote_addr.map(|addr| ClientAddr::peer(addr.ip()))
}

/// 429 response carrying `Retry-After`.
pub fn rate_limited_response(limited: &RateLimited) -> Response<Body> {
    let retry_after_secs = limited.retry_after_secs();
    (
        StatusCode::TOO_MANY_REQUESTS,
        [
            (header::CONTENT_TYPE, "application/json; charset=utf-8"),
            (header::RETRY_AFTER, &retry_after_secs.to_string()),
        ],
        format!(
            r#"{{"error":{{"code":"RATE_LIMIT_EXCEEDED","message":"Too many failed attempts","retryAfter":{}}}}}"#,
            retry_after_secs
        ),
    )
        .into_response()
}
