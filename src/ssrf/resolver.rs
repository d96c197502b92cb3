//! Hostname resolution and address pinning
//!
//! A hostname is resolved once per logical fetch. The resulting address set
//! is validated and then handed to the HTTP client as an explicit
//! host-to-address override, so the connection can only go to an address
//! that passed validation. A second DNS answer (rebinding) is never consulted.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;
use tracing::warn;

/// DNS lookup failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{host}: {message}")]
pub struct ResolveError {
    pub host: String,
    pub message: String,
}

impl ResolveError {
    pub fn new(host: impl Into<String>, message: impl Into<String>) -> Self {
        ResolveError {
            host: host.into(),
            message: message.into(),
        }
    }
}

/// Resolves a hostname to its addresses.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// Async DNS resolver using the host's resolver configuration
/// (`/etc/resolv.conf` and hosts file on Unix).
#[derive(Clone)]
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    /// Falls back to hickory's default upstreams when the system
    /// configuration cannot be read.
    pub fn new() -> Self {
        let inner = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            warn!(error = %e, "system DNS config unavailable, using default resolvers");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        SystemResolver { inner }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SystemResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemResolver").finish_non_exhaustive()
    }
}

#[async_trait]
impl HostResolver for SystemResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let lookup = self
            .inner
            .lookup_ip(host)
            .await
            .map_err(|e| ResolveError::new(host, e.to_string()))?;

        let mut ips: Vec<IpAddr> = Vec::new();
        for ip in lookup.iter() {
            if !ips.contains(&ip) {
                ips.push(ip);
            }
        }
        Ok(ips)
    }
}

/// Fixed host-to-address table.
///
/// Used for explicit pins and in tests. Counts lookups so callers can verify
/// a host was resolved only once.
#[derive(Debug, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
    lookups: AtomicUsize,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, addrs: Vec<IpAddr>) -> Self {
        self.hosts.insert(host.to_ascii_lowercase(), addrs);
        self
    }

    /// Number of lookups served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.hosts
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| ResolveError::new(host, "no such host"))
    }
}

/// A hostname and the address set it was pinned to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub hostname: String,
    pub pinned_addresses: Vec<IpAddr>,
    pub resolved_at: Instant,
}

impl ResolvedEndpoint {
    pub fn new(hostname: impl Into<String>, pinned_addresses: Vec<IpAddr>) -> Self {
        ResolvedEndpoint {
            hostname: hostname.into(),
            pinned_addresses,
            resolved_at: Instant::now(),
        }
    }

    /// Socket addresses for the pinned set on the given port.
    pub fn socket_addrs(&self, port: u16) -> Vec<SocketAddr> {
        self.pinned_addresses
            .iter()
            .map(|ip| SocketAddr::new(*ip, port))
            .collect()
    }
}

/// Endpoints pinned during one fetch, keyed by lowercase hostname.
#[derive(Debug, Default)]
pub struct PinnedEndpoints {
    endpoints: HashMap<String, ResolvedEndpoint>,
}

impl PinnedEndpoints {
    pub fn get(&self, hostname: &str) -> Option<&ResolvedEndpoint> {
        self.endpoints.get(&hostname.to_ascii_lowercase())
    }

    pub fn insert(&mut self, endpoint: ResolvedEndpoint) {
        self.endpoints
            .insert(endpoint.hostname.to_ascii_lowercase(), endpoint);
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
