//! SSRF protection for outbound HTTP
//!
//! - [`address`]: CIDR classification of destination addresses
//! - [`resolver`]: hostname resolution and per-request address pinning
//! - [`fetch`]: the guarded fetcher with redirect re-validation
//!
//! # Security Note: DNS Rebinding Protection
//!
//! Validating the literal URL is not enough. Every hostname is resolved once,
//! every resolved address is checked against the [`SsrfPolicy`], and the
//! HTTP client is forced to connect to that validated set. The hostname is
//! kept only for TLS SNI and the `Host` header.

pub mod address;
pub mod fetch;
pub mod resolver;

use serde::{Deserialize, Serialize};

pub use address::{classify, classify_hostname, parse_ip_literal, AddressClass};
pub use fetch::{FetchError, FetchOptions, FetchResponse, SsrfGuardedFetcher};
pub use resolver::{HostResolver, ResolvedEndpoint, StaticResolver, SystemResolver};

/// Default redirect cap.
pub const DEFAULT_MAX_REDIRECTS: u32 = 3;

/// Per-call destination policy supplied by the calling tool or channel.
///
/// Defaults to the most restrictive setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SsrfPolicy {
    /// Allow private and link-local destinations (RFC 1918, CGNAT, ULA).
    pub allow_private_addresses: bool,
    /// Allow loopback destinations.
    pub allow_loopback: bool,
    /// Maximum number of redirects followed for one fetch.
    pub max_redirects: u32,
}

impl Default for SsrfPolicy {
    fn default() -> Self {
        SsrfPolicy {
            allow_private_addresses: false,
            allow_loopback: false,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }
}

impl SsrfPolicy {
    /// Policy that also permits private-network destinations.
    pub fn allow_private(mut self) -> Self {
        self.allow_private_addresses = true;
        self
    }

    /// Policy that also permits loopback destinations.
    pub fn allow_loopback(mut self) -> Self {
        self.allow_loopback = true;
        self
    }

    pub fn with_max_redirects(mut self, max_redirects: u32) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Whether a destination of the given class may be contacted.
    ///
    /// Cloud metadata and reserved ranges are never reachable.
    pub fn permits(&self, class: AddressClass) -> bool {
        match class {
            AddressClass::Public => true,
            AddressClass::Loopback => self.allow_loopback,
            AddressClass::Private | AddressClass::LinkLocal => self.allow_private_addresses,
            AddressClass::Metadata | AddressClass::Reserved => false,
        }
    }
}
