//! carapace-guard library
//!
//! The boundary guards the carapace gateway applies to externally
//! controlled values: authentication attempt limiting, SSRF-safe outbound
//! fetch, webhook secret strength, WebSocket origin checks, plugin
//! install-path sanitisation and marker-spoof normalisation. The gateway
//! surface that wires them together lives in [`server`].

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod plugins;
pub mod prompt_guard;
pub mod server;
pub mod ssrf;

pub use error::{GuardError, RejectionCategory};
