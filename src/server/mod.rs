//! Server module
//!
//! The gateway's HTTP and WebSocket surface plus the inbound guards it
//! applies: attempt limiting for webhook auth and origin checks for upgrades.

pub mod http;
pub mod origin;
pub mod ratelimit;
pub mod startup;

pub use http::{build_router, GatewayState, InboundMessage};
pub use origin::{validate_origin, OriginDecision, OriginRejected, OriginValidator};
pub use ratelimit::{AuthRateLimiter, Decision, RateLimitConfig, RateLimited};
pub use startup::{run_server, ServerConfig, ServerHandle};
