//! HTTP server implementation
//!
//! Implements:
//! - Health probe (GET /health)
//! - Webhook ingress (POST /hooks/:name), token-authenticated and rate limited
//! - WebSocket endpoint (GET /ws) behind the origin guard
//!
//! Accepted webhook payloads are wrapped as untrusted external content and
//! forwarded on a bounded channel; whatever consumes that channel is outside
//! the gateway.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, DefaultBodyLimit, Path, State,
    },
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::auth::{extract_webhook_token, validate_webhook_token};
use crate::config::GuardConfig;
use crate::logging::audit::{self, AuditEvent};
use crate::prompt_guard::{wrap_external_content, ContentSource};
use crate::server::origin::{origin_guard_middleware, OriginValidator};
use crate::server::ratelimit::{extract_client_ip, rate_limited_response, AuthRateLimiter};

/// Default max body size for hooks (256KB)
pub const DEFAULT_MAX_BODY_BYTES: usize = 262144;

/// Default hooks base path
pub const DEFAULT_HOOKS_PATH: &str = "/hooks";

/// Capacity of the inbound channel.
pub const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Limiter key used when the caller address is unknown.
const UNKNOWN_CLIENT: &str = "unknown";

/// A webhook payload that passed authentication, ready for the agent side.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// The `:name` segment of the hook URL.
    pub hook: String,
    pub remote_ip: Option<IpAddr>,
    /// Payload wrapped in external-content markers.
    pub content: String,
    pub received_at: DateTime<Utc>,
}

/// Shared state for the gateway routes.
#[derive(Clone)]
pub struct GatewayState {
    pub limiter: AuthRateLimiter,
    pub origin: Arc<OriginValidator>,
    /// `None` disables the webhook route.
    pub webhook_token: Option<Arc<str>>,
    pub hooks_path: String,
    pub trust_proxy: bool,
    pub max_body_bytes: usize,
    pub inbound: mpsc::Sender<InboundMessage>,
    start_time: i64,
}

impl GatewayState {
    pub fn new(
        limiter: AuthRateLimiter,
        origin: OriginValidator,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Self {
        GatewayState {
            limiter,
            origin: Arc::new(origin),
            webhook_token: None,
            hooks_path: DEFAULT_HOOKS_PATH.to_string(),
            trust_proxy: false,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            inbound,
            start_time: Utc::now().timestamp(),
        }
    }

    /// Build state from a validated config.
    pub fn from_config(config: &GuardConfig, inbound: mpsc::Sender<InboundMessage>) -> Self {
        let mut state = GatewayState::new(
            AuthRateLimiter::new(config.auth.rate_limit.to_rate_limit_config()),
            config.gateway.origin_validator(),
            inbound,
        )
        .with_trust_proxy(config.gateway.trust_proxy_headers);
        if config.webhook.enabled {
            if let Some(token) = config.webhook.token.as_deref() {
                state = state.with_webhook_token(token);
            }
        }
        state.hooks_path = normalize_hooks_path(&config.webhook.path);
        state
    }

    pub fn with_webhook_token(mut self, token: &str) -> Self {
        self.webhook_token = Some(Arc::from(token));
        self
    }

    pub fn with_trust_proxy(mut self, trust_proxy: bool) -> Self {
        self.trust_proxy = trust_proxy;
        self
    }
}

/// Assemble the gateway router.
pub fn build_router(state: GatewayState) -> Router {
    let mut router: Router<GatewayState> = Router::new().route("/health", get(health_handler));

    if state.webhook_token.is_some() {
        router = router.route(
            &format!("{}/:name", state.hooks_path),
            post(webhook_handler).layer(DefaultBodyLimit::max(state.max_body_bytes)),
        );
    }

    let ws_router: Router<GatewayState> = Router::new()
        .route("/ws", get(ws_handler))
        .layer(middleware::from_fn_with_state(
            state.origin.clone(),
            origin_guard_middleware,
        ));

    router.merge(ws_router).with_state(state)
}

/// Normalize hooks path (ensure leading slash, no trailing slash)
fn normalize_hooks_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return DEFAULT_HOOKS_PATH.to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

// ============================================================================
// Health Check
// ============================================================================

/// GET /health - Lightweight liveness probe.
async fn health_handler(State(state): State<GatewayState>) -> Response {
    let uptime = Utc::now().timestamp() - state.start_time;
    let stats = state.limiter.stats();
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptimeSeconds": uptime,
            "rateLimiter": {
                "trackedKeys": stats.tracked_keys,
                "lockedKeys": stats.locked_keys,
            },
        })),
    )
        .into_response()
}

// ============================================================================
// Webhooks
// ============================================================================

/// POST {hooks_path}/:name
///
/// Order matters: a locked-out caller is refused before the token is even
/// compared, and the comparison outcome is always fed back to the limiter.
async fn webhook_handler(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    let client = extract_client_ip(remote_addr, &headers, state.trust_proxy);
    let key = client
        .map(|c| c.ip.to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string());

    let preflight = match &client {
        Some(client) => state.limiter.check_client(client),
        None => state.limiter.check(&key),
    };
    if let Err(limited) = preflight.into_result() {
        return rate_limited_response(&limited);
    }

    let configured = state.webhook_token.as_deref().unwrap_or_default();
    let authorized = extract_webhook_token(&headers)
        .map(|token| validate_webhook_token(&token, configured))
        .unwrap_or(false);

    let decision = match &client {
        Some(client) => state.limiter.record_client_attempt(client, authorized),
        None => state.limiter.record_attempt(&key, authorized),
    };
    if !authorized {
        warn!(remote_ip = %key, hook = %name, "webhook auth failed");
        audit::audit(AuditEvent::AuthFailure {
            remote_ip: key,
            endpoint: format!("{}/{}", state.hooks_path, name),
            reason: "missing or invalid token".to_string(),
        });
        return match decision.into_result() {
            Err(limited) => rate_limited_response(&limited),
            Ok(()) => unauthorized_response(),
        };
    }
    if let Err(limited) = decision.into_result() {
        return rate_limited_response(&limited);
    }

    let text = String::from_utf8_lossy(&body);
    let message = InboundMessage {
        hook: name,
        remote_ip: client.map(|c| c.ip),
        content: wrap_external_content(&text, ContentSource::Webhook, true),
        received_at: Utc::now(),
    };

    debug!(hook = %message.hook, bytes = body.len(), "webhook accepted");
    match state.inbound.try_send(message) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "ok": true }))).into_response(),
        Err(TrySendError::Full(_)) => {
            warn!("inbound channel full, rejecting webhook");
            unavailable_response("inbound queue full")
        }
        Err(TrySendError::Closed(_)) => unavailable_response("inbound consumer stopped"),
    }
}

/// Generate unauthorized response
fn unauthorized_response() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "message": "Unauthorized",
                "type": "unauthorized"
            }
        })),
    )
        .into_response()
}

fn unavailable_response(message: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "error": {
                "message": message,
                "type": "unavailable"
            }
        })),
    )
        .into_response()
}

// ============================================================================
// WebSocket
// ============================================================================

/// GET /ws - only reached once the origin guard has accepted the request.
async fn ws_handler(
    ws: WebSocketUpgrade,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    ws.on_upgrade(move |socket| handle_socket(socket, remote_addr))
}

async fn handle_socket(mut socket: WebSocket, remote_addr: Option<SocketAddr>) {
    info!(remote = ?remote_addr, "websocket connected");
    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(text) => {
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    debug!(remote = ?remote_addr, "websocket closed");
}
