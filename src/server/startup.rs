//! Testable server startup logic.
//!
//! Provides [`ServerConfig`] and [`ServerHandle`] so integration tests can
//! spin up a real gateway on an ephemeral port, exercise its HTTP and
//! WebSocket endpoints, and shut it down cleanly.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, GuardConfig};
use crate::server::http::{build_router, GatewayState, InboundMessage};
use crate::server::ratelimit::AuthRateLimiter;

/// How long [`ServerHandle::shutdown`] waits for in-flight requests.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to start the gateway.
pub struct ServerConfig {
    pub state: GatewayState,
    pub bind_address: SocketAddr,
}

impl ServerConfig {
    /// Derive the server config from a loaded [`GuardConfig`].
    ///
    /// Runs [`GuardConfig::validate`] first, so a weak webhook token aborts
    /// startup here.
    pub fn from_guard_config(
        config: &GuardConfig,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(ServerConfig {
            state: GatewayState::from_config(config, inbound),
            bind_address: config.gateway.bind_addr()?,
        })
    }

    /// Binds to `127.0.0.1:0` (OS-assigned port).
    pub fn for_testing(state: GatewayState) -> Self {
        ServerConfig {
            state,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }
}

/// A running gateway. Dropping the handle leaves the server running; call
/// [`ServerHandle::shutdown`] to stop it.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<io::Result<()>>,
}

impl ServerHandle {
    /// Bound port, useful when the config asked for port 0.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://ip:port` of the running server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting connections and give in-flight requests
    /// [`SHUTDOWN_GRACE`] to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        match tokio::time::timeout(SHUTDOWN_GRACE, self.task).await {
            Ok(Ok(Ok(()))) => info!(addr = %self.local_addr, "gateway stopped"),
            Ok(Ok(Err(e))) => error!("gateway exited with error: {e}"),
            Ok(Err(e)) => error!("gateway task failed: {e}"),
            Err(_) => warn!(
                grace_secs = SHUTDOWN_GRACE.as_secs(),
                "gateway did not stop within grace period"
            ),
        }
    }
}

/// Bind the listener and serve the router on a background task.
///
/// Binding happens before this returns, so a port conflict surfaces here
/// rather than inside the task.
pub async fn run_server(config: ServerConfig) -> Result<ServerHandle, io::Error> {
    let listener = TcpListener::bind(config.bind_address).await?;
    let local_addr = listener.local_addr()?;
    let limiter = config.state.limiter.clone();
    let app = build_router(config.state)
        .into_make_service_with_connect_info::<SocketAddr>();

    let shutdown = CancellationToken::new();
    tokio::spawn(prune_idle_records(limiter, shutdown.clone()));
    let stop = shutdown.clone().cancelled_owned();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(stop)
            .await
    });

    info!(addr = %local_addr, "gateway listening");
    Ok(ServerHandle {
        local_addr,
        shutdown,
        task,
    })
}

/// Sweep idle limiter records every cleanup interval until shutdown, so keys
/// that never return are dropped even without further traffic.
async fn prune_idle_records(limiter: AuthRateLimiter, shutdown: CancellationToken) {
    let period = limiter.config().cleanup_interval.max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = limiter.prune();
                if removed > 0 {
                    debug!(removed, "pruned idle limiter records");
                }
            }
        }
    }
}
