//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommands:
//! - `serve` (default) -- start the guarded gateway
//! - `check-secret` -- score a webhook secret
//! - `install-path` -- resolve a plugin install directory
//! - `normalize` -- print the marker-canonical form of some text
//! - `check-origin` -- evaluate a WebSocket `Origin` against a host
//! - `fetch` -- run a guarded GET
//! - `audit` -- show recent audit entries
//!
//! Every rejection surfaces as an `Err`, so the process exits non-zero.

use std::error::Error;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::secret::{shannon_entropy, validate_secret, MIN_SECRET_ENTROPY, MIN_SECRET_LENGTH};
use crate::config::{self, FetchConfig, GuardConfig};
use crate::error::GuardError;
use crate::logging::audit::{audit_entries_in, AuditLog};
use crate::logging::{init_logging, LogConfig};
use crate::plugins::resolve_install_path;
use crate::prompt_guard::{normalize, sanitize_markers};
use crate::server::http::{InboundMessage, INBOUND_CHANNEL_CAPACITY};
use crate::server::origin::OriginValidator;
use crate::server::startup::{run_server, ServerConfig};
use crate::ssrf::{FetchOptions, SsrfGuardedFetcher, SsrfPolicy};

/// Boundary guards for the carapace gateway.
#[derive(Parser, Debug)]
#[command(
    name = "carapace-guard",
    version = env!("CARGO_PKG_VERSION"),
    about = "Boundary guards for the carapace gateway"
)]
pub struct Cli {
    /// Config file (default: $CARAPACE_GUARD_CONFIG or ~/.carapace/guard.json5).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway (default when no subcommand is given).
    Serve,

    /// Report length, entropy and verdict for a secret.
    CheckSecret {
        /// The secret to check. Prefer --stdin to keep it out of shell history.
        secret: Option<String>,

        /// Read the secret from the first line of stdin.
        #[arg(long, conflicts_with = "secret")]
        stdin: bool,
    },

    /// Resolve where a plugin with the given id would be installed.
    InstallPath {
        id: String,

        /// Install root (default: `plugins.installDir` from the config).
        #[arg(long)]
        base_dir: Option<PathBuf>,
    },

    /// Print the canonical form used for marker comparison.
    Normalize {
        text: String,

        /// Print the text with spoofed markers replaced instead.
        #[arg(long)]
        sanitize: bool,
    },

    /// Check a WebSocket `Origin` header against the request host.
    CheckOrigin {
        /// Value of the `Host` header.
        #[arg(long)]
        host: String,

        /// Value of the `Origin` header (omit for non-browser clients).
        #[arg(long)]
        origin: Option<String>,

        /// Additional accepted origin; may be repeated.
        #[arg(long = "allowed-origin")]
        allowed_origins: Vec<String>,
    },

    /// Fetch a URL through the SSRF guard. Flags override the `fetch`
    /// config section.
    Fetch {
        url: String,

        #[command(flatten)]
        overrides: FetchOverrides,
    },

    /// Show recent audit log entries.
    Audit {
        /// Number of entries to show.
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
    },
}

/// `fetch` flags layered over the config section. The allow flags can only
/// widen the configured policy.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOverrides {
    #[arg(long)]
    pub allow_private: bool,

    #[arg(long)]
    pub allow_loopback: bool,

    #[arg(long)]
    pub max_redirects: Option<u32>,

    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

impl FetchOverrides {
    pub fn apply(&self, section: &FetchConfig) -> (SsrfPolicy, FetchOptions) {
        let mut policy = section.policy();
        policy.allow_private_addresses |= self.allow_private;
        policy.allow_loopback |= self.allow_loopback;
        if let Some(max) = self.max_redirects {
            policy.max_redirects = max;
        }

        let mut options = section.options();
        if let Some(ms) = self.timeout_ms {
            options = options.with_timeout_ms(ms);
        }
        (policy, options)
    }
}

/// Logging for one-shot commands: plaintext warnings on stderr, so guard
/// rejections are visible without cluttering stdout.
pub fn init_command_logging() {
    let _ = init_logging(LogConfig::for_command());
}

fn load(config_path: Option<&Path>) -> Result<GuardConfig, config::ConfigError> {
    match config_path {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    }
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

/// Run the `serve` subcommand until Ctrl+C or SIGTERM.
pub async fn handle_serve(config_path: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let cfg = load(config_path)?;
    init_logging(cfg.logging.to_log_config())?;

    let state_dir = config::state_dir();
    AuditLog::init(state_dir.clone()).await;

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
    let server_config = ServerConfig::from_guard_config(&cfg, inbound_tx)?;
    tokio::spawn(drain_inbound(inbound_rx));

    let handle = run_server(server_config).await?;
    info!(
        addr = %handle.local_addr(),
        state_dir = %state_dir.display(),
        webhooks = cfg.webhook.enabled,
        "carapace-guard started"
    );

    let reason = await_shutdown_trigger().await;
    info!("Shutdown signal received ({})", reason);
    handle.shutdown().await;
    Ok(())
}

/// Stand-in consumer for accepted webhooks; the agent side attaches here.
async fn drain_inbound(mut rx: mpsc::Receiver<InboundMessage>) {
    while let Some(message) = rx.recv().await {
        info!(
            hook = %message.hook,
            remote_ip = ?message.remote_ip,
            bytes = message.content.len(),
            "inbound webhook"
        );
    }
}

/// Wait for either Ctrl+C or SIGTERM (Unix only) and return a label for logging.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!(
                "Failed to install SIGTERM handler: {}; falling back to Ctrl+C only",
                e
            );
            ctrl_c().await
        }
    }
}

#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(e) => {
            warn!("Failed to install Ctrl+C handler: {}", e);
            "signal handler unavailable"
        }
    }
}

// ---------------------------------------------------------------------------
// One-shot guard commands
// ---------------------------------------------------------------------------

/// Strength summary printed by `check-secret`.
#[derive(Debug, Clone, PartialEq)]
pub struct SecretReport {
    pub length: usize,
    pub entropy: f64,
    pub verdict: Result<(), crate::auth::secret::WeakSecret>,
}

pub fn secret_report(secret: &str) -> SecretReport {
    SecretReport {
        length: secret.chars().count(),
        entropy: shannon_entropy(secret),
        verdict: validate_secret(secret),
    }
}

/// Run the `check-secret` subcommand.
pub fn handle_check_secret(secret: Option<&str>, from_stdin: bool) -> Result<(), Box<dyn Error>> {
    let secret = if from_stdin {
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        line.trim_end_matches(['\r', '\n']).to_string()
    } else {
        secret.unwrap_or_default().to_string()
    };

    let report = secret_report(&secret);
    println!("length:  {} (minimum {})", report.length, MIN_SECRET_LENGTH);
    println!(
        "entropy: {:.2} bits/char (minimum {:.1})",
        report.entropy, MIN_SECRET_ENTROPY
    );
    match report.verdict {
        Ok(()) => {
            println!("verdict: strong");
            Ok(())
        }
        Err(weak) => Err(GuardError::from(weak).into()),
    }
}

/// Run the `install-path` subcommand. Without `--base-dir` the root comes
/// from `plugins.installDir`.
pub fn handle_install_path(
    config_path: Option<&Path>,
    base_dir: Option<&Path>,
    id: &str,
) -> Result<(), Box<dyn Error>> {
    let base = match base_dir {
        Some(dir) => dir.to_path_buf(),
        None => load(config_path)?.plugins.install_dir(),
    };
    let target = resolve_install_path(&base, id).map_err(GuardError::from)?;
    println!("{}", target.resolved_path.display());
    Ok(())
}

/// Run the `normalize` subcommand.
pub fn handle_normalize(text: &str, sanitize: bool) {
    if sanitize {
        let sanitized = sanitize_markers(text);
        println!("{}", sanitized.text);
        if sanitized.markers_replaced > 0 {
            eprintln!("{} marker(s) replaced", sanitized.markers_replaced);
        }
    } else {
        println!("{}", normalize(text));
    }
}

/// Run the `check-origin` subcommand.
pub fn handle_check_origin(
    host: &str,
    origin: Option<&str>,
    allowed_origins: &[String],
) -> Result<(), Box<dyn Error>> {
    let validator = OriginValidator::new(allowed_origins.to_vec(), Vec::new());
    let decision = validator
        .validate(origin, Some(host))
        .map_err(GuardError::from)?;
    println!(
        "accepted: origin={} host={}",
        decision.presented_origin.as_deref().unwrap_or("(none)"),
        decision.expected_host
    );
    Ok(())
}

/// Run the `fetch` subcommand. Ctrl+C cancels the request.
pub async fn handle_fetch(
    config_path: Option<&Path>,
    url: &str,
    overrides: &FetchOverrides,
) -> Result<(), Box<dyn Error>> {
    let (policy, options) = overrides.apply(&load(config_path)?.fetch);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let response = SsrfGuardedFetcher::new()
        .fetch(url, options, &policy, &cancel)
        .await
        .map_err(GuardError::from)?;

    println!("status:    {}", response.status);
    println!("final url: {}", response.final_url);
    println!("redirects: {}", response.redirects);
    println!("bytes:     {}", response.body.len());
    if let Some(content_type) = response.content_type() {
        println!("type:      {}", content_type);
    }
    Ok(())
}

/// Run the `audit` subcommand.
pub fn handle_audit(lines: usize) -> Result<(), Box<dyn Error>> {
    for entry in audit_entries_in(&config::state_dir(), lines) {
        println!(
            "{} {:<22} {:<15} {}",
            entry.ts,
            entry.event,
            entry.category.as_str(),
            entry.data
        );
    }
    Ok(())
}
