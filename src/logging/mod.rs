//! Logging subsystem
//!
//! Every guard reports its rejections through `tracing` at `warn` with the
//! rejection kind and category; accepted decisions log at `debug`. The
//! subscriber installed here renders them as JSON lines or plain text.
//! Security decisions are additionally persisted to the audit trail in
//! [`audit`].
//!
//! Filter selection, first match wins:
//!
//! - `CARAPACE_GUARD_LOG`
//! - `RUST_LOG`
//! - `warn,carapace_guard=<level>`, where `<level>` comes from [`LogConfig`]
//!
//! ```no_run
//! use carapace_guard::logging::{init_logging, LogConfig, LogFormat};
//!
//! init_logging(LogConfig::for_serve(LogFormat::Json, "info")).unwrap();
//! ```

pub mod audit;

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Primary filter variable
pub const LOG_ENV_VAR: &str = "CARAPACE_GUARD_LOG";

/// Fallback filter variable
const RUST_LOG_VAR: &str = "RUST_LOG";

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event, for log shippers
    Json,
    /// Human-readable lines
    #[default]
    Plaintext,
}

/// Where log lines go
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File(PathBuf),
}

/// Subscriber settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    pub output: LogOutput,
    /// Level for the crate's own targets when no filter variable is set
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig::for_serve(LogFormat::Plaintext, "info")
    }
}

impl LogConfig {
    /// Gateway process: stdout, format and level from the `logging` config
    /// section. An unrecognised level falls back to info.
    pub fn for_serve(format: LogFormat, level: &str) -> Self {
        LogConfig {
            format,
            output: LogOutput::Stdout,
            default_level: Level::from_str(level.trim()).unwrap_or(Level::INFO),
        }
    }

    /// One-shot CLI commands: plaintext warnings on stderr, leaving stdout
    /// to the command's own output.
    pub fn for_command() -> Self {
        LogConfig {
            format: LogFormat::Plaintext,
            output: LogOutput::Stderr,
            default_level: Level::WARN,
        }
    }

    /// Tests: plaintext debug output on stderr.
    pub fn for_tests() -> Self {
        LogConfig {
            format: LogFormat::Plaintext,
            output: LogOutput::Stderr,
            default_level: Level::DEBUG,
        }
    }
}

/// Subscriber installation failures
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("cannot open log file {}: {source}", path.display())]
    OpenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid log filter in {origin}: {source}")]
    InvalidFilter {
        origin: &'static str,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("cannot install subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// Pick the filter directives and report where they came from.
fn select_directives(
    lookup: impl Fn(&str) -> Option<String>,
    default_level: Level,
) -> (&'static str, String) {
    for var in [LOG_ENV_VAR, RUST_LOG_VAR] {
        if let Some(directives) = lookup(var).filter(|d| !d.trim().is_empty()) {
            return (var, directives);
        }
    }
    let level = default_level.as_str().to_ascii_lowercase();
    ("default", format!("warn,carapace_guard={level}"))
}

fn env_filter(default_level: Level) -> Result<EnvFilter, LoggingError> {
    let (origin, directives) = select_directives(|var| std::env::var(var).ok(), default_level);
    EnvFilter::try_new(&directives).map_err(|source| LoggingError::InvalidFilter { origin, source })
}

fn writer_for(output: &LogOutput) -> Result<BoxMakeWriter, LoggingError> {
    let writer = match output {
        LogOutput::Stdout => BoxMakeWriter::new(io::stdout),
        LogOutput::Stderr => BoxMakeWriter::new(io::stderr),
        LogOutput::File(path) => {
            let file = File::create(path).map_err(|source| LoggingError::OpenFile {
                path: path.clone(),
                source,
            })?;
            BoxMakeWriter::new(Mutex::new(file))
        }
    };
    Ok(writer)
}

fn fmt_layer<S>(
    config: &LogConfig,
) -> Result<Box<dyn Layer<S> + Send + Sync + 'static>, LoggingError>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let filter = env_filter(config.default_level)?;
    let writer = writer_for(&config.output)?;

    let layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_timer(UtcTime::rfc_3339())
            .with_target(true)
            .with_current_span(false)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
        LogFormat::Plaintext => tracing_subscriber::fmt::layer()
            .with_timer(UtcTime::rfc_3339())
            .with_target(true)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
    };
    Ok(layer)
}

/// Install the global subscriber. Only the first call in a process
/// succeeds; later calls fail with [`LoggingError::AlreadyInitialized`].
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    if INSTALLED.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }
    tracing_subscriber::registry()
        .with(fmt_layer(&config)?)
        .try_init()?;
    Ok(())
}

/// Install a debug subscriber for tests. Safe to call from every test.
pub fn init_test_logging() {
    if let Ok(layer) = fmt_layer(&LogConfig::for_tests()) {
        let _ = tracing_subscriber::registry().with(layer).try_init();
    }
}
