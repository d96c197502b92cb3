//! Configuration parsing module
//!
//! Reads a JSON5 file into a typed [`GuardConfig`]. Every section has
//! production defaults, so a missing file or a missing key is never an error.
//! String values may reference environment variables as `${VAR}`; `$${VAR}`
//! yields the literal text.

use std::env;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::auth::secret::{validate_secret, WeakSecret};
use crate::error::RejectionCategory;
use crate::logging::audit::{self, AuditEvent};
use crate::logging::{LogConfig, LogFormat};
use crate::server::origin::{OriginValidator, DEFAULT_LOOPBACK_HOSTS};
use crate::server::ratelimit::{RateLimitConfig, DEFAULT_LOCKOUT, DEFAULT_MAX_ATTEMPTS, DEFAULT_WINDOW};
use crate::ssrf::fetch::{DEFAULT_FETCH_TIMEOUT_MS, DEFAULT_MAX_BYTES};
use crate::ssrf::{FetchOptions, SsrfPolicy, DEFAULT_MAX_REDIRECTS};

/// Config file override.
pub const CONFIG_PATH_ENV: &str = "CARAPACE_GUARD_CONFIG";

/// State directory override (config file, audit log).
pub const STATE_DIR_ENV: &str = "CARAPACE_GUARD_STATE_DIR";

const CONFIG_FILE_NAME: &str = "guard.json5";

/// Default gateway port.
pub const DEFAULT_PORT: u16 = 18789;

const DEFAULT_BIND: &str = "loopback";
const DEFAULT_WEBHOOK_PATH: &str = "/hooks";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("Failed to parse JSON5 at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Missing environment variable: {var}")]
    MissingEnvVar { var: String },

    #[error("Invalid value at {path}: {message}")]
    ValidationError { path: String, message: String },

    #[error("webhook token rejected: {0}")]
    WeakWebhookToken(#[source] WeakSecret),
}

impl ConfigError {
    pub fn category(&self) -> RejectionCategory {
        match self {
            ConfigError::ReadError { .. } => RejectionCategory::Internal,
            ConfigError::WeakWebhookToken(_) => RejectionCategory::Policy,
            ConfigError::ParseError { .. }
            | ConfigError::MissingEnvVar { .. }
            | ConfigError::ValidationError { .. } => RejectionCategory::MalformedInput,
        }
    }
}

/// Root of the guard configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuardConfig {
    pub gateway: GatewayConfig,
    pub auth: AuthConfig,
    pub webhook: WebhookConfig,
    pub fetch: FetchConfig,
    pub plugins: PluginsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    /// `loopback`, `all`, or an explicit IP address.
    pub bind: String,
    pub port: u16,
    /// Honour `X-Forwarded-For` / `X-Real-IP` when keying the rate limiter.
    pub trust_proxy_headers: bool,
    /// Extra origins accepted for WebSocket upgrades (`scheme://host[:port]`).
    pub allowed_origins: Vec<String>,
    pub loopback_hosts: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            trust_proxy_headers: false,
            allowed_origins: Vec::new(),
            loopback_hosts: DEFAULT_LOOPBACK_HOSTS.iter().map(|h| h.to_string()).collect(),
        }
    }
}

impl GatewayConfig {
    /// Resolve the listen address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = match self.bind.trim().to_ascii_lowercase().as_str() {
            "loopback" | "localhost" | "local" => IpAddr::V4(Ipv4Addr::LOCALHOST),
            "all" | "auto" => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            other => other
                .trim_start_matches('[')
                .trim_end_matches(']')
                .parse()
                .map_err(|_| ConfigError::ValidationError {
                    path: "gateway.bind".to_string(),
                    message: format!("not a bind mode or IP address: {other}"),
                })?,
        };
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn origin_validator(&self) -> OriginValidator {
        OriginValidator::new(self.allowed_origins.clone(), self.loopback_hosts.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthConfig {
    pub rate_limit: RateLimitSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    pub max_attempts: u32,
    pub window_ms: u64,
    pub lockout_ms: u64,
    pub exempt_loopback: bool,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            window_ms: DEFAULT_WINDOW.as_millis() as u64,
            lockout_ms: DEFAULT_LOCKOUT.as_millis() as u64,
            exempt_loopback: true,
        }
    }
}

impl RateLimitSettings {
    pub fn to_rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig::builder()
            .max_attempts(self.max_attempts)
            .window(Duration::from_millis(self.window_ms))
            .lockout(Duration::from_millis(self.lockout_ms))
            .exempt_loopback(self.exempt_loopback)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub token: Option<String>,
    pub path: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: None,
            path: DEFAULT_WEBHOOK_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchConfig {
    pub allow_private_addresses: bool,
    pub allow_loopback: bool,
    pub max_redirects: u32,
    pub timeout_ms: u64,
    pub max_bytes: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            allow_private_addresses: false,
            allow_loopback: false,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl FetchConfig {
    pub fn policy(&self) -> SsrfPolicy {
        SsrfPolicy {
            allow_private_addresses: self.allow_private_addresses,
            allow_loopback: self.allow_loopback,
            max_redirects: self.max_redirects,
        }
    }

    pub fn options(&self) -> FetchOptions {
        FetchOptions::default()
            .with_timeout_ms(self.timeout_ms)
            .with_max_bytes(self.max_bytes)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginsConfig {
    /// Defaults to `{state_dir}/plugins`.
    pub install_dir: Option<PathBuf>,
}

impl PluginsConfig {
    pub fn install_dir(&self) -> PathBuf {
        self.install_dir
            .clone()
            .unwrap_or_else(|| state_dir().join("plugins"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plaintext,
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn to_log_config(&self) -> LogConfig {
        LogConfig::for_serve(self.format, &self.level)
    }
}

impl GuardConfig {
    /// Startup checks that abort the gateway.
    ///
    /// With webhook mode enabled the token must be present and strong.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.webhook.enabled {
            return Ok(());
        }
        let token = self.webhook.token.as_deref().unwrap_or("");
        if let Err(weak) = validate_secret(token) {
            tracing::warn!(reason = %weak, "webhook token rejected");
            audit::audit(AuditEvent::WeakSecretRejected {
                reason: weak.to_string(),
            });
            return Err(ConfigError::WeakWebhookToken(weak));
        }
        if !self.webhook.path.starts_with('/') {
            return Err(ConfigError::ValidationError {
                path: "webhook.path".to_string(),
                message: "must start with '/'".to_string(),
            });
        }
        Ok(())
    }
}

/// State directory: `CARAPACE_GUARD_STATE_DIR`, else `~/.carapace`.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = env::var(STATE_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".carapace")
}

/// Get the config file path.
/// Priority: CARAPACE_GUARD_CONFIG > CARAPACE_GUARD_STATE_DIR/guard.json5 > ~/.carapace/guard.json5
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    state_dir().join(CONFIG_FILE_NAME)
}

/// Load the config from the default location.
pub fn load_config() -> Result<GuardConfig, ConfigError> {
    load_config_from(&get_config_path())
}

/// Load and parse a config file. A missing file yields defaults.
pub fn load_config_from(path: &Path) -> Result<GuardConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(GuardConfig::default());
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    parse_config(&content, path)
}

/// Parse JSON5 content into a [`GuardConfig`], substituting `${VAR}` references.
pub fn parse_config(content: &str, path: &Path) -> Result<GuardConfig, ConfigError> {
    let mut value: Value = json5::from_str(content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    substitute_env_vars(&mut value)?;

    serde_json::from_value(value).map_err(|e| ConfigError::ValidationError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Substitute environment variables in every string value.
fn substitute_env_vars(value: &mut Value) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => *s = substitute_env_in_string(s)?,
        Value::Object(obj) => {
            for (_, v) in obj.iter_mut() {
                substitute_env_vars(v)?;
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                substitute_env_vars(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\$?\{([A-Z_][A-Z0-9_]*)\}").expect("env var pattern is valid")
});

/// Pattern: `${VAR}` where VAR matches `[A-Z_][A-Z0-9_]*`
fn substitute_env_in_string(s: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(s.len());
    let mut last_end = 0;

    for caps in ENV_VAR_PATTERN.captures_iter(s) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        result.push_str(&s[last_end..whole.start()]);

        let var = name.as_str();
        if whole.as_str().starts_with("$$") {
            result.push_str("${");
            result.push_str(var);
            result.push('}');
        } else {
            let value = env::var(var).map_err(|_| ConfigError::MissingEnvVar {
                var: var.to_string(),
            })?;
            result.push_str(&value);
        }
        last_end = whole.end();
    }

    result.push_str(&s[last_end..]);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serializes tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const STRONG_TOKEN: &str = "aB3$xY9!qW2@eR5#tY7&uI1*oP4^zX6%";

    fn parse(content: &str) -> Result<GuardConfig, ConfigError> {
        parse_config(content, Path::new("guard.json5"))
    }

    #[test]
    fn test_defaults() {
        let config = GuardConfig::default();
        assert_eq!(config.gateway.port, DEFAULT_PORT);
        assert_eq!(config.gateway.bind, "loopback");
        assert!(!config.gateway.trust_proxy_headers);
        assert_eq!(config.gateway.loopback_hosts, vec!["localhost", "127.0.0.1", "::1"]);
        assert_eq!(config.auth.rate_limit.max_attempts, 5);
        assert_eq!(config.auth.rate_limit.window_ms, 60_000);
        assert_eq!(config.auth.rate_limit.lockout_ms, 900_000);
        assert!(config.auth.rate_limit.exempt_loopback);
        assert!(!config.webhook.enabled);
        assert_eq!(config.fetch.max_redirects, 3);
        assert!(!config.fetch.allow_loopback);
    }

    #[test]
    fn test_parse_json5_partial_sections() {
        let config = parse(
            r#"{
                // comments and trailing commas are fine
                gateway: { port: 9000, allowedOrigins: ["https://app.example.com"], },
                auth: { rateLimit: { maxAttempts: 3 } },
                fetch: { allowLoopback: true },
            }"#,
        )
        .unwrap();

        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.bind, "loopback");
        assert_eq!(config.gateway.allowed_origins, vec!["https://app.example.com"]);
        assert_eq!(config.auth.rate_limit.max_attempts, 3);
        assert_eq!(config.auth.rate_limit.lockout_ms, 900_000);
        assert!(config.fetch.allow_loopback);
        assert!(!config.fetch.allow_private_addresses);
    }

    #[test]
    fn test_parse_json5_error() {
        let result = parse("{ invalid json }");
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_wrong_type_is_validation_error() {
        let result = parse(r#"{ gateway: { port: "not-a-port" } }"#);
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
        assert_eq!(err.category(), RejectionCategory::MalformedInput);
    }

    #[test]
    fn test_env_var_substitution() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::set_var("GUARD_TEST_TOKEN", STRONG_TOKEN);

        let config = parse(r#"{ webhook: { enabled: true, token: "${GUARD_TEST_TOKEN}" } }"#).unwrap();
        assert_eq!(config.webhook.token.as_deref(), Some(STRONG_TOKEN));

        env::remove_var("GUARD_TEST_TOKEN");
    }

    #[test]
    fn test_env_var_escaped() {
        let result = substitute_env_in_string("$${ESCAPED_VAR}").unwrap();
        assert_eq!(result, "${ESCAPED_VAR}");
    }

    #[test]
    fn test_env_var_missing() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::remove_var("GUARD_MISSING_VAR_12345");
        let result = substitute_env_in_string("Bearer ${GUARD_MISSING_VAR_12345}");
        assert!(
            matches!(result, Err(ConfigError::MissingEnvVar { var }) if var == "GUARD_MISSING_VAR_12345")
        );
    }

    #[test]
    fn test_lowercase_braces_left_alone() {
        let result = substitute_env_in_string("${not_a_var} text").unwrap();
        assert_eq!(result, "${not_a_var} text");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config_from(&dir.path().join("absent.json5")).unwrap();
        assert_eq!(config, GuardConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, r#"{ plugins: { installDir: "/opt/plugins" } }"#).unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.plugins.install_dir(), PathBuf::from("/opt/plugins"));
    }

    #[test]
    fn test_get_config_path_override() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::set_var(CONFIG_PATH_ENV, "/custom/path/guard.json5");
        assert_eq!(get_config_path(), PathBuf::from("/custom/path/guard.json5"));
        env::remove_var(CONFIG_PATH_ENV);
    }

    #[test]
    fn test_get_config_path_state_dir() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::remove_var(CONFIG_PATH_ENV);
        env::set_var(STATE_DIR_ENV, "/custom/state");
        assert_eq!(get_config_path(), PathBuf::from("/custom/state/guard.json5"));
        env::remove_var(STATE_DIR_ENV);
    }

    #[test]
    fn test_get_config_path_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::remove_var(CONFIG_PATH_ENV);
        env::remove_var(STATE_DIR_ENV);
        assert!(get_config_path().ends_with(".carapace/guard.json5"));
    }

    #[test]
    fn test_validate_webhook_disabled_skips_token() {
        let config = GuardConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_weak_token() {
        let mut config = GuardConfig::default();
        config.webhook.enabled = true;
        config.webhook.token = Some("hunter2".to_string());

        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::WeakWebhookToken(WeakSecret::TooShort { len: 7, .. })
        ));
        assert_eq!(err.category(), RejectionCategory::Policy);
    }

    #[test]
    fn test_validate_rejects_missing_token() {
        let mut config = GuardConfig::default();
        config.webhook.enabled = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::WeakWebhookToken(WeakSecret::EmptySecret))
        ));
    }

    #[test]
    fn test_validate_accepts_strong_token() {
        let mut config = GuardConfig::default();
        config.webhook.enabled = true;
        config.webhook.token = Some(STRONG_TOKEN.to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bind_addr() {
        let mut gateway = GatewayConfig::default();
        assert_eq!(gateway.bind_addr().unwrap(), "127.0.0.1:18789".parse().unwrap());

        gateway.bind = "all".to_string();
        gateway.port = 8080;
        assert_eq!(gateway.bind_addr().unwrap(), "0.0.0.0:8080".parse().unwrap());

        gateway.bind = "[::1]".to_string();
        assert_eq!(gateway.bind_addr().unwrap(), "[::1]:8080".parse().unwrap());

        gateway.bind = "tailnet".to_string();
        assert!(gateway.bind_addr().is_err());
    }

    #[test]
    fn test_section_conversions() {
        let config = parse(
            r#"{
                auth: { rateLimit: { maxAttempts: 2, windowMs: 1000, lockoutMs: 5000, exemptLoopback: false } },
                fetch: { allowPrivateAddresses: true, maxRedirects: 1, timeoutMs: 1000, maxBytes: 4096 },
            }"#,
        )
        .unwrap();

        let limits = config.auth.rate_limit.to_rate_limit_config();
        assert_eq!(limits.max_attempts, 2);
        assert_eq!(limits.window, Duration::from_secs(1));
        assert_eq!(limits.lockout, Duration::from_secs(5));
        assert!(!limits.exempt_loopback);

        let policy = config.fetch.policy();
        assert!(policy.allow_private_addresses);
        assert_eq!(policy.max_redirects, 1);

        let options = config.fetch.options();
        assert_eq!(options.timeout, Duration::from_secs(1));
        assert_eq!(options.max_bytes, 4096);
    }
}
