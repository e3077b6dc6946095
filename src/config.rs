//! Configuration for the gateway
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/grokgate/config.toml, or $GROKGATE_CONFIG)
//! 3. Built-in defaults (lowest priority)
//!
//! Startup fails when the session secret is unset or the admin app key still
//! equals its shipped default; both would make the admin surface forgeable.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shipped admin app key. Startup refuses to run with this value.
pub const DEFAULT_APP_KEY: &str = "grokgate";

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to bind the HTTP server to
    pub host: String,
    pub port: u16,
    /// Tokio worker threads; 0 = one per core
    pub workers: usize,
    /// Storage backend: only "local" is compiled in
    pub storage_type: String,
    /// Backend-specific location (directory path for "local")
    pub storage_url: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            workers: 0,
            storage_type: "local".to_string(),
            storage_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Primary admin API key for the OpenAI-compatible surface ("" = open
    /// unless managed keys exist)
    pub api_key: String,
    /// Admin app key (dashboard password). Must differ from the default.
    pub app_key: String,
    /// Key for the public imagine/video surface
    pub public_key: String,
    /// Allow the public surface without a key
    pub public_enabled: bool,
    /// HMAC key for session cookies; also settable via SESSION_SECRET
    pub session_secret: String,
    /// Default for requests that omit `stream`
    pub stream: bool,
    /// Emit reasoning wrapped in think markers by default
    pub thinking: bool,
    /// Ask the upstream for temporary (non-persisted) chats
    pub temporary: bool,
    /// Disable the upstream's cross-conversation memory
    pub disable_memory: bool,
    /// Tag families stripped from model output
    pub filter_tags: Vec<String>,
    /// Public base URL of this gateway, used when rendering asset links
    pub app_url: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            app_key: DEFAULT_APP_KEY.to_string(),
            public_key: String::new(),
            public_enabled: false,
            session_secret: String::new(),
            stream: true,
            thinking: true,
            temporary: false,
            disable_memory: true,
            filter_tags: vec!["xai:tool_usage_card".to_string()],
            app_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    /// Max parallel upstream calls per replica
    pub concurrent: usize,
    /// Overall HTTP request timeout towards the upstream (seconds)
    pub request_timeout_sec: u64,
    /// Max wait for the first streamed line (seconds, 0 disables)
    pub stream_first_timeout: u64,
    /// Max wait between consecutive lines (seconds, 0 disables)
    pub stream_idle_timeout: u64,
    /// Max total stream duration (seconds, 0 disables)
    pub stream_total_timeout: u64,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            concurrent: 50,
            request_timeout_sec: 600,
            stream_first_timeout: 30,
            stream_idle_timeout: 120,
            stream_total_timeout: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Upstream attempts per request across tokens
    pub max_retry: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_retry: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationSettings {
    pub ttl_seconds: u64,
    pub cleanup_interval_sec: u64,
    /// Contexts kept per token before the oldest are evicted
    pub max_per_token: usize,
    pub save_delay_ms: u64,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: 24 * 3600,
            cleanup_interval_sec: 600,
            max_per_token: 50,
            save_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenSettings {
    pub save_delay_ms: u64,
    /// Consecutive failures before a count-based cooldown
    pub fail_threshold: u32,
    /// 429 with quota remaining: cool this long (seconds)
    pub cooldown_429_quota_sec: u64,
    /// 429 with quota exhausted: cool this long (seconds)
    pub cooldown_429_empty_sec: u64,
    /// Count-based thaw: pool-wide requests before re-activation
    pub cooldown_error_requests: u32,
    /// Multi-replica reconcile: reload from storage when older than this
    pub reload_interval_sec: u64,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            save_delay_ms: 500,
            fail_threshold: 5,
            cooldown_429_quota_sec: 3600,
            cooldown_429_empty_sec: 36000,
            cooldown_error_requests: 5,
            reload_interval_sec: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Static egress proxy for upstream calls
    pub base_proxy_url: String,
    /// Dedicated proxy for asset fetches, when different
    pub asset_proxy_url: String,
    /// Dynamic proxy pool endpoint; "" disables rotation
    pub pool_url: String,
    pub pool_refresh_sec: u64,
    /// Max proxy rotations when the upstream answers 403
    pub pool_403_max: u32,
    /// Browser impersonation profile for upstream requests
    pub browser: String,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            base_proxy_url: String::new(),
            asset_proxy_url: String::new(),
            pool_url: String::new(),
            pool_refresh_sec: 300,
            pool_403_max: 5,
            browser: "chrome136".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSettings {
    pub hourly_keep: usize,
    pub daily_keep: usize,
    pub save_delay_ms: u64,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            hourly_keep: 48,
            daily_keep: 30,
            save_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsSettings {
    pub max_len: usize,
    pub save_delay_ms: u64,
}

impl Default for LogsSettings {
    fn default() -> Self {
        Self {
            max_len: 2000,
            save_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeysSettings {
    pub save_delay_ms: u64,
}

impl Default for ApiKeysSettings {
    fn default() -> Self {
        Self { save_delay_ms: 500 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub admin_ttl_hours: f64,
    pub public_ttl_hours: f64,
    /// Imagine/video ticket lifetime (seconds)
    pub ticket_ttl_sec: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            admin_ttl_hours: 24.0,
            public_ttl_hours: 24.0,
            ticket_ttl_sec: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// Per-call timeout while the breaker supervises a connect (seconds)
    pub call_timeout_sec: u64,
    /// OPEN -> HALF_OPEN after this long
    pub cooldown_seconds: u64,
    pub half_open_max_calls: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: 5,
            success_threshold: 2,
            call_timeout_sec: 30,
            cooldown_seconds: 60,
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default log level when RUST_LOG is unset: error, warn, info, debug, trace
    pub level: String,
    /// Emit JSON log lines instead of the human-readable format
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub app: AppSettings,
    pub chat: ChatSettings,
    pub retry: RetrySettings,
    pub conversation: ConversationSettings,
    pub token: TokenSettings,
    pub proxy: ProxySettings,
    pub stats: StatsSettings,
    pub logs: LogsSettings,
    pub api_keys: ApiKeysSettings,
    pub session: SessionSettings,
    pub breaker: BreakerSettings,
    pub logging: LoggingSettings,
}

impl Config {
    /// Config file path: $GROKGATE_CONFIG, else ~/.config/grokgate/config.toml
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("GROKGATE_CONFIG") {
            return Some(PathBuf::from(path));
        }
        dirs::home_dir().map(|p| p.join(".config").join("grokgate").join("config.toml"))
    }

    /// Load configuration: file -> env vars -> defaults.
    ///
    /// A config file that exists but cannot be parsed is a hard error; a
    /// silently-ignored broken config sends the operator debugging the wrong
    /// thing.
    pub fn from_env() -> Result<Self> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => {
                let contents = std::fs::read_to_string(&path)
                    .with_context(|| format!("cannot read config file {}", path.display()))?;
                toml::from_str::<Config>(&contents)
                    .with_context(|| format!("cannot parse config file {}", path.display()))?
            }
            _ => Config::default(),
        };

        config.apply_env();
        Ok(config)
    }

    /// Apply environment variable overrides.
    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("SERVER_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(workers) = std::env::var("SERVER_WORKERS") {
            if let Ok(workers) = workers.parse() {
                self.server.workers = workers;
            }
        }
        if let Ok(kind) = std::env::var("SERVER_STORAGE_TYPE") {
            self.server.storage_type = kind;
        }
        if let Ok(url) = std::env::var("SERVER_STORAGE_URL") {
            self.server.storage_url = url;
        }
        if let Ok(secret) = std::env::var("SESSION_SECRET") {
            if !secret.trim().is_empty() {
                self.app.session_secret = secret.trim().to_string();
            }
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Refuse configurations that would ship an insecure gateway.
    pub fn validate(&self) -> Result<()> {
        if self.app.session_secret.trim().is_empty() {
            bail!(
                "session_secret is not configured; set SESSION_SECRET or \
                 app.session_secret in the config file"
            );
        }
        if self.app.app_key == DEFAULT_APP_KEY {
            bail!("app.app_key still equals the shipped default; choose a real admin key");
        }
        if self.retry.max_retry == 0 {
            bail!("retry.max_retry must be at least 1");
        }
        Ok(())
    }

    /// Bind address for the HTTP server.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Runtime-shared configuration. The admin surface can swap a few knobs at
/// runtime (save delays, chat concurrency); readers take cheap snapshots.
pub type SharedConfig = std::sync::Arc<std::sync::RwLock<Config>>;

pub fn shared(config: Config) -> SharedConfig {
    std::sync::Arc::new(std::sync::RwLock::new(config))
}

/// Clone the current configuration out of the shared handle.
pub fn snapshot(config: &SharedConfig) -> Config {
    config.read().expect("config lock poisoned").clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.app.session_secret = "0123456789abcdef".to_string();
        config.app.app_key = "not-the-default".to_string();
        config
    }

    #[test]
    fn defaults_round_trip_through_toml() {
        let toml_str = toml::to_string(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.chat.concurrent, 50);
        assert_eq!(parsed.token.cooldown_429_quota_sec, 3600);
        assert_eq!(parsed.conversation.max_per_token, 50);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [chat]
            concurrent = 10

            [token]
            fail_threshold = 2
            "#,
        )
        .unwrap();
        assert_eq!(parsed.chat.concurrent, 10);
        assert_eq!(parsed.token.fail_threshold, 2);
        assert_eq!(parsed.chat.stream_idle_timeout, 120);
        assert_eq!(parsed.retry.max_retry, 3);
    }

    #[test]
    fn validate_rejects_missing_secret() {
        let mut config = valid_config();
        config.app.session_secret = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_default_app_key() {
        let mut config = valid_config();
        config.app.app_key = DEFAULT_APP_KEY.to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_hardened_config() {
        assert!(valid_config().validate().is_ok());
    }
}
