//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener and upgrade endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Path of the WebSocket upgrade route
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_path() -> String {
    "/socket.feli".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_path(),
        }
    }
}

impl ServerConfig {
    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Per-connection settings applied by the upgrade endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Capacity of each connection's outbound queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Interval between ping frames (0 disables heartbeats)
    #[serde(default)]
    pub heartbeat_interval_secs: u64,

    /// Close connections that send nothing for this long (0 disables)
    #[serde(default)]
    pub idle_timeout_secs: u64,
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            heartbeat_interval_secs: 0,
            idle_timeout_secs: 0,
        }
    }
}

impl HubConfig {
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        non_zero_secs(self.heartbeat_interval_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.idle_timeout_secs)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Temperature webhook relay configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_enabled")]
    pub enabled: bool,

    #[serde(default = "default_webhook_url")]
    pub url: String,

    #[serde(default = "default_webhook_timeout")]
    pub timeout_ms: u64,
}

fn default_webhook_enabled() -> bool {
    true
}

fn default_webhook_url() -> String {
    "http://localhost:5000/webhook".to_string()
}

fn default_webhook_timeout() -> u64 {
    5000
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: default_webhook_enabled(),
            url: default_webhook_url(),
            timeout_ms: default_webhook_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("feli").join("config.toml")),
            Some(PathBuf::from("/etc/feli/config.toml")),
            Some(PathBuf::from("./feli.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Check values the server cannot start with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "server.path must start with '/', got {:?}",
                self.server.path
            )));
        }
        if self.hub.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "hub.queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        // Server overrides
        if let Ok(host) = std::env::var("FELI_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse("FELI_PORT") {
            self.server.port = port;
        }
        if let Ok(path) = std::env::var("FELI_PATH") {
            self.server.path = path;
        }

        // Hub overrides
        if let Some(capacity) = env_parse("FELI_QUEUE_CAPACITY") {
            self.hub.queue_capacity = capacity;
        }
        if let Some(secs) = env_parse("FELI_HEARTBEAT_SECS") {
            self.hub.heartbeat_interval_secs = secs;
        }
        if let Some(secs) = env_parse("FELI_IDLE_TIMEOUT_SECS") {
            self.hub.idle_timeout_secs = secs;
        }

        // Webhook overrides
        if let Ok(url) = std::env::var("FELI_WEBHOOK_URL") {
            self.webhook.url = url;
        }
        if let Ok(enabled) = std::env::var("FELI_WEBHOOK_ENABLED") {
            self.webhook.enabled = enabled.to_lowercase() != "false" && enabled != "0";
        }

        // Logging overrides
        if let Ok(level) = std::env::var("FELI_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("FELI_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Socket Feli Configuration
#
# Environment variables override these settings:
# - FELI_HOST, FELI_PORT, FELI_PATH
# - FELI_QUEUE_CAPACITY, FELI_HEARTBEAT_SECS, FELI_IDLE_TIMEOUT_SECS
# - FELI_WEBHOOK_URL, FELI_WEBHOOK_ENABLED
# - FELI_LOG_LEVEL, FELI_LOG_FORMAT

[server]
host = "0.0.0.0"
port = 8000

# Path clients connect to for the WebSocket upgrade
path = "/socket.feli"

[hub]
# Outbound messages buffered per connection before emit waits
queue_capacity = 256

# Seconds between ping frames (0 = disabled)
heartbeat_interval_secs = 0

# Drop connections silent for this many seconds (0 = disabled)
idle_timeout_secs = 0

[webhook]
# Relay "temperatura" events to an HTTP endpoint
enabled = true
url = "http://localhost:5000/webhook"
timeout_ms = 5000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty, json
format = "pretty"
"#
    .to_string()
}
