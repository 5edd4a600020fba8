//! Configuration Module
//!
//! Provides TOML-based configuration for the feed with support for:
//! - Transport credentials and reconnect tuning
//! - Adapter emission mode (top-of-book vs full depth)
//! - Dispatcher bounds and drop-rate thresholds
//! - Liveness gaps (global and per symbol)
//! - Environment variable overrides (FEEDLINK__* prefix)

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::dispatcher::{DEFAULT_DROP_WARNING_THRESHOLD, DEFAULT_EMA_ALPHA, DEFAULT_MAXLEN};


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Broker transport configuration
    pub transport: TransportConfig,
    /// Adapter configuration
    pub adapter: AdapterConfig,
    /// Dispatcher configuration
    pub dispatcher: DispatcherConfig,
    /// Liveness configuration
    pub liveness: LivenessConfig,
}

/// Broker transport configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Application id issued by the broker
    pub app_id: String,
    /// Application secret (base64; whitespace and missing padding are
    /// tolerated)
    pub app_secret: String,
    /// Application code the credentials were issued under
    pub app_code: String,
    /// Broker id, or the literal `SANDBOX` for the UAT environment
    pub broker_id: String,
    /// Overrides the environment-derived REST base URL
    pub base_url: Option<String>,
    /// WSS port
    pub port: u16,
    /// MQTT keepalive in seconds (5-300)
    pub keepalive: u16,
    /// First reconnect backoff delay
    #[serde(with = "humantime_serde")]
    pub reconnect_min_delay: Duration,
    /// Backoff ceiling
    #[serde(with = "humantime_serde")]
    pub reconnect_max_delay: Duration,
    /// How long before token expiry a controlled reconnect is scheduled
    #[serde(with = "humantime_serde")]
    pub token_refresh_lead: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_secret: String::new(),
            app_code: String::new(),
            broker_id: String::new(),
            base_url: None,
            port: 443,
            keepalive: 30,
            reconnect_min_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            token_refresh_lead: Duration::from_secs(100),
        }
    }
}

/// Adapter configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AdapterConfig {
    /// Emit ten-level depth books instead of top-of-book quotes
    pub full_depth: bool,
}

/// Dispatcher configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Queue capacity; the oldest event is evicted beyond this
    pub maxlen: usize,
    /// EMA smoothing factor for the drop-rate signal (0 < a <= 1)
    pub ema_alpha: f64,
    /// Drop rate above which the warning edge fires (0 < t <= 1)
    pub drop_warning_threshold: f64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            maxlen: DEFAULT_MAXLEN,
            ema_alpha: DEFAULT_EMA_ALPHA,
            drop_warning_threshold: DEFAULT_DROP_WARNING_THRESHOLD,
        }
    }
}

/// Liveness configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Global staleness threshold in seconds
    pub max_gap_seconds: f64,
    /// Per-symbol overrides in seconds
    pub per_symbol_max_gap: HashMap<String, f64>,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            max_gap_seconds: 5.0,
            per_symbol_max_gap: HashMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable
    /// overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax
    /// 2. Override via env vars: `FEEDLINK__` prefix with double
    ///    underscores for nesting:
    ///    - `FEEDLINK__TRANSPORT__BROKER_ID=SANDBOX` overrides `transport.broker_id`
    ///    - `FEEDLINK__DISPATCHER__MAXLEN=50000` overrides `dispatcher.maxlen`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("FEEDLINK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no
    /// file). Useful for containerized deployments.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("transport.app_id", &self.transport.app_id),
            ("transport.app_secret", &self.transport.app_secret),
            ("transport.app_code", &self.transport.app_code),
            ("transport.broker_id", &self.transport.broker_id),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Validation(format!("{} is required", name)));
            }
        }

        if !(5..=300).contains(&self.transport.keepalive) {
            return Err(ConfigError::Validation(
                "transport.keepalive must be within 5-300 seconds".to_string(),
            ));
        }
        if self.transport.reconnect_min_delay < Duration::from_millis(100) {
            return Err(ConfigError::Validation(
                "transport.reconnect_min_delay must be at least 100ms".to_string(),
            ));
        }
        if self.transport.reconnect_max_delay < Duration::from_secs(1) {
            return Err(ConfigError::Validation(
                "transport.reconnect_max_delay must be at least 1s".to_string(),
            ));
        }
        if self.transport.reconnect_max_delay < self.transport.reconnect_min_delay {
            return Err(ConfigError::Validation(
                "transport.reconnect_max_delay must not be below reconnect_min_delay".to_string(),
            ));
        }
        if self.transport.token_refresh_lead < Duration::from_secs(10) {
            return Err(ConfigError::Validation(
                "transport.token_refresh_lead must be at least 10s".to_string(),
            ));
        }

        if self.dispatcher.maxlen == 0 {
            return Err(ConfigError::Validation(
                "dispatcher.maxlen must be positive".to_string(),
            ));
        }
        if !(self.dispatcher.ema_alpha > 0.0 && self.dispatcher.ema_alpha <= 1.0) {
            return Err(ConfigError::Validation(
                "dispatcher.ema_alpha must be in (0, 1]".to_string(),
            ));
        }
        if !(self.dispatcher.drop_warning_threshold > 0.0
            && self.dispatcher.drop_warning_threshold <= 1.0)
        {
            return Err(ConfigError::Validation(
                "dispatcher.drop_warning_threshold must be in (0, 1]".to_string(),
            ));
        }

        if self.liveness.max_gap_seconds <= 0.0 {
            return Err(ConfigError::Validation(
                "liveness.max_gap_seconds must be positive".to_string(),
            ));
        }
        for (symbol, gap) in &self.liveness.per_symbol_max_gap {
            if *gap <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "liveness.per_symbol_max_gap entry '{}' must be positive",
                    symbol
                )));
            }
        }

        Ok(())
    }
}
