//! Grid bot configuration
//!
//! Trading parameters come from a YAML file; API credentials and the
//! database URL come from the environment (optionally via `.env`).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::infrastructure::exchange::RetryPolicy;
use crate::infrastructure::stream::{ExponentialBackoff, StreamConfig};

/// Exchanges with an adapter in this crate
pub const SUPPORTED_EXCHANGES: &[&str] = &["binance"];

/// Lower bound for the reconcile spacing, in seconds
pub const MIN_RECONCILE_INTERVAL_FLOOR_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config file: {0}")]
    FileError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarMissing(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration: one process, any number of trading instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub instances: Vec<InstanceConfig>,
    #[serde(default)]
    pub reconcile: ReconcileSettings,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// One exchange/symbol pair traded by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Exchange adapter name (see [`SUPPORTED_EXCHANGES`])
    pub exchange: String,
    pub symbol: String,
    #[serde(default)]
    pub testnet: bool,
    /// REST endpoint override
    #[serde(default)]
    pub rest_url: Option<String>,
    /// WebSocket endpoint override
    #[serde(default)]
    pub ws_url: Option<String>,
    pub grid: GridParams,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    /// Cooldown after a margin rejection before placing again
    #[serde(default = "default_margin_pause_secs")]
    pub margin_pause_secs: u64,
    /// Cancel every open order of the symbol on shutdown
    #[serde(default = "default_true")]
    pub cancel_on_exit: bool,
    /// Env var holding the API key; defaults to `<EXCHANGE>_API_KEY`
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Env var holding the API secret; defaults to `<EXCHANGE>_API_SECRET`
    #[serde(default)]
    pub api_secret_env: Option<String>,

    /// API key from the environment (not in YAML)
    #[serde(skip)]
    pub api_key: String,

    /// API secret from the environment (not in YAML)
    #[serde(skip)]
    pub api_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridParams {
    pub price_interval: f64,
    pub order_quantity: f64,
    pub buy_window_size: usize,
    pub sell_window_size: usize,
    /// Fixed anchor, kept as text so its decimal places survive. When absent
    /// the first price tick anchors the grid.
    #[serde(default)]
    pub anchor_price: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Timer period
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
    /// Minimum spacing between two rounds; never below 30s
    #[serde(default = "default_min_reconcile_interval")]
    pub min_interval_secs: u64,
    /// Position drift tolerated without a warning
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_reconcile_interval(),
            min_interval_secs: default_min_reconcile_interval(),
            epsilon: default_epsilon(),
            lock_ttl_secs: default_lock_ttl(),
        }
    }
}

/// Retry, throttle and reconnect settings shared by every adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default = "default_min_poll_interval_ms")]
    pub min_poll_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Longest single wait on an exchange-reported ban
    #[serde(default = "default_max_ban_wait_secs")]
    pub max_ban_wait_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// Reconnect back-off ceiling
    #[serde(default = "default_max_reconnect_delay_secs")]
    pub max_reconnect_delay_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Unanswered ping age that marks a stream dead
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            min_poll_interval_ms: default_min_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            max_ban_wait_secs: default_max_ban_wait_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            max_reconnect_delay_secs: default_max_reconnect_delay_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
        }
    }
}

impl ResilienceConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_backoff_ms),
            max_delay: Duration::from_secs(self.max_backoff_secs),
            max_ban_wait: Duration::from_secs(self.max_ban_wait_secs),
            ..RetryPolicy::default()
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            reconnect: Arc::new(ExponentialBackoff::new(
                Duration::from_secs(self.reconnect_delay_secs),
                Duration::from_secs(self.max_reconnect_delay_secs.max(self.reconnect_delay_secs)),
                None,
            )),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs),
        }
    }

    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_millis(self.min_poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Pre-flight check thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: u32,
    #[serde(default = "default_maker_fee_rate")]
    pub maker_fee_rate: f64,
    /// Multiplier applied to the margin the buy window needs
    #[serde(default = "default_margin_buffer")]
    pub margin_buffer: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_leverage: default_max_leverage(),
            maker_fee_rate: default_maker_fee_rate(),
            margin_buffer: default_margin_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
}

impl DatabaseConfig {
    pub fn is_configured(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_leverage() -> u32 {
    1
}

fn default_margin_pause_secs() -> u64 {
    60
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_min_reconcile_interval() -> u64 {
    MIN_RECONCILE_INTERVAL_FLOOR_SECS
}

fn default_epsilon() -> f64 {
    1e-6
}

fn default_lock_ttl() -> u64 {
    30
}

fn default_min_poll_interval_ms() -> u64 {
    200
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_max_ban_wait_secs() -> u64 {
    300
}

fn default_max_reconnect_delay_secs() -> u64 {
    60
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_pong_timeout_secs() -> u64 {
    90
}

fn default_max_leverage() -> u32 {
    20
}

fn default_maker_fee_rate() -> f64 {
    0.0002
}

fn default_margin_buffer() -> f64 {
    1.2
}

impl InstanceConfig {
    /// Identifier used in logs and lock keys
    pub fn label(&self) -> String {
        format!("{}:{}", self.exchange, self.symbol)
    }

    pub fn api_key_var(&self) -> String {
        self.api_key_env
            .clone()
            .unwrap_or_else(|| format!("{}_API_KEY", self.exchange.to_uppercase()))
    }

    pub fn api_secret_var(&self) -> String {
        self.api_secret_env
            .clone()
            .unwrap_or_else(|| format!("{}_API_SECRET", self.exchange.to_uppercase()))
    }

    /// Parsed fixed anchor, if configured
    pub fn anchor_price(&self) -> Option<f64> {
        self.grid
            .anchor_price
            .as_deref()
            .and_then(|s| s.trim().parse::<f64>().ok())
    }

    fn load_credentials(&mut self) -> Result<()> {
        let key_var = self.api_key_var();
        let secret_var = self.api_secret_var();

        self.api_key =
            std::env::var(&key_var).map_err(|_| ConfigError::EnvVarMissing(key_var.clone()))?;
        self.api_secret = std::env::var(&secret_var)
            .map_err(|_| ConfigError::EnvVarMissing(secret_var.clone()))?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let label = self.label();

        if !SUPPORTED_EXCHANGES.contains(&self.exchange.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "{}: exchange must be one of: {}",
                label,
                SUPPORTED_EXCHANGES.join(", ")
            )));
        }

        if self.symbol.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "{}: symbol cannot be empty",
                label
            )));
        }

        if !(self.grid.price_interval > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "{}: price_interval must be greater than 0",
                label
            )));
        }

        if !(self.grid.order_quantity > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "{}: order_quantity must be greater than 0",
                label
            )));
        }

        if self.grid.buy_window_size == 0 || self.grid.sell_window_size == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{}: buy_window_size and sell_window_size must be at least 1",
                label
            )));
        }

        if self.grid.anchor_price.is_some() {
            match self.anchor_price() {
                Some(p) if p > 0.0 => {}
                _ => {
                    return Err(ConfigError::ValidationError(format!(
                        "{}: anchor_price must be a positive number",
                        label
                    )))
                }
            }
        }

        if self.leverage == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{}: leverage must be at least 1",
                label
            )));
        }

        Ok(())
    }
}

impl GridConfig {
    /// Load configuration from YAML file and .env
    pub fn load(config_path: impl AsRef<Path>) -> Result<Self> {
        let yaml_content = std::fs::read_to_string(config_path)?;

        // Don't fail if .env doesn't exist
        dotenv::dotenv().ok();

        let mut config = Self::from_yaml(&yaml_content)?;

        for instance in &mut config.instances {
            instance.load_credentials()?;
        }

        // Override database URL from environment if present
        if let Ok(db_url) = std::env::var("DATABASE_URL") {
            info!("Overriding database URL from environment variable");
            config.database.url = db_url;
        }

        Ok(config)
    }

    /// Parse, normalize and validate YAML text. Credentials are not touched.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: GridConfig = serde_yaml::from_str(yaml)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        if self.reconcile.min_interval_secs < MIN_RECONCILE_INTERVAL_FLOOR_SECS {
            warn!(
                "reconcile.min_interval_secs={} is below the {}s floor, using {}s",
                self.reconcile.min_interval_secs,
                MIN_RECONCILE_INTERVAL_FLOOR_SECS,
                MIN_RECONCILE_INTERVAL_FLOOR_SECS
            );
            self.reconcile.min_interval_secs = MIN_RECONCILE_INTERVAL_FLOOR_SECS;
        }

        for instance in &mut self.instances {
            instance.exchange = instance.exchange.to_lowercase();
            instance.symbol = instance.symbol.to_uppercase();
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "log_level must be one of: {}",
                valid_levels.join(", ")
            )));
        }

        if self.instances.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one instance must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for instance in &self.instances {
            instance.validate()?;
            if !seen.insert(instance.label()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate instance {}",
                    instance.label()
                )));
            }
        }

        if self.reconcile.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "reconcile.interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.reconcile.epsilon < 0.0 {
            return Err(ConfigError::ValidationError(
                "reconcile.epsilon cannot be negative".to_string(),
            ));
        }

        if self.reconcile.lock_ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "reconcile.lock_ttl_secs must be greater than 0".to_string(),
            ));
        }

        if self.resilience.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "resilience.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.safety.margin_buffer < 1.0 {
            return Err(ConfigError::ValidationError(
                "safety.margin_buffer must be at least 1.0".to_string(),
            ));
        }

        Ok(())
    }

    /// Log configuration summary
    pub fn log(&self) {
        info!("Configuration loaded:");
        info!("  Log level: {}", self.log_level);
        info!("  Instances: {}", self.instances.len());
        for instance in &self.instances {
            info!(
                "    {} | interval {} | qty {} | window -{}/+{} | leverage {}x{}",
                instance.label(),
                instance.grid.price_interval,
                instance.grid.order_quantity,
                instance.grid.buy_window_size,
                instance.grid.sell_window_size,
                instance.leverage,
                if instance.testnet { " | testnet" } else { "" }
            );
        }
        info!(
            "  Reconcile: every {}s (min {}s), epsilon {}, lock ttl {}s{}",
            self.reconcile.interval_secs,
            self.reconcile.min_interval_secs,
            self.reconcile.epsilon,
            self.reconcile.lock_ttl_secs,
            if self.reconcile.enabled { "" } else { " (disabled)" }
        );
        info!(
            "  Resilience: poll spacing {}ms, {} attempts, backoff cap {}s",
            self.resilience.min_poll_interval_ms,
            self.resilience.max_attempts,
            self.resilience.max_backoff_secs
        );
        info!(
            "  Database: {}",
            if self.database.is_configured() {
                "configured"
            } else {
                "none (in-process lock, no audit history)"
            }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
log_level: debug
instances:
  - exchange: Binance
    symbol: btcusdt
    grid:
      price_interval: 100.0
      order_quantity: 0.001
      buy_window_size: 5
      sell_window_size: 5
      anchor_price: "50000.00"
reconcile:
  interval_secs: 60
  min_interval_secs: 10
"#;

    #[test]
    fn test_parse_applies_defaults_and_floor() {
        let config = GridConfig::from_yaml(SAMPLE).unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.instances.len(), 1);

        let instance = &config.instances[0];
        assert_eq!(instance.exchange, "binance");
        assert_eq!(instance.symbol, "BTCUSDT");
        assert_eq!(instance.leverage, 1);
        assert!(instance.cancel_on_exit);
        assert_eq!(instance.anchor_price(), Some(50000.0));
        assert_eq!(instance.api_key_var(), "BINANCE_API_KEY");

        // below the floor is raised, not rejected
        assert_eq!(config.reconcile.min_interval_secs, 30);
        assert_eq!(config.reconcile.lock_ttl_secs, 30);
        assert_eq!(config.resilience.min_poll_interval_ms, 200);
        assert_eq!(config.resilience.max_backoff_secs, 60);
        assert_eq!(
            config.resilience.retry_policy().max_ban_wait,
            Duration::from_secs(300)
        );
        let stream = config.resilience.stream_config();
        assert_eq!(stream.reconnect.next_delay(0), Some(Duration::from_secs(5)));
        assert_eq!(stream.reconnect.next_delay(10), Some(Duration::from_secs(60)));
        assert_eq!(stream.pong_timeout, Duration::from_secs(90));
        assert!(!config.database.is_configured());
    }

    #[test]
    fn test_config_validation() {
        let mut config = GridConfig::from_yaml(SAMPLE).unwrap();
        assert!(config.validate().is_ok());

        // Test invalid interval
        config.instances[0].grid.price_interval = 0.0;
        assert!(config.validate().is_err());
        config.instances[0].grid.price_interval = 100.0;

        // Test unsupported exchange
        config.instances[0].exchange = "kraken".to_string();
        assert!(config.validate().is_err());
        config.instances[0].exchange = "binance".to_string();

        // Test duplicate instance
        let dup = config.instances[0].clone();
        config.instances.push(dup);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
        config.instances.pop();

        // Test invalid log level
        config.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_anchor() {
        let yaml = SAMPLE.replace("\"50000.00\"", "\"abc\"");
        assert!(GridConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_load_reads_credentials_from_env() {
        let yaml = SAMPLE.replace(
            "    symbol: btcusdt\n",
            "    symbol: btcusdt\n    api_key_env: GRIDCORE_CFG_TEST_KEY\n    api_secret_env: GRIDCORE_CFG_TEST_SECRET\n",
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        std::env::set_var("GRIDCORE_CFG_TEST_KEY", "key-123");
        std::env::set_var("GRIDCORE_CFG_TEST_SECRET", "secret-456");

        let config = GridConfig::load(file.path()).unwrap();
        assert_eq!(config.instances[0].api_key, "key-123");
        assert_eq!(config.instances[0].api_secret, "secret-456");
    }

    #[test]
    fn test_load_fails_without_credentials() {
        let yaml = SAMPLE.replace(
            "    symbol: btcusdt\n",
            "    symbol: btcusdt\n    api_key_env: GRIDCORE_CFG_MISSING_KEY\n    api_secret_env: GRIDCORE_CFG_MISSING_SECRET\n",
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        match GridConfig::load(file.path()) {
            Err(ConfigError::EnvVarMissing(var)) => assert_eq!(var, "GRIDCORE_CFG_MISSING_KEY"),
            other => panic!("expected EnvVarMissing, got {:?}", other.map(|_| ())),
        }
    }
}
