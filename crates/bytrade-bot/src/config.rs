//! Application configuration.

use crate::error::{AppError, AppResult};
use bytrade_core::{Credential, OrderSide, Size, Topic};
use bytrade_executor::{
    Category, GatewayConfig, RestConfig, MAINNET_REST_URL, TESTNET_REST_URL,
};
use bytrade_ws::{SessionConfig, TransportConfig, ORDER_TOPIC};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const MAINNET_WS_URL: &str = "wss://stream.bybit.com/v5/private";
pub const TESTNET_WS_URL: &str = "wss://stream-testnet.bybit.com/v5/private";

/// Default config path when neither `--config` nor `BYTRADE_CONFIG` is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Exchange-imposed bounds on the auth handshake expiry window.
const MIN_AUTH_EXPIRY_WINDOW_MS: u64 = 60_000;
const MAX_AUTH_EXPIRY_WINDOW_MS: u64 = 600_000;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Use testnet endpoints. Also enabled by `TESTNET=true`.
    #[serde(default)]
    pub testnet: bool,
    /// Overrides the REST endpoint chosen by `testnet`.
    #[serde(default)]
    pub rest_url: Option<String>,
    /// Overrides the private stream endpoint chosen by `testnet`.
    #[serde(default)]
    pub ws_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Environment variable holding the API secret.
    #[serde(default = "default_api_secret_env")]
    pub api_secret_env: String,
    #[serde(default)]
    pub category: Category,
    /// Account queried for the startup balance report.
    #[serde(default = "default_account_type")]
    pub account_type: String,
    /// Topics subscribed in addition to `order`.
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub websocket: WsConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub rest: RestSettings,
    #[serde(default)]
    pub orders: OrderSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
    /// Recurring market orders (dollar-cost averaging).
    #[serde(default)]
    pub recurring: Vec<RecurringOrderConfig>,
}

fn default_api_key_env() -> String {
    "API_KEY".to_string()
}

fn default_api_secret_env() -> String {
    "API_SECRET".to_string()
}

fn default_account_type() -> String {
    "UNIFIED".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            testnet: false,
            rest_url: None,
            ws_url: None,
            api_key_env: default_api_key_env(),
            api_secret_env: default_api_secret_env(),
            category: Category::default(),
            account_type: default_account_type(),
            topics: Vec::new(),
            websocket: WsConfig::default(),
            session: SessionSettings::default(),
            rest: RestSettings::default(),
            orders: OrderSettings::default(),
            metrics: MetricsSettings::default(),
            recurring: Vec::new(),
        }
    }
}

/// Stream connection tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsConfig {
    /// Maximum consecutive reconnection attempts (0 = infinite).
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_reconnect_jitter_ms")]
    pub reconnect_jitter_ms: u64,
    /// A connection that lived this long resets the backoff.
    #[serde(default = "default_stability_threshold_ms")]
    pub stability_threshold_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}

fn default_reconnect_jitter_ms() -> u64 {
    1_000
}

fn default_stability_threshold_ms() -> u64 {
    30_000
}

fn default_heartbeat_interval_ms() -> u64 {
    20_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 0,
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_jitter_ms: default_reconnect_jitter_ms(),
            stability_threshold_ms: default_stability_threshold_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
        }
    }
}

impl From<WsConfig> for TransportConfig {
    fn from(cfg: WsConfig) -> Self {
        Self {
            url: String::new(), // Set separately
            max_reconnect_attempts: cfg.max_reconnect_attempts,
            reconnect_base_delay_ms: cfg.reconnect_base_delay_ms,
            reconnect_max_delay_ms: cfg.reconnect_max_delay_ms,
            reconnect_jitter_ms: cfg.reconnect_jitter_ms,
            stability_threshold_ms: cfg.stability_threshold_ms,
            heartbeat_interval_ms: cfg.heartbeat_interval_ms,
            heartbeat_timeout_ms: cfg.heartbeat_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Handshake expiry is `now + auth_expiry_window_ms`.
    #[serde(default = "default_auth_expiry_window_ms")]
    pub auth_expiry_window_ms: u64,
}

fn default_auth_expiry_window_ms() -> u64 {
    60_000
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            auth_expiry_window_ms: default_auth_expiry_window_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestSettings {
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_recv_window_ms() -> u64 {
    5_000
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl Default for RestSettings {
    fn default() -> Self {
        Self {
            recv_window_ms: default_recv_window_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSettings {
    /// Delay before retrying a transient REST failure once.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// How long terminal orders stay queryable.
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_retention_ms() -> u64 {
    300_000
}

impl Default for OrderSettings {
    fn default() -> Self {
        Self {
            retry_backoff_ms: default_retry_backoff_ms(),
            retention_ms: default_retention_ms(),
        }
    }
}

/// Prometheus scrape endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

/// A market order placed every `interval_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringOrderConfig {
    pub symbol: String,
    #[serde(default = "default_recurring_side")]
    pub side: OrderSide,
    pub quantity: Size,
    pub interval_ms: u64,
}

fn default_recurring_side() -> OrderSide {
    OrderSide::Buy
}

impl AppConfig {
    /// Load from `BYTRADE_CONFIG` or the default path, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> AppResult<Self> {
        let config_path =
            std::env::var("BYTRADE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        if Path::new(&config_path).exists() {
            Self::from_file(&config_path)
        } else {
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
            let mut config = Self::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load from a specific file, apply environment overrides and validate.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;

        let mut config = Self::from_toml(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        toml::from_str(content).map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_testnet_flag(std::env::var("TESTNET").ok().as_deref());
    }

    /// `TESTNET=true` enables testnet; any other value leaves the file's choice.
    pub fn apply_testnet_flag(&mut self, value: Option<&str>) {
        if value.is_some_and(|v| v.eq_ignore_ascii_case("true")) {
            self.testnet = true;
        }
    }

    /// Reject values the components cannot work with.
    pub fn validate(&self) -> AppResult<()> {
        let window = self.session.auth_expiry_window_ms;
        if !(MIN_AUTH_EXPIRY_WINDOW_MS..=MAX_AUTH_EXPIRY_WINDOW_MS).contains(&window) {
            return Err(AppError::Config(format!(
                "session.auth_expiry_window_ms must be within \
                 [{MIN_AUTH_EXPIRY_WINDOW_MS}, {MAX_AUTH_EXPIRY_WINDOW_MS}], got {window}"
            )));
        }

        let ws = &self.websocket;
        if ws.reconnect_base_delay_ms == 0 {
            return Err(AppError::Config(
                "websocket.reconnect_base_delay_ms must be > 0".to_string(),
            ));
        }
        if ws.reconnect_max_delay_ms < ws.reconnect_base_delay_ms {
            return Err(AppError::Config(format!(
                "websocket.reconnect_max_delay_ms ({}) must be >= reconnect_base_delay_ms ({})",
                ws.reconnect_max_delay_ms, ws.reconnect_base_delay_ms
            )));
        }
        if ws.heartbeat_interval_ms == 0 || ws.heartbeat_timeout_ms == 0 {
            return Err(AppError::Config(
                "websocket heartbeat interval and timeout must be > 0".to_string(),
            ));
        }

        if self.rest.recv_window_ms == 0 || self.rest.timeout_ms == 0 {
            return Err(AppError::Config(
                "rest.recv_window_ms and rest.timeout_ms must be > 0".to_string(),
            ));
        }

        for topic in &self.topics {
            Topic::new(topic.as_str())
                .map_err(|e| AppError::Config(format!("Invalid topic '{topic}': {e}")))?;
        }

        for (i, job) in self.recurring.iter().enumerate() {
            if job.symbol.trim().is_empty() {
                return Err(AppError::Config(format!("recurring[{i}]: symbol is empty")));
            }
            if !job.quantity.is_positive() {
                return Err(AppError::Config(format!(
                    "recurring[{i}]: quantity must be > 0, got {}",
                    job.quantity
                )));
            }
            if job.interval_ms == 0 {
                return Err(AppError::Config(format!(
                    "recurring[{i}]: interval_ms must be > 0"
                )));
            }
        }

        Ok(())
    }

    pub fn rest_base_url(&self) -> String {
        match &self.rest_url {
            Some(url) => url.clone(),
            None if self.testnet => TESTNET_REST_URL.to_string(),
            None => MAINNET_REST_URL.to_string(),
        }
    }

    pub fn stream_url(&self) -> String {
        match &self.ws_url {
            Some(url) => url.clone(),
            None if self.testnet => TESTNET_WS_URL.to_string(),
            None => MAINNET_WS_URL.to_string(),
        }
    }

    /// Read the API credential from the configured environment variables.
    pub fn credential(&self) -> AppResult<Credential> {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| AppError::Config(format!("Environment variable {name} is not set")))
        };
        let key = read(&self.api_key_env)?;
        let secret = read(&self.api_secret_env)?;
        Ok(Credential::new(key, secret))
    }

    pub fn transport_config(&self) -> TransportConfig {
        let mut config: TransportConfig = self.websocket.clone().into();
        config.url = self.stream_url();
        config
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            auth_expiry_window_ms: self.session.auth_expiry_window_ms,
        }
    }

    pub fn rest_config(&self) -> RestConfig {
        RestConfig {
            base_url: self.rest_base_url(),
            recv_window_ms: self.rest.recv_window_ms,
            timeout: Duration::from_millis(self.rest.timeout_ms),
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            category: self.category,
            retry_backoff: Duration::from_millis(self.orders.retry_backoff_ms),
            retention: Duration::from_millis(self.orders.retention_ms),
        }
    }

    /// `order` followed by the configured topics, deduplicated.
    pub fn subscription_topics(&self) -> AppResult<Vec<Topic>> {
        let mut topics = vec![Topic::new(ORDER_TOPIC)?];
        for name in &self.topics {
            let topic = Topic::new(name.as_str())?;
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }
        Ok(topics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    const SAMPLE: &str = r#"
testnet = true
category = "spot"
topics = ["orderbook.1.BTCUSDT", "publicTrade.BTCUSDT", "order"]

[websocket]
heartbeat_interval_ms = 15000

[session]
auth_expiry_window_ms = 600000

[metrics]
enabled = true

[[recurring]]
symbol = "ETHUSDT"
quantity = "0.01"
interval_ms = 10000
"#;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_ok!(config.validate());
        assert_eq!(config.rest_base_url(), MAINNET_REST_URL);
        assert_eq!(config.stream_url(), MAINNET_WS_URL);
        assert_eq!(config.api_key_env, "API_KEY");
        assert_eq!(config.category, Category::Spot);
        assert!(config.recurring.is_empty());
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_parse_sample() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        assert_ok!(config.validate());
        assert_eq!(config.stream_url(), TESTNET_WS_URL);
        assert_eq!(config.rest_base_url(), TESTNET_REST_URL);
        assert_eq!(config.websocket.heartbeat_interval_ms, 15_000);
        // Unset fields keep their defaults
        assert_eq!(config.websocket.heartbeat_timeout_ms, 10_000);
        assert_eq!(config.websocket.reconnect_max_delay_ms, 60_000);
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.port, 9090);

        assert_eq!(
            config.recurring,
            vec![RecurringOrderConfig {
                symbol: "ETHUSDT".to_string(),
                side: OrderSide::Buy,
                quantity: Size::new(dec!(0.01)),
                interval_ms: 10_000,
            }]
        );
    }

    #[test]
    fn test_shipped_default_file() {
        let config = AppConfig::from_toml(include_str!("../../../config/default.toml")).unwrap();
        assert_ok!(config.validate());
        assert!(!config.testnet);
        assert_eq!(config.recurring.len(), 1);
        assert_eq!(config.recurring[0].quantity, Size::new(dec!(0.01)));
        let topics = config.subscription_topics().unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].as_str(), "order");
    }

    #[test]
    fn test_subscription_topics_order_first_and_deduplicated() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        let topics: Vec<String> = config
            .subscription_topics()
            .unwrap()
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        assert_eq!(
            topics,
            vec!["order", "orderbook.1.BTCUSDT", "publicTrade.BTCUSDT"]
        );
    }

    #[test]
    fn test_explicit_urls_override_testnet() {
        let mut config = AppConfig::from_toml(SAMPLE).unwrap();
        config.ws_url = Some("ws://127.0.0.1:9000".to_string());
        config.rest_url = Some("http://127.0.0.1:9001".to_string());
        assert_eq!(config.transport_config().url, "ws://127.0.0.1:9000");
        assert_eq!(config.rest_config().base_url, "http://127.0.0.1:9001");
    }

    #[test]
    fn test_testnet_flag() {
        let mut config = AppConfig::default();
        config.apply_testnet_flag(Some("false"));
        assert!(!config.testnet);
        config.apply_testnet_flag(None);
        assert!(!config.testnet);
        config.apply_testnet_flag(Some("true"));
        assert!(config.testnet);
    }

    #[test]
    fn test_auth_window_bounds() {
        let mut config = AppConfig::default();
        config.session.auth_expiry_window_ms = 59_999;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
        config.session.auth_expiry_window_ms = 600_001;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
        config.session.auth_expiry_window_ms = 600_000;
        assert_ok!(config.validate());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = AppConfig::default();
        config.websocket.reconnect_max_delay_ms = 10;
        assert_err!(config.validate());

        let mut config = AppConfig::default();
        config.topics = vec!["bad topic".to_string()];
        assert_err!(config.validate());

        let mut config = AppConfig::default();
        config.recurring.push(RecurringOrderConfig {
            symbol: "ETHUSDT".to_string(),
            side: OrderSide::Buy,
            quantity: Size::ZERO,
            interval_ms: 1_000,
        });
        assert_err!(config.validate());

        let mut config = AppConfig::default();
        config.recurring.push(RecurringOrderConfig {
            symbol: "ETHUSDT".to_string(),
            side: OrderSide::Sell,
            quantity: Size::new(dec!(1)),
            interval_ms: 0,
        });
        assert_err!(config.validate());
    }

    #[test]
    fn test_component_configs() {
        let config = AppConfig::default();
        let gateway = config.gateway_config();
        assert_eq!(gateway.retry_backoff, Duration::from_millis(500));
        assert_eq!(gateway.retention, Duration::from_secs(300));
        assert_eq!(config.rest_config().timeout, Duration::from_secs(10));
        assert_eq!(config.session_config().auth_expiry_window_ms, 60_000);

        let transport = config.transport_config();
        assert_eq!(transport.heartbeat_interval_ms, 20_000);
        assert_eq!(transport.stability_threshold_ms, 30_000);
    }

    #[test]
    fn test_config_serialization() {
        let config = AppConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("api_key_env"));
        let parsed = AppConfig::from_toml(&toml_str).unwrap();
        assert_eq!(parsed.account_type, "UNIFIED");
    }
}
