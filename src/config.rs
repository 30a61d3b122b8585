use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::info;
use validator::Validate;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_CACHE_TYPE: &str = "in-memory";
const DEFAULT_CART_TTL_DAYS: i64 = 30;
const DEFAULT_CHECKOUT_SESSION_TTL_SECS: u64 = 1800;
const DEFAULT_MAX_PAYMENT_ATTEMPTS: u64 = 3;
const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 30;

/// Cache configuration
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct CacheConfig {
    /// "in-memory" or "redis"
    #[serde(default = "default_cache_type")]
    pub cache_type: String,

    /// Redis connection URL for the cache backend
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_type: default_cache_type(),
            redis_url: default_redis_url(),
        }
    }
}

/// Credentials and connection settings for one payment gateway.
///
/// `secret_key` must be non-empty before the gateway is constructed;
/// the registry rejects the provider with `MissingGatewayConfiguration`
/// otherwise.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct GatewaySettings {
    /// Registry identity, e.g. "pse-main" or "cards-main"
    pub id: String,
    /// Provider implementation: "pse" (bank redirect) or "cards"
    /// (tokenized cards)
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub base_url: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub webhook_secret: String,
    /// ISO currency codes this provider settles in
    #[serde(default = "default_currencies")]
    pub currencies: Vec<String>,
    /// Amount window this provider accepts; open-ended when absent
    #[serde(default)]
    pub min_amount: Option<f64>,
    #[serde(default)]
    pub max_amount: Option<f64>,
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Redis connection URL
    pub redis_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB connect timeout (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    /// Store currency (ISO 4217)
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Flat tax rate applied at order freeze
    #[serde(default = "default_tax_rate")]
    pub default_tax_rate: f64,

    /// Flat shipping rate below the free-shipping threshold
    #[serde(default = "default_shipping_flat_rate")]
    pub shipping_flat_rate: f64,

    /// Subtotal at or above which shipping is free
    #[serde(default = "default_free_shipping_threshold")]
    pub free_shipping_threshold: f64,

    /// Rolling cart expiry window in days
    #[serde(default = "default_cart_ttl_days")]
    pub cart_ttl_days: i64,

    /// Checkout session TTL in seconds (cache eviction is the enforcer)
    #[serde(default = "default_checkout_session_ttl_secs")]
    pub checkout_session_ttl_secs: u64,

    /// Cross-row payment attempt cap per order
    #[serde(default = "default_max_payment_attempts")]
    pub max_payment_attempts: u64,

    /// HTTP timeout for gateway calls (seconds)
    #[serde(default = "default_gateway_timeout_secs")]
    pub gateway_timeout_secs: u64,

    /// Event channel capacity
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Payment gateway credentials, one entry per provider
    #[serde(default)]
    pub gateways: Vec<GatewaySettings>,

    /// Payment-method-kind -> gateway id routing table
    /// (e.g. "pse" -> "pse", "credit_card" -> "cards")
    #[serde(default)]
    pub gateway_routing: HashMap<String, String>,
}

impl AppConfig {
    /// Creates a configuration from the minimum required settings,
    /// with everything else defaulted. Used by tests.
    pub fn new(
        database_url: String,
        redis_url: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            redis_url: redis_url.clone(),
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            cache: CacheConfig {
                redis_url,
                ..Default::default()
            },
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            currency: default_currency(),
            default_tax_rate: default_tax_rate(),
            shipping_flat_rate: default_shipping_flat_rate(),
            free_shipping_threshold: default_free_shipping_threshold(),
            cart_ttl_days: default_cart_ttl_days(),
            checkout_session_ttl_secs: default_checkout_session_ttl_secs(),
            max_payment_attempts: default_max_payment_attempts(),
            gateway_timeout_secs: default_gateway_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            gateways: Vec::new(),
            gateway_routing: HashMap::new(),
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development" || self.environment == "test"
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_cache_type() -> String {
    DEFAULT_CACHE_TYPE.to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_db_max_connections() -> u32 {
    20
}

fn default_db_min_connections() -> u32 {
    2
}

fn default_db_connect_timeout_secs() -> u64 {
    10
}

fn default_currency() -> String {
    "COP".to_string()
}

fn default_tax_rate() -> f64 {
    0.0
}

fn default_shipping_flat_rate() -> f64 {
    0.0
}

fn default_free_shipping_threshold() -> f64 {
    0.0
}

fn default_cart_ttl_days() -> i64 {
    DEFAULT_CART_TTL_DAYS
}

fn default_checkout_session_ttl_secs() -> u64 {
    DEFAULT_CHECKOUT_SESSION_TTL_SECS
}

fn default_max_payment_attempts() -> u64 {
    DEFAULT_MAX_PAYMENT_ATTEMPTS
}

fn default_gateway_timeout_secs() -> u64 {
    DEFAULT_GATEWAY_TIMEOUT_SECS
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_currencies() -> Vec<String> {
    vec![default_currency()]
}

/// Initializes the tracing subscriber.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default_directive = format!("storefront_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::try_new(filter_directive)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

/// Loads configuration from config/{default,<env>}.toml plus `APP__`
/// environment overrides.
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "postgres://localhost/storefront")?
        .set_default("redis_url", "redis://localhost:6379")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;
    app_config.validate()?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig::new(
            "sqlite://storefront.db?mode=memory".into(),
            "redis://127.0.0.1:6379".into(),
            "127.0.0.1".into(),
            8080,
            "test".into(),
        )
    }

    #[test]
    fn defaults_cover_pipeline_policy() {
        let cfg = base_config();
        assert_eq!(cfg.cart_ttl_days, 30);
        assert_eq!(cfg.checkout_session_ttl_secs, 1800);
        assert_eq!(cfg.max_payment_attempts, 3);
        assert!(cfg.is_development());
    }

    #[test]
    fn cache_defaults_to_in_memory() {
        let cfg = base_config();
        assert_eq!(cfg.cache.cache_type, "in-memory");
    }
}
