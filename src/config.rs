//! Configuration module for the order-flow recorder

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{RecorderError, Result};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Products to record (e.g., ["BTC-USD", "ETH-USD"])
    pub products: Vec<String>,

    /// WebSocket endpoint of the full-detail feed
    pub ws_endpoint: String,

    /// REST API endpoint for level-3 snapshots
    pub rest_endpoint: String,

    /// Storage connection string
    pub database_url: String,

    /// Pool size, never below two
    pub db_max_connections: u32,

    /// Number of events that triggers a flush
    pub batch_size: usize,

    /// Age after which a non-empty partial batch is handed off anyway
    pub flush_interval_ms: u64,

    /// Depth of the batch hand-off channel
    pub channel_capacity: usize,

    /// Whole-batch retries before the persister halts
    pub flush_max_retries: u32,

    /// Bounded socket read timeout
    pub read_timeout_secs: u64,

    /// Reconnection settings
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,

    /// Resynchronize when the feed skips a sequence number
    pub resync_on_gap: bool,

    /// Port of the health/metrics server
    pub health_port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let products: Vec<String> = env::var("PRODUCTS")
            .unwrap_or_else(|_| "BTC-USD,ETH-USD".to_string())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let defaults = Self::default();
        let config = Self {
            products,
            ws_endpoint: env::var("WS_ENDPOINT").unwrap_or(defaults.ws_endpoint),
            rest_endpoint: env::var("REST_ENDPOINT").unwrap_or(defaults.rest_endpoint),
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", defaults.db_max_connections)
                .max(2),
            batch_size: parse_var("BATCH_SIZE", defaults.batch_size),
            flush_interval_ms: parse_var("FLUSH_INTERVAL_MS", defaults.flush_interval_ms),
            channel_capacity: parse_var("CHANNEL_CAPACITY", defaults.channel_capacity),
            flush_max_retries: parse_var("FLUSH_MAX_RETRIES", defaults.flush_max_retries),
            read_timeout_secs: parse_var("READ_TIMEOUT_SECS", defaults.read_timeout_secs),
            reconnect_delay_ms: parse_var("RECONNECT_DELAY_MS", defaults.reconnect_delay_ms),
            max_reconnect_attempts: parse_var(
                "MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            resync_on_gap: parse_var("RESYNC_ON_GAP", defaults.resync_on_gap),
            health_port: parse_var("HEALTH_PORT", defaults.health_port),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.products.is_empty() {
            return Err(RecorderError::ConfigError(
                "at least one product is required".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(RecorderError::ConfigError(
                "BATCH_SIZE must be positive".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(RecorderError::ConfigError(
                "CHANNEL_CAPACITY must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            products: vec!["BTC-USD".to_string(), "ETH-USD".to_string()],
            ws_endpoint: "wss://ws-feed.exchange.coinbase.com".to_string(),
            rest_endpoint: "https://api.exchange.coinbase.com".to_string(),
            database_url: "sqlite://orderflow.db?mode=rwc".to_string(),
            db_max_connections: default_pool_size(),
            batch_size: 1000,
            flush_interval_ms: 5000,
            channel_capacity: 8,
            flush_max_retries: 3,
            read_timeout_secs: 30,
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: 0,
            resync_on_gap: true,
            health_port: 9090,
        }
    }
}

/// Half the available cores, but at least two connections
fn default_pool_size() -> u32 {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    cpus.div_ceil(2).max(2)
}

fn parse_var<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.db_max_connections >= 2);
    }

    #[test]
    fn test_validate_rejects_empty_products() {
        let config = Config {
            products: vec![],
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RecorderError::ConfigError(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = Config {
            batch_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
