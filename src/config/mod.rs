use serde::Deserialize;
use std::{fs, path::Path};

#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionConfig {
    /// Comma/whitespace separated broker address list,
    /// e.g. `"mqtcp://a:7676, mqtcp://b:7676"`.
    pub address_list: String,
    /// `"PRIORITY"` or `"RANDOM"`.
    pub address_list_behavior: String,
    /// Times the whole list is retried before giving up. `0` = one pass.
    pub address_list_iterations: u32,
    pub reconnect_delay_ms: u64,
    /// Per-address connect attempts. `0` = single attempt per address.
    pub reconnect_attempts: u32,
    pub ping_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    pub prefetch_limit: usize,
    /// Max messages loaded into one server-session batch.
    pub batch_max_messages: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransactionConfig {
    /// Track prepared-but-unresolved branches for HA commit-status checks.
    pub ha_tracking: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub delivery: DeliveryConfig,
    pub transactions: TransactionConfig,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let raw: String = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&raw)?;
    Ok(config)
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address_list: String::new(),
            address_list_behavior: "PRIORITY".to_string(),
            address_list_iterations: 1,
            reconnect_delay_ms: 3000,
            reconnect_attempts: 0,
            ping_interval_ms: 30_000,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            prefetch_limit: 100,
            batch_max_messages: 10,
        }
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self { ha_tracking: true }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            delivery: DeliveryConfig::default(),
            transactions: TransactionConfig::default(),
        }
    }
}
