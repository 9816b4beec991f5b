//! # Runtime Configuration
//!
//! Defaults, then an optional JSON file, then individual `TD_*` variables.
//!
//! | Variable | Field |
//! |----------|-------|
//! | `TD_CONFIG_FILE` | JSON `DeliveryConfig` replacing the defaults |
//! | `TD_MAX_CONNECTIONS` | `delivery.max_connections` |
//! | `TD_CLIENT_ID` | `delivery.client_identity` |
//! | `TD_SUBSCRIPTION` | `delivery.subscription_name` |
//! | `TD_TOPIC` | `delivery.topic` |
//! | `TD_ACQUIRE_TIMEOUT_MS` | `delivery.acquire_timeout_ms` |
//! | `TD_RECEIVE_TIMEOUT_MS` | `delivery.receive_timeout_ms` |
//! | `TD_RETRY_ATTEMPTS` | `delivery.retry.max_attempts` |
//! | `TD_MAX_REDELIVERIES` | `broker.max_redeliveries` |
//! | `TD_FAULT_HEADER` | `fault_header` |
//! | `TD_KEEP_RUNNING` | `keep_running` |

use anyhow::{Context, Result};
use shared_bus::BrokerConfig;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};
use tx_delivery::DeliveryConfig;

/// Complete runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub delivery: DeliveryConfig,
    pub broker: BrokerConfig,
    /// Boolean header that makes the handler raise a fault.
    pub fault_header: String,
    /// Keep consuming after the reference scenario until Ctrl+C.
    pub keep_running: bool,
    /// How long the scenario waits for the sink.
    pub scenario_timeout_ms: u64,
    /// Metrics publication period while running.
    pub metrics_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            delivery: DeliveryConfig::default(),
            broker: BrokerConfig::default(),
            fault_header: "isfailed".to_string(),
            keep_running: false,
            scenario_timeout_ms: 5_000,
            metrics_interval_ms: 1_000,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn scenario_timeout(&self) -> Duration {
        Duration::from_millis(self.scenario_timeout_ms)
    }

    #[must_use]
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }
}

/// Load configuration from the process environment.
pub fn load_config() -> Result<RuntimeConfig> {
    load_config_from(|key| std::env::var(key).ok())
}

/// Load configuration from an arbitrary variable source.
pub fn load_config_from(lookup: impl Fn(&str) -> Option<String>) -> Result<RuntimeConfig> {
    let mut config = RuntimeConfig::default();

    if let Some(path) = lookup("TD_CONFIG_FILE") {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {path}"))?;
        config.delivery = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {path}"))?;
        info!(path = %path, "Loaded delivery config from file");
    }

    let delivery = &mut config.delivery;
    override_parsed(&lookup, "TD_MAX_CONNECTIONS", &mut delivery.max_connections);
    override_string(&lookup, "TD_CLIENT_ID", &mut delivery.client_identity);
    override_string(&lookup, "TD_SUBSCRIPTION", &mut delivery.subscription_name);
    override_string(&lookup, "TD_TOPIC", &mut delivery.topic);
    override_parsed(&lookup, "TD_ACQUIRE_TIMEOUT_MS", &mut delivery.acquire_timeout_ms);
    override_parsed(&lookup, "TD_RECEIVE_TIMEOUT_MS", &mut delivery.receive_timeout_ms);
    override_parsed(&lookup, "TD_RETRY_ATTEMPTS", &mut delivery.retry.max_attempts);
    override_parsed(&lookup, "TD_MAX_REDELIVERIES", &mut config.broker.max_redeliveries);
    override_string(&lookup, "TD_FAULT_HEADER", &mut config.fault_header);
    if let Some(value) = lookup("TD_KEEP_RUNNING") {
        config.keep_running = value.to_lowercase() == "true" || value == "1";
    }

    config
        .delivery
        .validate()
        .context("Invalid delivery configuration")?;
    Ok(config)
}

fn override_string(lookup: &impl Fn(&str) -> Option<String>, key: &str, field: &mut String) {
    if let Some(value) = lookup(key) {
        *field = value;
    }
}

fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, field: &mut T) {
    if let Some(value) = lookup(key) {
        match value.parse() {
            Ok(parsed) => *field = parsed,
            Err(_) => warn!(variable = key, value = %value, "Ignoring unparseable override"),
        }
    }
}
