use crate::bus::BusAddress;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_PRODUCT_NAME: &str = "Signal K Virtual BMV";
pub const DEFAULT_VENUS_HOST: &str = "venus.local";
pub const DEFAULT_BUS_PORT: u16 = 78;
/// Interval offered by the options schema.
pub const DEFAULT_INTERVAL_MS: u64 = 1000;
/// Interval used when none, zero or a negative one is configured.
pub const FALLBACK_INTERVAL_MS: u64 = 5000;
pub const MIN_INTERVAL_MS: u64 = 100;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Telemetry source paths feeding the emulated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourcePaths {
    pub voltage: String,
    pub current: String,
    pub soc: String,
    pub time_to_go: String,
    pub voltage_starter: String,
}

impl Default for SourcePaths {
    fn default() -> Self {
        Self {
            voltage: "electrical.batteries.0.voltage".to_string(),
            current: "electrical.batteries.0.current".to_string(),
            soc: "electrical.batteries.0.capacity.stateOfCharge".to_string(),
            time_to_go: "electrical.batteries.0.capacity.timeRemaining".to_string(),
            voltage_starter: "electrical.batteries.1.voltage".to_string(),
        }
    }
}

/// Plugin options as the host stores them, e.g.
/// `{"venusHost": "192.168.1.20", "interval": 2000, "paths": {"soc": "..."}}`.
/// Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeOptions {
    pub product_name: String,
    pub venus_host: String,
    pub port: u16,
    /// Milliseconds between samples. Any JSON number is accepted.
    pub interval: Option<f64>,
    pub connect_timeout_ms: u64,
    pub paths: SourcePaths,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            product_name: DEFAULT_PRODUCT_NAME.to_string(),
            venus_host: DEFAULT_VENUS_HOST.to_string(),
            port: DEFAULT_BUS_PORT,
            interval: Some(DEFAULT_INTERVAL_MS as f64),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            paths: SourcePaths::default(),
        }
    }
}

impl BridgeOptions {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::InvalidOptions(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.venus_host.trim().is_empty() {
            return Err(ConfigError::InvalidOptions("venusHost is empty".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidOptions("port must be non-zero".to_string()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidOptions("connectTimeoutMs must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn address(&self) -> BusAddress {
        BusAddress::new(self.venus_host.trim(), self.port)
    }

    /// Sampling period: the configured value floored at [`MIN_INTERVAL_MS`],
    /// or [`FALLBACK_INTERVAL_MS`] when absent or non-positive.
    pub fn sample_interval(&self) -> Duration {
        match self.interval {
            Some(ms) if ms.is_finite() && ms > 0.0 => {
                Duration::from_millis((ms.round() as u64).max(MIN_INTERVAL_MS))
            }
            _ => Duration::from_millis(FALLBACK_INTERVAL_MS),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
