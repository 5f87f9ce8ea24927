//! Fabric configuration.
//!
//! Every section falls back to its defaults, so a config file only needs the
//! values it changes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    pub smartbeat: SmartbeatConfig,
    pub monitor: MonitorConfig,
    pub names: NameServiceConfig,
    pub timers: TimerConfig,
}

impl FabricConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}

/// Smartbeat emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartbeatConfig {
    /// Period between smartbeat rounds.
    /// Default: 500 ms
    pub interval_ms: u64,
}

impl Default for SmartbeatConfig {
    fn default() -> Self {
        Self { interval_ms: 500 }
    }
}

/// Service collection kept by a monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Records kept in history before the oldest is dropped.
    /// Default: 100
    pub history_capacity: usize,

    /// Period between timeout sweeps of the active set.
    /// Default: 800 ms
    pub sweep_interval_ms: u64,

    /// Activity timeout for services that announce none.
    /// Default: 5000 ms
    pub default_activity_timeout_ms: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            sweep_interval_ms: 800,
            default_activity_timeout_ms: 5_000,
        }
    }
}

/// Name registrations and subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NameServiceConfig {
    /// Period between expiry sweeps.
    /// Default: 1000 ms
    pub gc_interval_ms: u64,

    /// Cap on live registrations across all groups. Constrained deployments
    /// run with 500.
    /// Default: unlimited
    pub max_names: Option<usize>,

    /// Seconds a registration outlives its flow when the registrant sends
    /// no linger of its own.
    /// Default: 5
    pub default_linger_secs: u32,
}

impl Default for NameServiceConfig {
    fn default() -> Self {
        Self {
            gc_interval_ms: 1_000,
            max_names: None,
            default_linger_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Timer slots allocated up front per set.
    /// Default: 16
    pub max_preallocated: usize,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            max_preallocated: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = FabricConfig::from_json_str("{}").unwrap();
        assert_eq!(config.smartbeat.interval_ms, 500);
        assert_eq!(config.monitor.history_capacity, 100);
        assert_eq!(config.monitor.sweep_interval_ms, 800);
        assert_eq!(config.names.gc_interval_ms, 1_000);
        assert_eq!(config.names.max_names, None);
        assert_eq!(config.timers.max_preallocated, 16);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = FabricConfig::from_json_str(
            r#"{ "monitor": { "history_capacity": 2 }, "names": { "max_names": 500 } }"#,
        )
        .unwrap();
        assert_eq!(config.monitor.history_capacity, 2);
        assert_eq!(config.monitor.sweep_interval_ms, 800);
        assert_eq!(config.names.max_names, Some(500));
        assert_eq!(config.names.default_linger_secs, 5);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(FabricConfig::from_json_str("{ monitor: }").is_err());
    }

    #[test]
    fn serializes_round_trip() {
        let config = FabricConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back = FabricConfig::from_json_str(&json).unwrap();
        assert_eq!(back.monitor.default_activity_timeout_ms, 5_000);
    }
}
