//! # Simulator Configuration
//!
//! Environment-based configuration. Scenario parameters come from the CLI.

use std::env;
use std::time::Duration;

use fleet_sync::{ChannelConfig, ReconnectPolicy};
use uuid::Uuid;

use crate::motion::DEFAULT_SNAPSHOT_EVERY_TICKS;
use crate::runtime::SessionSettings;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Simulator configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    /// Connect to the sync broker at all
    pub sync_enabled: bool,

    /// Roster capacity
    pub max_vehicles: usize,

    /// Full roster snapshot every N ticks
    pub snapshot_every_ticks: u64,

    pub heartbeat: Duration,

    pub connect_timeout: Duration,

    pub reconnect: ReconnectPolicy,

    /// Base URL of the record service; records stay in memory when unset
    pub records_url: Option<String>,

    /// Default tracing filter
    pub log_level: String,

    pub log_format: LogFormat,
}

impl SimulatorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup. Unparseable values fall back
    /// to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |key: &str, default: u64| Duration::from_millis(parsed(key).unwrap_or(default));
        let defaults = ReconnectPolicy::default();

        Self {
            sync_enabled: lookup("SYNC_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),

            max_vehicles: parsed("MAX_VEHICLES")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(10),

            snapshot_every_ticks: parsed("SNAPSHOT_EVERY_TICKS")
                .filter(|&v| v > 0)
                .unwrap_or(DEFAULT_SNAPSHOT_EVERY_TICKS),

            heartbeat: millis("HEARTBEAT_MS", 10_000),

            connect_timeout: millis("CONNECT_TIMEOUT_MS", 10_000),

            reconnect: ReconnectPolicy {
                base_delay: parsed("RECONNECT_BASE_MS")
                    .map_or(defaults.base_delay, Duration::from_millis),
                max_delay: parsed("RECONNECT_MAX_MS")
                    .map_or(defaults.max_delay, Duration::from_millis),
                max_attempts: parsed("RECONNECT_MAX_ATTEMPTS")
                    .and_then(|v| u32::try_from(v).ok())
                    .unwrap_or(defaults.max_attempts),
            },

            records_url: lookup("RECORDS_URL").filter(|v| !v.trim().is_empty()),

            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),

            log_format: match lookup("LOG_FORMAT").as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        }
    }

    #[must_use]
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            enabled: self.sync_enabled,
            heartbeat: self.heartbeat,
            connect_timeout: self.connect_timeout,
            reconnect: self.reconnect,
            ..ChannelConfig::default()
        }
    }

    #[must_use]
    pub fn session_settings(&self, simulation_id: Uuid) -> SessionSettings {
        SessionSettings {
            simulation_id,
            max_vehicles: self.max_vehicles,
            snapshot_every_ticks: self.snapshot_every_ticks,
            channel: self.channel_config(),
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> SimulatorConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        SimulatorConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = SimulatorConfig::default();
        assert!(c.sync_enabled);
        assert_eq!(c.max_vehicles, 10);
        assert_eq!(c.snapshot_every_ticks, 10);
        assert_eq!(c.heartbeat, Duration::from_secs(10));
        assert_eq!(c.connect_timeout, Duration::from_secs(10));
        assert_eq!(c.reconnect, ReconnectPolicy::default());
        assert_eq!(c.records_url, None);
        assert_eq!(c.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_overrides() {
        let c = config(&[
            ("SYNC_ENABLED", "false"),
            ("MAX_VEHICLES", "25"),
            ("SNAPSHOT_EVERY_TICKS", "4"),
            ("RECONNECT_MAX_ATTEMPTS", "3"),
            ("RECONNECT_BASE_MS", "250"),
            ("RECORDS_URL", "http://records.local"),
            ("LOG_FORMAT", "json"),
        ]);
        assert!(!c.sync_enabled);
        assert_eq!(c.max_vehicles, 25);
        assert_eq!(c.snapshot_every_ticks, 4);
        assert_eq!(c.reconnect.max_attempts, 3);
        assert_eq!(c.reconnect.base_delay, Duration::from_millis(250));
        assert_eq!(c.records_url.as_deref(), Some("http://records.local"));
        assert_eq!(c.log_format, LogFormat::Json);
        assert!(!c.channel_config().enabled);
    }

    #[test]
    fn test_garbage_falls_back() {
        let c = config(&[("MAX_VEHICLES", "lots"), ("SNAPSHOT_EVERY_TICKS", "0")]);
        assert_eq!(c.max_vehicles, 10);
        assert_eq!(c.snapshot_every_ticks, 10);
    }
}
