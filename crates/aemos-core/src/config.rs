//! Configuration for the AEMOS core daemon.
//!
//! All sections deserialize from one JSON document with serde defaults, so a
//! minimal deployment can run on an empty config. Validation catches fatal
//! misconfiguration before any component starts; the daemon exits with
//! code 1 on a config error.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default deadline budget for an engine event, in milliseconds.
pub const DEFAULT_EVENT_DEADLINE_MS: u64 = 5_000;

/// Default bound for data collection, in milliseconds.
pub const DEFAULT_COLLECTION_TIMEOUT_MS: u64 = 2_000;

/// Environment variable names recognized by the daemon.
pub mod env_vars {
    /// Override for the MQTT broker address (`host:port`).
    pub const BROKER_ADDR: &str = "AEMOS_BROKER_ADDR";
    /// `1`/`true` accepts unauthenticated publishes with a warning.
    pub const DEV_MODE: &str = "AEMOS_DEV_MODE";
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AemosConfig {
    pub engine: EngineConfig,
    pub backpressure: BackpressureConfig,
    pub scheduler: SchedulerConfig,
    pub ingress: IngressConfig,
    pub notify: NotifyConfig,
    pub metrics: MetricsConfig,
}

impl AemosConfig {
    /// Parse a config document, apply environment overrides, validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut config: AemosConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(format!("parse: {e}")))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides take precedence over the file.
    pub fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var(env_vars::BROKER_ADDR) {
            self.ingress.broker_addr = addr;
        }
        if let Ok(dev) = std::env::var(env_vars::DEV_MODE) {
            self.ingress.dev_mode = matches!(dev.as_str(), "1" | "true");
        }
    }

    /// Reject configurations no component could run with.
    pub fn validate(&self) -> Result<()> {
        if self.engine.worker_count == 0 {
            return Err(Error::Config("engine.worker_count must be > 0".into()));
        }
        if self.engine.queue_capacity == 0 {
            return Err(Error::Config("engine.queue_capacity must be > 0".into()));
        }
        if self.backpressure.warning_threshold >= self.backpressure.critical_threshold {
            return Err(Error::Config(
                "backpressure.warning_threshold must be below critical_threshold".into(),
            ));
        }
        if self.notify.max_buffer_size == 0 {
            return Err(Error::Config("notify.max_buffer_size must be > 0".into()));
        }
        Ok(())
    }
}

/// Rule-engine worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker lanes. Same-device events always share a lane.
    pub worker_count: usize,
    /// Per-lane queue capacity.
    pub queue_capacity: usize,
    /// Deadline budget for one event in milliseconds.
    pub event_deadline_ms: u64,
    /// Bound for data collection in milliseconds.
    pub collection_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 2_048,
            event_deadline_ms: DEFAULT_EVENT_DEADLINE_MS,
            collection_timeout_ms: DEFAULT_COLLECTION_TIMEOUT_MS,
        }
    }
}

/// Backpressure circuit thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Depth at which the circuit may start recovering toward CLOSED.
    pub warning_threshold: usize,
    /// Depth at which the circuit opens.
    pub critical_threshold: usize,
    /// Cooldown before OPEN transitions to HALF_OPEN, in milliseconds.
    pub cooldown_ms: u64,
    /// Minimum spacing between HALF_OPEN probes, in milliseconds.
    pub probe_interval_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 1_000,
            critical_threshold: 5_000,
            cooldown_ms: 30_000,
            probe_interval_ms: 1_000,
        }
    }
}

/// Schedule manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tick interval for checking due schedules, in milliseconds.
    pub tick_interval_ms: u64,
    /// Auto-sync interval, in milliseconds. Floored to 60 000.
    pub auto_sync_interval_ms: u64,
    /// Default timezone for cron expressions without one.
    pub default_timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            auto_sync_interval_ms: 120_000,
            default_timezone: "UTC".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Auto-sync interval with the 60 s floor applied.
    pub fn effective_auto_sync_interval_ms(&self) -> u64 {
        self.auto_sync_interval_ms.max(60_000)
    }
}

/// Protocol ingress settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    /// MQTT broker address, `host:port`.
    pub broker_addr: String,
    /// Client id for the bridge connection.
    pub client_id: String,
    /// Accept unauthenticated publishes (development only).
    pub dev_mode: bool,
    /// Username of the reserved internal publisher identity.
    pub internal_username: String,
    /// Password of the reserved internal publisher identity.
    pub internal_password: String,
    /// Token cache TTL in seconds.
    pub token_cache_ttl_secs: u64,
    /// Token cache sweep interval in seconds.
    pub token_sweep_interval_secs: u64,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            broker_addr: "localhost:1883".to_string(),
            client_id: "aemos-core".to_string(),
            dev_mode: false,
            internal_username: "publisher".to_string(),
            internal_password: "publisher-secret".to_string(),
            token_cache_ttl_secs: 3_600,
            token_sweep_interval_secs: 600,
        }
    }
}

/// Notification fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Flush interval for notification buffers, in milliseconds.
    pub flush_interval_ms: u64,
    /// Flush a buffer when it reaches this size.
    pub max_buffer_size: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 100,
            max_buffer_size: 100,
        }
    }
}

/// Metrics endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Maximum label combinations per metric family.
    pub max_series_per_metric: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_series_per_metric: 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = AemosConfig::from_json("{}").unwrap();
        assert_eq!(config.engine.worker_count, 4);
        assert_eq!(config.backpressure.critical_threshold, 5_000);
        assert_eq!(config.scheduler.default_timezone, "UTC");
        assert_eq!(config.notify.flush_interval_ms, 100);
    }

    #[test]
    fn auto_sync_interval_is_floored() {
        let config: AemosConfig =
            serde_json::from_str(r#"{"scheduler": {"auto_sync_interval_ms": 1000}}"#).unwrap();
        assert_eq!(config.scheduler.effective_auto_sync_interval_ms(), 60_000);
    }

    #[test]
    fn inverted_thresholds_are_fatal() {
        let json = r#"{"backpressure": {"warning_threshold": 9000, "critical_threshold": 5000}}"#;
        let err = AemosConfig::from_json(json).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn zero_workers_are_fatal() {
        let json = r#"{"engine": {"worker_count": 0}}"#;
        assert!(AemosConfig::from_json(json).is_err());
    }
}
