//! Sync engine configuration
//!
//! Values are layered: defaults, then an optional TOML file, then environment
//! variables prefixed with [`ENV_PREFIX`]. Durations are written as integer
//! milliseconds.

use crate::reconcile::ConflictPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Prefix for environment overrides, e.g. `COMPANION_SYNC_CHUNK_SIZE`
pub const ENV_PREFIX: &str = "COMPANION_SYNC_";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    #[error("Configuration validation error: {field} - {reason}")]
    ValidationError { field: String, reason: String },

    #[error("Environment variable error: {var} - {reason}")]
    EnvVarError { var: String, reason: String },
}

/// Configuration validation trait
pub trait Validate {
    fn validate(&self) -> Result<(), ConfigError>;
}

/// Serde module for Duration fields stored as milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Top-level configuration for the sync engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub transport: TransportConfig,
    pub batch: BatchConfig,
    pub queue: QueueConfig,
    pub monitor: MonitorConfig,
    pub reconciliation: ReconciliationConfig,
    pub storage: StorageConfig,
}

/// Delivery channel limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Upper bound on a single immediate send
    #[serde(with = "duration_ms")]
    pub immediate_timeout: Duration,

    /// Largest encoded message accepted by the immediate channel
    pub max_immediate_payload_bytes: usize,

    /// Practical cap for the durable channel
    pub max_durable_payload_bytes: usize,
}

/// Chunking of oversized collections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Records per chunk
    pub chunk_size: usize,

    /// Pause between consecutive chunks
    #[serde(with = "duration_ms")]
    pub inter_chunk_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    #[serde(with = "duration_ms")]
    pub drain_interval: Duration,

    /// Consecutive fully failed drains before the link is put in the error state
    pub max_failed_drains: u32,
}

/// Reachability, latency and freshness tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(with = "duration_ms")]
    pub ping_interval: Duration,

    /// Round trips below this are excellent
    #[serde(with = "duration_ms")]
    pub excellent_rtt: Duration,

    /// Round trips up to this are good, above are poor
    #[serde(with = "duration_ms")]
    pub good_rtt: Duration,

    #[serde(with = "duration_ms")]
    pub freshness_check_interval: Duration,

    /// Syncs younger than this are current
    #[serde(with = "duration_ms")]
    pub current_window: Duration,

    /// Syncs up to this age are recent, older ones stale
    #[serde(with = "duration_ms")]
    pub recent_window: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub enabled: bool,
    pub policy: ConflictPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the persisted queue and cache; in-memory when unset
    pub data_dir: Option<PathBuf>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            immediate_timeout: Duration::from_secs(5),
            max_immediate_payload_bytes: 65_536,
            max_durable_payload_bytes: 1_048_576,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4,
            inter_chunk_delay: Duration::from_millis(100),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            drain_interval: Duration::from_secs(5),
            max_failed_drains: 5,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            excellent_rtt: Duration::from_millis(100),
            good_rtt: Duration::from_millis(300),
            freshness_check_interval: Duration::from_secs(30),
            current_window: Duration::from_secs(60),
            recent_window: Duration::from_secs(300),
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: ConflictPolicy::ServerWins,
        }
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

impl Validate for SyncConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.immediate_timeout.is_zero() {
            return Err(invalid("transport.immediate_timeout", "must be greater than 0"));
        }
        if self.transport.max_immediate_payload_bytes > self.transport.max_durable_payload_bytes {
            return Err(invalid(
                "transport.max_immediate_payload_bytes",
                "cannot exceed the durable payload limit",
            ));
        }
        if self.batch.chunk_size == 0 {
            return Err(invalid("batch.chunk_size", "must be greater than 0"));
        }
        if self.queue.drain_interval.is_zero() {
            return Err(invalid("queue.drain_interval", "must be greater than 0"));
        }
        if self.queue.max_failed_drains == 0 {
            return Err(invalid("queue.max_failed_drains", "must be greater than 0"));
        }
        if self.monitor.ping_interval.is_zero() || self.monitor.freshness_check_interval.is_zero() {
            return Err(invalid("monitor", "intervals must be greater than 0"));
        }
        if self.monitor.excellent_rtt >= self.monitor.good_rtt {
            return Err(invalid("monitor.excellent_rtt", "must be below monitor.good_rtt"));
        }
        if self.monitor.current_window >= self.monitor.recent_window {
            return Err(invalid("monitor.current_window", "must be below monitor.recent_window"));
        }
        Ok(())
    }
}

impl SyncConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|_| ConfigError::FileNotFound {
            path: path.as_ref().display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from multiple sources with priority order:
    /// 1. Default values
    /// 2. Configuration file
    /// 3. Environment variables
    pub fn load_layered(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = SyncConfig::default();

        if let Some(file_path) = config_file {
            if file_path.exists() {
                config = Self::load_from_file(file_path)?;
            } else {
                tracing::warn!("Configuration file {:?} not found, using defaults", file_path);
            }
        }

        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `COMPANION_SYNC_*` overrides read through `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read_u64 = |suffix: &str| -> Result<Option<u64>, ConfigError> {
            let var = format!("{ENV_PREFIX}{suffix}");
            match lookup(&var) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|e| ConfigError::EnvVarError {
                        var,
                        reason: e.to_string(),
                    }),
                None => Ok(None),
            }
        };

        if let Some(ms) = read_u64("IMMEDIATE_TIMEOUT_MS")? {
            self.transport.immediate_timeout = Duration::from_millis(ms);
        }
        if let Some(bytes) = read_u64("MAX_IMMEDIATE_PAYLOAD_BYTES")? {
            self.transport.max_immediate_payload_bytes = bytes as usize;
        }
        if let Some(size) = read_u64("CHUNK_SIZE")? {
            self.batch.chunk_size = size as usize;
        }
        if let Some(ms) = read_u64("INTER_CHUNK_DELAY_MS")? {
            self.batch.inter_chunk_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = read_u64("DRAIN_INTERVAL_MS")? {
            self.queue.drain_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = read_u64("PING_INTERVAL_MS")? {
            self.monitor.ping_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = read_u64("FRESHNESS_CHECK_INTERVAL_MS")? {
            self.monitor.freshness_check_interval = Duration::from_millis(ms);
        }
        if let Some(policy) = lookup(&format!("{ENV_PREFIX}CONFLICT_POLICY")) {
            self.reconciliation.policy = policy.parse().map_err(|_| ConfigError::EnvVarError {
                var: format!("{ENV_PREFIX}CONFLICT_POLICY"),
                reason: format!("unknown policy: {policy}"),
            })?;
        }
        if let Some(dir) = lookup(&format!("{ENV_PREFIX}DATA_DIR")) {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch.chunk_size, 4);
        assert_eq!(config.queue.drain_interval, Duration::from_secs(5));
        assert_eq!(config.monitor.ping_interval, Duration::from_secs(10));
    }

    #[test]
    fn toml_uses_milliseconds() {
        let config = SyncConfig::from_toml(
            r#"
            [batch]
            chunk_size = 3
            inter_chunk_delay = 250

            [reconciliation]
            policy = "client_wins"
            "#,
        )
        .unwrap();
        assert_eq!(config.batch.chunk_size, 3);
        assert_eq!(config.batch.inter_chunk_delay, Duration::from_millis(250));
        assert_eq!(config.reconciliation.policy, ConflictPolicy::ClientWins);
        assert_eq!(config.transport, TransportConfig::default());
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let err = SyncConfig::from_toml("[batch]\nchunk_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { ref field, .. } if field == "batch.chunk_size"));
    }

    #[test]
    fn rejects_inverted_quality_thresholds() {
        let mut config = SyncConfig::default();
        config.monitor.excellent_rtt = Duration::from_millis(400);
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<String, String> = [
            ("COMPANION_SYNC_CHUNK_SIZE", "5"),
            ("COMPANION_SYNC_DRAIN_INTERVAL_MS", "2000"),
            ("COMPANION_SYNC_CONFLICT_POLICY", "field_merge"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut config = SyncConfig::default();
        config.apply_env_overrides(|name| vars.get(name).cloned()).unwrap();
        assert_eq!(config.batch.chunk_size, 5);
        assert_eq!(config.queue.drain_interval, Duration::from_secs(2));
        assert_eq!(config.reconciliation.policy, ConflictPolicy::FieldMerge);
    }

    #[test]
    fn env_override_rejects_garbage() {
        let mut config = SyncConfig::default();
        let err = config
            .apply_env_overrides(|name| (name == "COMPANION_SYNC_CHUNK_SIZE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::EnvVarError { .. }));
    }
}
