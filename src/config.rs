//! Centralized stage configuration.
//!
//! A single source of truth for every tunable in the fabric, supporting
//! environment variables with sensible defaults and validation.

use std::time::Duration;

/// Configuration of a single stage (node).
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// TCP address the RPC server binds to.
    pub addr: String,
    /// Registry key prefix shared by the whole cluster.
    pub registry_prefix: String,
    /// TTL of registry records in milliseconds.
    pub registry_ttl_ms: u64,
    /// Budget for acquiring the per-actor registry lock, in milliseconds.
    pub lock_acquire_timeout_ms: u64,
    /// Capacity of mapper and receiver data queues.
    pub queue_capacity: usize,
    /// TCP dial timeout in milliseconds.
    pub dial_timeout_ms: u64,
    /// Initial per-peer dial backoff in milliseconds.
    pub min_backoff_ms: u64,
    /// Maximum per-peer dial backoff in milliseconds.
    pub max_backoff_ms: u64,
    /// Interval between RPC server stall warnings, in milliseconds.
    pub watchdog_ms: u64,
    /// Heartbeat timeout handed to the consensus module for batch steps,
    /// in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Interval between registry record refreshes, in milliseconds.
    pub reclaim_interval_ms: u64,
    /// Single-stage mode: bypass the registry entirely.
    pub isolated: bool,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:0".to_string(),
            registry_prefix: "/troupe".to_string(),
            registry_ttl_ms: 30_000,
            lock_acquire_timeout_ms: 10_000,
            queue_capacity: 1024,
            dial_timeout_ms: 8_000,
            min_backoff_ms: 50,
            max_backoff_ms: 8_000,
            watchdog_ms: 10_000,
            heartbeat_timeout_ms: 1_000,
            reclaim_interval_ms: 10_000,
            isolated: false,
        }
    }
}

impl StageConfig {
    /// Load configuration from `TROUPE_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let addr = std::env::var("TROUPE_ADDR").unwrap_or(defaults.addr);
        if !addr.contains(':') {
            return Err(ConfigError::InvalidValue {
                key: "TROUPE_ADDR".to_string(),
                value: addr,
                reason: "must be a host:port pair".to_string(),
            });
        }

        Ok(Self {
            addr,
            registry_prefix: std::env::var("TROUPE_REGISTRY_PREFIX")
                .unwrap_or(defaults.registry_prefix),
            registry_ttl_ms: env_u64("TROUPE_REGISTRY_TTL_MS", defaults.registry_ttl_ms)?,
            lock_acquire_timeout_ms: env_u64(
                "TROUPE_LOCK_ACQUIRE_TIMEOUT_MS",
                defaults.lock_acquire_timeout_ms,
            )?,
            queue_capacity: env_u64("TROUPE_QUEUE_CAPACITY", defaults.queue_capacity as u64)?
                as usize,
            dial_timeout_ms: env_u64("TROUPE_DIAL_TIMEOUT_MS", defaults.dial_timeout_ms)?,
            min_backoff_ms: env_u64("TROUPE_MIN_BACKOFF_MS", defaults.min_backoff_ms)?,
            max_backoff_ms: env_u64("TROUPE_MAX_BACKOFF_MS", defaults.max_backoff_ms)?,
            watchdog_ms: env_u64("TROUPE_WATCHDOG_MS", defaults.watchdog_ms)?,
            heartbeat_timeout_ms: env_u64(
                "TROUPE_HEARTBEAT_TIMEOUT_MS",
                defaults.heartbeat_timeout_ms,
            )?,
            reclaim_interval_ms: env_u64(
                "TROUPE_RECLAIM_INTERVAL_MS",
                defaults.reclaim_interval_ms,
            )?,
            isolated: std::env::var("TROUPE_ISOLATED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.isolated),
        })
    }

    /// Registry record TTL.
    pub fn registry_ttl(&self) -> Duration {
        Duration::from_millis(self.registry_ttl_ms)
    }

    /// Actor lock acquire budget.
    pub fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_acquire_timeout_ms)
    }

    /// TCP dial timeout.
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Initial dial backoff.
    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    /// Maximum dial backoff.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// RPC server stall-warning period.
    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }

    /// Consensus batch-step budget.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Registry refresh interval.
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
            reason: format!("must be an unsigned integer: {e}"),
        }),
        Err(_) => Ok(default),
    }
}

/// Configuration error types.
#[derive(Debug)]
pub enum ConfigError {
    /// A configuration value is invalid.
    InvalidValue {
        /// Environment variable name.
        key: String,
        /// Offending value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue { key, value, reason } => {
                write!(f, "Invalid configuration for {}: '{}' ({})", key, value, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StageConfig::default();
        assert_eq!(config.addr, "127.0.0.1:0");
        assert_eq!(config.registry_prefix, "/troupe");
        assert_eq!(config.min_backoff(), Duration::from_millis(50));
        assert_eq!(config.max_backoff(), Duration::from_secs(8));
        assert_eq!(config.dial_timeout(), Duration::from_secs(8));
        assert_eq!(config.watchdog(), Duration::from_secs(10));
        assert!(!config.isolated);
    }
}
