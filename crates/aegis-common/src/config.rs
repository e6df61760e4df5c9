//! Typed configuration, merged from a TOML file with compiled-in defaults.
//!
//! Mirrors the shape of the recognized options table: every key is optional
//! and has a default, so a missing or partial config file is never a startup
//! failure on its own -- only semantically invalid values
//! (e.g. a negative duration) are `CoreError::ConfigInvalid`.

use crate::error::{CoreError, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub size: usize,
    pub flush_interval_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: 100,
            flush_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub retention_days: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub max_latency_ms: u64,
    pub max_consecutive_failures: u32,
    pub connection_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_latency_ms: 500,
            max_consecutive_failures: 3,
            connection_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub failback_cooldown_secs: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            failback_cooldown_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub timeout_secs: u64,
    pub success_threshold: f64,
    pub min_requests_for_success_rate: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_secs: 30,
            success_threshold: 0.5,
            min_requests_for_success_rate: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// `None` means "use `std::thread::available_parallelism()`".
    pub count: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { count: None }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CoreConfig {
    pub batch: BatchConfig,
    pub recorder: RecorderConfig,
    pub health: HealthConfig,
    pub failover: FailoverConfig,
    pub circuit: CircuitConfig,
    pub retry: RetryConfig,
    pub worker: WorkerConfig,
}

impl CoreConfig {
    /// Load from a TOML file, falling back to defaults for any missing
    /// section or key. A malformed file is `ConfigInvalid`.
    pub fn load_from_str(toml_src: &str) -> Result<Self> {
        toml::from_str(toml_src).map_err(|e| CoreError::ConfigInvalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.circuit.success_threshold < 0.0 || self.circuit.success_threshold > 1.0 {
            return Err(CoreError::ConfigInvalid(
                "circuit.success_threshold must be in [0.0, 1.0]".to_string(),
            ));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(CoreError::ConfigInvalid(
                "circuit.failure_threshold must be > 0".to_string(),
            ));
        }
        if self.circuit.min_requests_for_success_rate == 0 {
            return Err(CoreError::ConfigInvalid(
                "circuit.min_requests_for_success_rate must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.worker
            .count
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4))
    }

    pub fn batch_flush_interval(&self) -> Duration {
        Duration::from_secs(self.batch.flush_interval_secs)
    }

    pub fn recorder_retention(&self) -> Duration {
        Duration::from_secs(self.recorder.retention_days * 24 * 3600)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health.interval_secs)
    }

    pub fn health_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.health.connection_timeout_secs)
    }

    pub fn failback_cooldown(&self) -> Duration {
        Duration::from_secs(self.failover.failback_cooldown_secs)
    }

    pub fn circuit_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry.delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = CoreConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.batch.size, 100);
        assert_eq!(cfg.circuit.success_threshold, 0.5);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg = CoreConfig::load_from_str("[circuit]\nfailure_threshold = 7\n").unwrap();
        assert_eq!(cfg.circuit.failure_threshold, 7);
        assert_eq!(cfg.circuit.timeout_secs, 30);
        assert_eq!(cfg.batch.size, 100);
    }

    #[test]
    fn invalid_success_threshold_rejected() {
        let cfg = CoreConfig::load_from_str("[circuit]\nsuccess_threshold = 1.5\n").unwrap();
        assert!(cfg.validate().is_err());
    }
}
