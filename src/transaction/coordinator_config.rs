use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Coordinator limits and per-call settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Pending + queued + executing transactions allowed at once
    #[serde(default = "default_max_active_transactions")]
    pub max_active_transactions: usize,

    /// Queue size past which a one-time hygiene warning is logged
    #[serde(default = "default_queue_warning_threshold")]
    pub queue_warning_threshold: usize,

    /// Timeout applied to every remote call attempt
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// How long committed / rolled back transactions stay listable
    #[serde(default = "default_finished_retention_secs")]
    pub finished_retention_secs: u64,

    /// Capture a snapshot before every non-empty commit, not only
    /// auto-rollback ones, so a later explicit rollback can restore
    #[serde(default)]
    pub snapshot_every_commit: bool,
}

fn default_max_active_transactions() -> usize {
    100
}

fn default_queue_warning_threshold() -> usize {
    50
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_finished_retention_secs() -> u64 {
    3600
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_active_transactions: default_max_active_transactions(),
            queue_warning_threshold: default_queue_warning_threshold(),
            call_timeout_ms: default_call_timeout_ms(),
            finished_retention_secs: default_finished_retention_secs(),
            snapshot_every_commit: false,
        }
    }
}

impl CoordinatorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn finished_retention(&self) -> Duration {
        Duration::from_secs(self.finished_retention_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_active_transactions == 0 {
            return Err(ConfigError::Validation(
                "coordinator.max_active_transactions must be > 0".to_string(),
            ));
        }

        if self.call_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "coordinator.call_timeout_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
        assert_eq!(config.queue_warning_threshold, 50);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = CoordinatorConfig {
            call_timeout_ms: 0,
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
