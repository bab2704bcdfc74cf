use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounds and tuning for the adaptive concurrency limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Limit at process start
    #[serde(default = "default_initial_limit")]
    pub initial_limit: u32,

    /// Floor for multiplicative decrease
    #[serde(default = "default_min_limit")]
    pub min_limit: u32,

    /// Ceiling for additive increase
    #[serde(default = "default_max_limit")]
    pub max_limit: u32,

    /// Successes without a rate-limit signal before the limit grows by one
    #[serde(default = "default_increase_after_successes")]
    pub increase_after_successes: u32,

    /// Half-life of the rate-limit signal counter, in seconds
    #[serde(default = "default_signal_decay_secs")]
    pub signal_decay_secs: u64,

    /// Optional pacing ceiling applied before a permit is taken
    #[serde(default)]
    pub max_requests_per_second: Option<u32>,
}

fn default_initial_limit() -> u32 {
    10
}

fn default_min_limit() -> u32 {
    1
}

fn default_max_limit() -> u32 {
    100
}

fn default_increase_after_successes() -> u32 {
    10
}

fn default_signal_decay_secs() -> u64 {
    60
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            initial_limit: default_initial_limit(),
            min_limit: default_min_limit(),
            max_limit: default_max_limit(),
            increase_after_successes: default_increase_after_successes(),
            signal_decay_secs: default_signal_decay_secs(),
            max_requests_per_second: None,
        }
    }
}

impl AdmissionConfig {
    /// Fixed limit with no adaptation headroom, handy for tests
    pub fn fixed(limit: u32) -> Self {
        Self {
            initial_limit: limit,
            min_limit: limit,
            max_limit: limit,
            ..Self::default()
        }
    }

    pub fn with_limits(mut self, initial: u32, min: u32, max: u32) -> Self {
        self.initial_limit = initial;
        self.min_limit = min;
        self.max_limit = max;
        self
    }

    pub fn signal_half_life(&self) -> Duration {
        Duration::from_secs(self.signal_decay_secs.max(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_limit == 0 {
            return Err(ConfigError::Validation(
                "admission.min_limit must be at least 1".to_string(),
            ));
        }

        if self.min_limit > self.max_limit {
            return Err(ConfigError::Validation(format!(
                "admission.min_limit ({}) exceeds admission.max_limit ({})",
                self.min_limit, self.max_limit
            )));
        }

        if self.initial_limit < self.min_limit || self.initial_limit > self.max_limit {
            return Err(ConfigError::Validation(format!(
                "admission.initial_limit ({}) must be within [{}, {}]",
                self.initial_limit, self.min_limit, self.max_limit
            )));
        }

        if self.increase_after_successes == 0 {
            return Err(ConfigError::Validation(
                "admission.increase_after_successes must be > 0".to_string(),
            ));
        }

        if self.max_requests_per_second == Some(0) {
            return Err(ConfigError::Validation(
                "admission.max_requests_per_second must be > 0 when set".to_string(),
            ));
        }

        Ok(())
    }
}
