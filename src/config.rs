//! Configuration module for the sheetops coordinator
//!
//! This module handles configuration loading from TOML files and
//! `SHEETOPS_*` environment overrides, and validates every section.

use crate::admission::AdmissionConfig;
use crate::batcher::BatchingConfig;
use crate::retry::RetryPolicy;
use crate::transaction::CoordinatorConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Transaction limits and per-call settings
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Adaptive concurrency limit
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Backoff schedule for retryable failures
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub batching: BatchingConfig,

    /// Monitoring and metrics
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: default_true(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration with `.env` and environment variable overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Override selected fields from `SHEETOPS_*` variables
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_field(&lookup, "SHEETOPS_MAX_ACTIVE_TRANSACTIONS", &mut self.coordinator.max_active_transactions)?;
        override_field(&lookup, "SHEETOPS_CALL_TIMEOUT_MS", &mut self.coordinator.call_timeout_ms)?;
        override_field(&lookup, "SHEETOPS_INITIAL_LIMIT", &mut self.admission.initial_limit)?;
        override_field(&lookup, "SHEETOPS_MIN_LIMIT", &mut self.admission.min_limit)?;
        override_field(&lookup, "SHEETOPS_MAX_LIMIT", &mut self.admission.max_limit)?;
        override_field(&lookup, "SHEETOPS_MAX_RETRIES", &mut self.retry.max_retries)?;
        override_field(&lookup, "SHEETOPS_BASE_DELAY_MS", &mut self.retry.base_delay_ms)?;
        override_field(&lookup, "SHEETOPS_ENABLE_METRICS", &mut self.monitoring.enable_metrics)?;
        override_field(&lookup, "SHEETOPS_METRICS_PORT", &mut self.monitoring.metrics_port)?;

        if let Some(rps) = lookup("SHEETOPS_MAX_REQUESTS_PER_SECOND") {
            self.admission.max_requests_per_second = Some(parse_value("SHEETOPS_MAX_REQUESTS_PER_SECOND", &rps)?);
        }

        Ok(())
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.coordinator.validate()?;
        self.admission.validate()?;
        self.retry.validate()?;

        if self.monitoring.enable_metrics && self.monitoring.metrics_port == 0 {
            return Err(ConfigError::Validation(
                "monitoring.metrics_port must be set when metrics are enabled".to_string(),
            ));
        }

        Ok(())
    }
}

fn override_field<F, T>(lookup: &F, key: &str, field: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *field = parse_value(key, &raw)?;
    }
    Ok(())
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Validation(format!("{} has invalid value '{}'", key, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.admission.initial_limit, 10);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.monitoring.metrics_port, 9090);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[coordinator]
max_active_transactions = 8

[admission]
initial_limit = 4
max_limit = 16

[retry]
base_delay_ms = 100
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.coordinator.max_active_transactions, 8);
        assert_eq!(config.coordinator.queue_warning_threshold, 50);
        assert_eq!(config.admission.initial_limit, 4);
        assert_eq!(config.admission.min_limit, 1);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert!(config.batching.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_parse_error() {
        let err = Config::from_toml("[admission]\ninitial_limit = \"ten\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validation_rejects_bad_limits() {
        let config = Config::from_toml("[admission]\ninitial_limit = 200\nmax_limit = 50").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let config = Config::from_toml("[admission]\nmin_limit = 0").unwrap();
        assert!(config.validate().is_err());

        let config = Config::from_toml("[retry]\njitter_min = 1.5\njitter_max = 0.5").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SHEETOPS_INITIAL_LIMIT", "20"),
            ("SHEETOPS_MAX_RETRIES", "5"),
            ("SHEETOPS_MAX_REQUESTS_PER_SECOND", "50"),
            ("SHEETOPS_ENABLE_METRICS", "false"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.admission.initial_limit, 20);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.admission.max_requests_per_second, Some(50));
        assert!(!config.monitoring.enable_metrics);
    }

    #[test]
    fn test_invalid_override() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|key| (key == "SHEETOPS_METRICS_PORT").then(|| "http".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("SHEETOPS_METRICS_PORT"));
    }
}
