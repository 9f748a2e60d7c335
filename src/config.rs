//! Engine configuration
//!
//! Loaded from YAML. Every field has a default so an empty file (or no file)
//! yields a working engine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::compensation::RetryPolicy;

/// Environment variable naming a YAML config file.
pub const CONFIG_PATH_ENV: &str = "BPMN_EXEC_CONFIG";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on elements visited by a single start/continue call.
    pub max_traversal_steps: usize,
    /// Per-subscriber buffer of the event bus.
    pub event_channel_capacity: usize,
    pub compensation: CompensationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_traversal_steps: 10_000,
            event_channel_capacity: 256,
            compensation: CompensationConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompensationConfig {
    /// Give every executor built from this config its own coordinator, so
    /// completed tasks are recorded for compensation.
    pub record_executions: bool,
    pub retry: RetryConfig,
}

/// Compensation retry policy as written in config files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per record including the first. `null` = unlimited.
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            initial_backoff_ms: 0,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            backoff_multiplier: self.backoff_multiplier,
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_yaml::from_str(yaml).context("Failed to parse engine config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::from_yaml_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "Loaded engine config");
        Ok(config)
    }

    /// Load from the file named by `BPMN_EXEC_CONFIG`, or fall back to defaults.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_traversal_steps == 0 {
            anyhow::bail!("max_traversal_steps must be greater than 0");
        }
        if self.event_channel_capacity == 0 {
            anyhow::bail!("event_channel_capacity must be greater than 0");
        }
        let retry = &self.compensation.retry;
        if retry.max_attempts == Some(0) {
            anyhow::bail!("compensation.retry.max_attempts must be at least 1 (or null)");
        }
        if !(retry.backoff_multiplier.is_finite() && retry.backoff_multiplier >= 1.0) {
            anyhow::bail!("compensation.retry.backoff_multiplier must be >= 1.0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_yaml_yields_defaults() {
        let config = EngineConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn partial_yaml_overrides_only_given_fields() {
        let yaml = r#"
max_traversal_steps: 50
compensation:
  retry:
    max_attempts: null
    initial_backoff_ms: 10
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.max_traversal_steps, 50);
        assert_eq!(config.event_channel_capacity, 256);
        let policy = config.compensation.retry.to_policy();
        assert_eq!(policy.max_attempts, None);
        assert_eq!(policy.initial_backoff, Duration::from_millis(10));
        assert_eq!(policy.max_backoff, Duration::from_millis(5_000));
    }

    #[test]
    fn from_env_reads_named_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_traversal_steps: 7\ncompensation:\n  record_executions: true").unwrap();

        std::env::set_var(CONFIG_PATH_ENV, file.path());
        let config = EngineConfig::from_env();
        std::env::remove_var(CONFIG_PATH_ENV);

        let config = config.unwrap();
        assert_eq!(config.max_traversal_steps, 7);
        assert!(config.compensation.record_executions);
    }

    #[test]
    fn rejects_zero_attempts() {
        let yaml = "compensation:\n  retry:\n    max_attempts: 0\n";
        assert!(EngineConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "event_channel_capacity: 16").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.event_channel_capacity, 16);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = EngineConfig::load("/nonexistent/bpmn-exec.yaml").unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/bpmn-exec.yaml"));
    }
}
