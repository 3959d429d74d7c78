//! Engine configuration.
//!
//! `EngineConfig` is the top level of `config.toml` in the
//! data directory. Every field has a default, so an empty file is valid.

use serde::{Deserialize, Serialize};

use crate::step::{ResolvedStepConfig, StepDuration};

/// Tunables of the workflow engine.
///
/// Loaded from `~/.stepwise/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of `do` calls a single instance may issue.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Size of the semaphore bounding steps in flight per instance.
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,

    /// Timeout applied to `wait_for_event` calls that do not set one.
    #[serde(default = "default_event_timeout")]
    pub default_event_timeout: StepDuration,

    /// Retry and timeout defaults merged under each step's own config.
    #[serde(default)]
    pub step_defaults: ResolvedStepConfig,
}

fn default_max_steps() -> u32 {
    1024
}

fn default_max_concurrent_steps() -> usize {
    100
}

fn default_event_timeout() -> StepDuration {
    StepDuration::Text("24 hours".to_string())
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_concurrent_steps: default_max_concurrent_steps(),
            default_event_timeout: default_event_timeout(),
            step_defaults: ResolvedStepConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::Backoff;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_steps, 1024);
        assert_eq!(config.max_concurrent_steps, 100);
        assert_eq!(config.default_event_timeout.to_millis().unwrap(), 86_400_000);
        assert_eq!(config.step_defaults.retries.limit, 5);
        assert_eq!(config.step_defaults.retries.delay.to_millis().unwrap(), 1000);
        assert_eq!(config.step_defaults.retries.backoff, Backoff::Exponential);
        assert_eq!(config.step_defaults.timeout.to_millis().unwrap(), 600_000);
    }

    #[test]
    fn test_engine_config_deserialize_empty() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
max_steps = 10
default_event_timeout = "5 minutes"

[step_defaults]
timeout = 30000

[step_defaults.retries]
limit = 2
delay = "250 ms"
backoff = "linear"
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_steps, 10);
        assert_eq!(config.max_concurrent_steps, 100);
        assert_eq!(config.default_event_timeout.to_millis().unwrap(), 300_000);
        assert_eq!(config.step_defaults.timeout.to_millis().unwrap(), 30_000);
        assert_eq!(config.step_defaults.retries.limit, 2);
        assert_eq!(config.step_defaults.retries.delay.to_millis().unwrap(), 250);
        assert_eq!(config.step_defaults.retries.backoff, Backoff::Linear);
    }
}
