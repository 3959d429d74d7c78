//! Step configuration, durations and per-step state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Durations
// ---------------------------------------------------------------------------

/// Returned when a duration string cannot be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid duration: '{0}'")]
pub struct InvalidDuration(pub String);

/// A duration given either as integer milliseconds or as a human string
/// such as `"250 ms"`, `"5 seconds"` or `"2 hours"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepDuration {
    Millis(u64),
    Text(String),
}

impl StepDuration {
    pub fn millis(ms: u64) -> Self {
        Self::Millis(ms)
    }

    /// Resolve to milliseconds.
    pub fn to_millis(&self) -> Result<u64, InvalidDuration> {
        match self {
            Self::Millis(ms) => Ok(*ms),
            Self::Text(text) => parse_duration_ms(text),
        }
    }

    pub fn to_std(&self) -> Result<std::time::Duration, InvalidDuration> {
        self.to_millis().map(std::time::Duration::from_millis)
    }
}

impl From<u64> for StepDuration {
    fn from(ms: u64) -> Self {
        Self::Millis(ms)
    }
}

impl From<&str> for StepDuration {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for StepDuration {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<std::time::Duration> for StepDuration {
    fn from(d: std::time::Duration) -> Self {
        Self::Millis(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

impl std::fmt::Display for StepDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Millis(ms) => write!(f, "{ms} ms"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

/// Parse `"<number> <unit>"` into milliseconds.
///
/// The number may be fractional; the space is optional. A bare number is
/// read as milliseconds.
pub fn parse_duration_ms(input: &str) -> Result<u64, InvalidDuration> {
    let trimmed = input.trim();
    let invalid = || InvalidDuration(input.to_string());

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: f64 = number.parse().map_err(|_| invalid())?;

    let factor: f64 = match unit.trim().to_lowercase().as_str() {
        "" | "ms" | "msec" | "msecs" | "millisecond" | "milliseconds" => 1.0,
        "s" | "sec" | "secs" | "second" | "seconds" => 1_000.0,
        "m" | "min" | "mins" | "minute" | "minutes" => 60_000.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600_000.0,
        "d" | "day" | "days" => 86_400_000.0,
        "w" | "week" | "weeks" => 604_800_000.0,
        _ => return Err(invalid()),
    };

    let ms = (value * factor).round();
    if !ms.is_finite() || ms < 0.0 || ms > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(ms as u64)
}

// ---------------------------------------------------------------------------
// Retry / timeout configuration
// ---------------------------------------------------------------------------

/// Backoff strategy between step attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Constant,
    Linear,
    #[default]
    Exponential,
}

/// Fully resolved retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Number of retries after the first attempt.
    pub limit: u32,
    pub delay: StepDuration,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            limit: 5,
            delay: StepDuration::Millis(1000),
            backoff: Backoff::Exponential,
        }
    }
}

/// Effective configuration of one step, frozen in storage on its first attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedStepConfig {
    #[serde(default)]
    pub retries: RetryConfig,
    #[serde(default = "default_step_timeout")]
    pub timeout: StepDuration,
}

fn default_step_timeout() -> StepDuration {
    StepDuration::Text("10 minutes".to_string())
}

impl Default for ResolvedStepConfig {
    fn default() -> Self {
        Self {
            retries: RetryConfig::default(),
            timeout: default_step_timeout(),
        }
    }
}

/// Partial retry policy supplied by workflow code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<StepDuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
}

/// Per-call step configuration. Unset fields fall back to the engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<RetryOverrides>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<StepDuration>,
}

impl StepConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retries(mut self, limit: u32, delay: impl Into<StepDuration>) -> Self {
        let retries = self.retries.get_or_insert_with(RetryOverrides::default);
        retries.limit = Some(limit);
        retries.delay = Some(delay.into());
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.retries
            .get_or_insert_with(RetryOverrides::default)
            .backoff = Some(backoff);
        self
    }

    pub fn timeout(mut self, timeout: impl Into<StepDuration>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    /// Merge over `defaults`, field by field.
    pub fn resolve(&self, defaults: &ResolvedStepConfig) -> ResolvedStepConfig {
        let overrides = self.retries.clone().unwrap_or_default();
        ResolvedStepConfig {
            retries: RetryConfig {
                limit: overrides.limit.unwrap_or(defaults.retries.limit),
                delay: overrides
                    .delay
                    .unwrap_or_else(|| defaults.retries.delay.clone()),
                backoff: overrides.backoff.unwrap_or(defaults.retries.backoff),
            },
            timeout: self
                .timeout
                .clone()
                .unwrap_or_else(|| defaults.timeout.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Step state and selectors
// ---------------------------------------------------------------------------

/// Mutable per-step record stored next to the frozen config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    pub attempted_count: u32,
}

/// Addresses the `index`-th occurrence (1-based) of a named step, sleep or wait.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepSelector {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

impl StepSelector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index: None,
        }
    }

    pub fn at(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    /// Occurrence index, defaulting to the first.
    pub fn index_or_first(&self) -> u32 {
        self.index.unwrap_or(1)
    }
}

impl From<&str> for StepSelector {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_human_durations() {
        assert_eq!(parse_duration_ms("250 ms").unwrap(), 250);
        assert_eq!(parse_duration_ms("5 seconds").unwrap(), 5_000);
        assert_eq!(parse_duration_ms("1 second").unwrap(), 1_000);
        assert_eq!(parse_duration_ms("10 minutes").unwrap(), 600_000);
        assert_eq!(parse_duration_ms("2 hours").unwrap(), 7_200_000);
        assert_eq!(parse_duration_ms("1 day").unwrap(), 86_400_000);
        assert_eq!(parse_duration_ms("1 week").unwrap(), 604_800_000);
        assert_eq!(parse_duration_ms("1.5h").unwrap(), 5_400_000);
        assert_eq!(parse_duration_ms("42").unwrap(), 42);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_duration_ms("soon").is_err());
        assert!(parse_duration_ms("5 fortnights").is_err());
        assert!(parse_duration_ms("").is_err());
    }

    #[test]
    fn test_duration_deserializes_from_number_or_string() {
        let d: StepDuration = serde_json::from_str("1500").unwrap();
        assert_eq!(d.to_millis().unwrap(), 1500);
        let d: StepDuration = serde_json::from_str("\"3 seconds\"").unwrap();
        assert_eq!(d.to_millis().unwrap(), 3000);
    }

    #[test]
    fn test_resolve_merges_over_defaults() {
        let defaults = ResolvedStepConfig::default();
        let resolved = StepConfig::new().retries(2, 0u64).resolve(&defaults);
        assert_eq!(resolved.retries.limit, 2);
        assert_eq!(resolved.retries.delay.to_millis().unwrap(), 0);
        assert_eq!(resolved.retries.backoff, Backoff::Exponential);
        assert_eq!(resolved.timeout.to_millis().unwrap(), 600_000);

        let resolved = StepConfig::new()
            .backoff(Backoff::Linear)
            .timeout("50 ms")
            .resolve(&defaults);
        assert_eq!(resolved.retries.limit, 5);
        assert_eq!(resolved.retries.backoff, Backoff::Linear);
        assert_eq!(resolved.timeout.to_millis().unwrap(), 50);
    }

    #[test]
    fn test_step_state_uses_camel_case() {
        let json = serde_json::to_value(StepState { attempted_count: 2 }).unwrap();
        assert_eq!(json, serde_json::json!({"attemptedCount": 2}));
    }

    #[test]
    fn test_selector_defaults_to_first_occurrence() {
        assert_eq!(StepSelector::new("charge").index_or_first(), 1);
        assert_eq!(StepSelector::new("charge").at(3).index_or_first(), 3);
    }
}
