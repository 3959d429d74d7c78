//! Storage key layout of an instance partition.

use std::borrow::Cow;

/// Persisted `InstanceStatus`.
pub const INSTANCE_STATUS: &str = "INSTANCE_STATUS";
/// Persisted `InstanceMetadata`, written once on first bootstrap.
pub const INSTANCE_METADATA: &str = "INSTANCE_METADATA";
/// Persisted event-type -> queued events map.
pub const EVENT_MAP: &str = "EVENT_MAP";

/// Kind of context call a cache key belongs to.
///
/// Steps hash their bare name. Sleeps and waits prefix it with a tag bounded
/// by a control character, which valid names never contain, so a step, a
/// sleep and a wait sharing a name never share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Step,
    Sleep,
    Wait,
}

impl CallKind {
    /// Input fed to the content hasher for a call named `name`.
    pub fn hash_input(self, name: &str) -> Cow<'_, str> {
        match self {
            CallKind::Step => Cow::Borrowed(name),
            CallKind::Sleep => Cow::Owned(format!("\u{1f}sleep\u{1f}{name}")),
            CallKind::Wait => Cow::Owned(format!("\u{1f}wait\u{1f}{name}")),
        }
    }
}

/// Keys derived from one `hash(name)-count` cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    key: String,
}

impl CacheKey {
    pub fn new(name_hash: &str, count: u32) -> Self {
        Self {
            key: format!("{name_hash}-{count}"),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Memoized result (`{"value": ..}`) or sleep/wait completion marker.
    pub fn value(&self) -> String {
        format!("{}-value", self.key)
    }

    /// Persisted terminal error of a step or wait.
    pub fn error(&self) -> String {
        format!("{}-error", self.key)
    }

    /// Frozen `ResolvedStepConfig`.
    pub fn config(&self) -> String {
        format!("{}-config", self.key)
    }

    /// Mutable `StepState`.
    pub fn state(&self) -> String {
        format!("{}-metadata", self.key)
    }

    /// Set once the completion log entry has been written.
    pub fn log_written(&self) -> String {
        format!("{}-log-written", self.key)
    }

    /// Set once `WAIT_START` has been logged.
    pub fn registered(&self) -> String {
        format!("{}-registered", self.key)
    }

    /// Wake-queue hash of one attempt's timeout or retry entry.
    pub fn attempt_hash(&self, attempt: u32) -> String {
        format!("{}-{attempt}", self.key)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_keys() {
        let key = CacheKey::new("ab12", 3);
        assert_eq!(key.as_str(), "ab12-3");
        assert_eq!(key.value(), "ab12-3-value");
        assert_eq!(key.state(), "ab12-3-metadata");
        assert_eq!(key.attempt_hash(2), "ab12-3-2");
    }

    #[test]
    fn test_call_kinds_hash_distinct_inputs() {
        assert_eq!(CallKind::Step.hash_input("charge"), "charge");
        let sleep = CallKind::Sleep.hash_input("charge");
        let wait = CallKind::Wait.hash_input("charge");
        assert_ne!(sleep, "charge");
        assert_ne!(wait, "charge");
        assert_ne!(sleep, wait);
        assert!(sleep.chars().any(char::is_control));
    }
}
