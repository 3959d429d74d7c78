//! Instance modifier: test and introspection hooks.
//!
//! Modifiers write sentinel keys into the instance partition. The `Context`
//! consults them after its cache lookup and before running user code, so
//! every surrounding log entry is still produced. Steps are addressed by
//! `StepSelector { name, index }` and resolve to the same `hash(name)-index`
//! cache key the context computes for the call kind they target.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepwise_types::error::{ErrorRecord, RepositoryError, WorkflowError};
use stepwise_types::event::WorkflowEvent;
use stepwise_types::step::StepSelector;

use super::engine::Engine;
use super::keys::{CacheKey, CallKind};
use crate::storage::box_store::BoxDurableStore;

// ---------------------------------------------------------------------------
// Key layout
// ---------------------------------------------------------------------------

const MOCK_STEP_PREFIX: &str = "MOCK-STEP-";
const MOCK_STEP_ERROR_PREFIX: &str = "MOCK-STEP-ERROR-";
const FORCE_STEP_TIMEOUT_PREFIX: &str = "FORCE-STEP-TIMEOUT-";
const DISABLE_ALL_SLEEPS: &str = "DISABLE-ALL-SLEEPS";
const DISABLE_SLEEP_PREFIX: &str = "DISABLE-SLEEP-";
const MOCK_EVENT_PREFIX: &str = "MOCK-EVENT-";
const FORCE_EVENT_TIMEOUT_PREFIX: &str = "FORCE-EVENT-TIMEOUT-";

fn mock_step_key(key: &CacheKey) -> String {
    format!("{MOCK_STEP_PREFIX}{key}")
}

fn mock_step_error_key(key: &CacheKey) -> String {
    format!("{MOCK_STEP_ERROR_PREFIX}{key}")
}

fn force_step_timeout_key(key: &CacheKey) -> String {
    format!("{FORCE_STEP_TIMEOUT_PREFIX}{key}")
}

fn disable_sleep_key(name_hash: &str, index: Option<u32>) -> String {
    match index {
        Some(index) => format!("{DISABLE_SLEEP_PREFIX}{name_hash}-{index}"),
        None => format!("{DISABLE_SLEEP_PREFIX}{name_hash}"),
    }
}

pub(crate) fn mock_event_key(event_type: &str) -> String {
    format!("{MOCK_EVENT_PREFIX}{event_type}")
}

fn force_event_timeout_key(key: &CacheKey) -> String {
    format!("{FORCE_EVENT_TIMEOUT_PREFIX}{key}")
}

/// Attempts a mock applies to. `None` means every attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LimitedMock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    times: Option<u32>,
}

impl LimitedMock {
    fn applies_to(&self, attempt: u32) -> bool {
        self.times.is_none_or(|times| attempt <= times)
    }
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, RepositoryError> {
    serde_json::from_value(value)
        .map_err(|e| RepositoryError::Query(format!("invalid modifier value: {e}")))
}

// ---------------------------------------------------------------------------
// Read side (used by Context)
// ---------------------------------------------------------------------------

/// Forced outcome of one step attempt.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StepOverride {
    Timeout,
    Error(ErrorRecord),
    Result(Value),
}

/// Resolve the forced outcome for `attempt` of a step, if any.
///
/// Precedence: forced timeout, then mocked error, then mocked result.
pub(crate) async fn step_override(
    store: &BoxDurableStore,
    key: &CacheKey,
    attempt: u32,
) -> Result<Option<StepOverride>, RepositoryError> {
    if let Some(raw) = store.get(&force_step_timeout_key(key)).await? {
        let mock: LimitedMock = decode(raw)?;
        if mock.applies_to(attempt) {
            return Ok(Some(StepOverride::Timeout));
        }
    }
    if let Some(raw) = store.get(&mock_step_error_key(key)).await? {
        let mock: LimitedMock = decode(raw)?;
        if let (true, Some(error)) = (mock.applies_to(attempt), mock.error) {
            return Ok(Some(StepOverride::Error(error)));
        }
    }
    Ok(store
        .get(&mock_step_key(key))
        .await?
        .map(StepOverride::Result))
}

/// Whether the sleep `name_hash` / `key` should complete immediately.
pub(crate) async fn is_sleep_disabled(
    store: &BoxDurableStore,
    name_hash: &str,
    key: &CacheKey,
) -> Result<bool, RepositoryError> {
    Ok(store.contains(DISABLE_ALL_SLEEPS).await?
        || store.contains(&disable_sleep_key(name_hash, None)).await?
        || store.contains(&format!("{DISABLE_SLEEP_PREFIX}{key}")).await?)
}

pub(crate) async fn is_event_timeout_forced(
    store: &BoxDurableStore,
    key: &CacheKey,
) -> Result<bool, RepositoryError> {
    store.contains(&force_event_timeout_key(key)).await
}

// ---------------------------------------------------------------------------
// InstanceModifier
// ---------------------------------------------------------------------------

/// Deterministic control over one instance's steps, sleeps and events.
///
/// Obtained from [`Engine::modifier`]. Modifiers may be applied before the
/// instance starts or while it is running.
#[derive(Clone)]
pub struct InstanceModifier {
    engine: Arc<Engine>,
}

impl InstanceModifier {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    fn cache_key(&self, kind: CallKind, step: &StepSelector) -> CacheKey {
        CacheKey::new(&self.engine.hash_call(kind, &step.name), step.index_or_first())
    }

    /// Collapse sleeps to zero. `None` disables every sleep; a selector
    /// without an index disables every occurrence of that name.
    pub async fn disable_sleeps(&self, steps: Option<Vec<StepSelector>>) -> Result<(), WorkflowError> {
        let store = self.engine.store();
        match steps {
            None => store.put(DISABLE_ALL_SLEEPS, Value::Bool(true)).await?,
            Some(steps) => {
                for step in steps {
                    let key = disable_sleep_key(&self.engine.hash_call(CallKind::Sleep, &step.name), step.index);
                    store.put(&key, Value::Bool(true)).await?;
                }
            }
        }
        Ok(())
    }

    /// Make a step return `result` without running its closure.
    ///
    /// Rejected if the step already has a mocked result, or a mocked error or
    /// forced timeout that applies to every attempt.
    pub async fn mock_step_result(&self, step: StepSelector, result: Value) -> Result<(), WorkflowError> {
        let store = self.engine.store();
        let key = self.cache_key(CallKind::Step, &step);

        if store.contains(&mock_step_key(&key)).await? {
            return Err(WorkflowError::InvalidStep(format!(
                "[InstanceModifier] Trying to mock step '{}' multiple times!",
                step.name
            )));
        }
        self.ensure_not_always_failing(&step, &key).await?;

        store.put(&mock_step_key(&key), result).await?;
        tracing::debug!(instance_id = %self.engine.instance_id(), step = %step.name, "mocked step result");
        Ok(())
    }

    /// Make the first `times` attempts of a step (every attempt if `None`)
    /// fail with `error`.
    pub async fn mock_step_error(
        &self,
        step: StepSelector,
        error: ErrorRecord,
        times: Option<u32>,
    ) -> Result<(), WorkflowError> {
        let key = self.cache_key(CallKind::Step, &step);
        if times.is_none() {
            self.ensure_no_result_mock(&step, &key).await?;
        }
        let mock = LimitedMock {
            error: Some(error),
            times,
        };
        self.put_limited(&mock_step_error_key(&key), &mock).await
    }

    /// Make the first `times` attempts of a step (every attempt if `None`)
    /// time out immediately.
    pub async fn force_step_timeout(&self, step: StepSelector, times: Option<u32>) -> Result<(), WorkflowError> {
        let key = self.cache_key(CallKind::Step, &step);
        if times.is_none() {
            self.ensure_no_result_mock(&step, &key).await?;
        }
        let mock = LimitedMock { error: None, times };
        self.put_limited(&force_step_timeout_key(&key), &mock).await
    }

    /// Deliver `event` and flag its type as mocked, so delivery never
    /// re-enters an idle instance on its own.
    pub async fn mock_event(&self, event: WorkflowEvent) -> Result<(), WorkflowError> {
        self.engine
            .store()
            .put(&mock_event_key(&event.event_type), Value::Bool(true))
            .await?;
        self.engine.receive_event(event).await
    }

    /// Make the selected `wait_for_event` time out as soon as it starts.
    pub async fn force_event_timeout(&self, step: StepSelector) -> Result<(), WorkflowError> {
        let key = self.cache_key(CallKind::Wait, &step);
        self.engine
            .store()
            .put(&force_event_timeout_key(&key), Value::Bool(true))
            .await?;
        Ok(())
    }

    async fn put_limited(&self, key: &str, mock: &LimitedMock) -> Result<(), WorkflowError> {
        let value = serde_json::to_value(mock)
            .map_err(|e| WorkflowError::Internal(format!("failed to encode modifier: {e}")))?;
        self.engine.store().put(key, value).await?;
        Ok(())
    }

    async fn ensure_no_result_mock(&self, step: &StepSelector, key: &CacheKey) -> Result<(), WorkflowError> {
        if self.engine.store().contains(&mock_step_key(key)).await? {
            return Err(conflicting_mocks(step));
        }
        Ok(())
    }

    async fn ensure_not_always_failing(&self, step: &StepSelector, key: &CacheKey) -> Result<(), WorkflowError> {
        let store = self.engine.store();
        for mock_key in [mock_step_error_key(key), force_step_timeout_key(key)] {
            if let Some(raw) = store.get(&mock_key).await? {
                let mock: LimitedMock = decode(raw)?;
                if mock.times.is_none() {
                    return Err(conflicting_mocks(step));
                }
            }
        }
        Ok(())
    }
}

fn conflicting_mocks(step: &StepSelector) -> WorkflowError {
    WorkflowError::InvalidStep(format!(
        "[InstanceModifier] Step '{}' cannot have both a mocked result and an error or timeout on every attempt",
        step.name
    ))
}

impl std::fmt::Debug for InstanceModifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceModifier")
            .field("instance_id", &self.engine.instance_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryDurableStore;
    use serde_json::json;

    fn store() -> BoxDurableStore {
        BoxDurableStore::new(InMemoryDurableStore::new())
    }

    #[tokio::test]
    async fn test_override_precedence_and_counts() {
        let store = store();
        let key = CacheKey::new("h", 1);
        store.put(&mock_step_key(&key), json!("mocked")).await.unwrap();
        let error = LimitedMock {
            error: Some(ErrorRecord::new("Error", "boom")),
            times: Some(2),
        };
        store
            .put(&mock_step_error_key(&key), serde_json::to_value(&error).unwrap())
            .await
            .unwrap();

        assert_eq!(
            step_override(&store, &key, 1).await.unwrap(),
            Some(StepOverride::Error(ErrorRecord::new("Error", "boom")))
        );
        assert!(matches!(
            step_override(&store, &key, 2).await.unwrap(),
            Some(StepOverride::Error(_))
        ));
        assert_eq!(
            step_override(&store, &key, 3).await.unwrap(),
            Some(StepOverride::Result(json!("mocked")))
        );
    }

    #[tokio::test]
    async fn test_forced_timeout_wins_over_error() {
        let store = store();
        let key = CacheKey::new("h", 1);
        let timeout = LimitedMock { error: None, times: None };
        store
            .put(&force_step_timeout_key(&key), serde_json::to_value(&timeout).unwrap())
            .await
            .unwrap();
        let error = LimitedMock {
            error: Some(ErrorRecord::new("Error", "boom")),
            times: None,
        };
        store
            .put(&mock_step_error_key(&key), serde_json::to_value(&error).unwrap())
            .await
            .unwrap();
        assert_eq!(
            step_override(&store, &key, 7).await.unwrap(),
            Some(StepOverride::Timeout)
        );
    }

    #[tokio::test]
    async fn test_no_override_by_default() {
        let store = store();
        assert_eq!(step_override(&store, &CacheKey::new("h", 1), 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sleep_disable_scopes() {
        let store = store();
        let first = CacheKey::new("nap", 1);
        let second = CacheKey::new("nap", 2);
        assert!(!is_sleep_disabled(&store, "nap", &first).await.unwrap());

        store.put(&disable_sleep_key("nap", Some(2)), json!(true)).await.unwrap();
        assert!(!is_sleep_disabled(&store, "nap", &first).await.unwrap());
        assert!(is_sleep_disabled(&store, "nap", &second).await.unwrap());

        store.put(&disable_sleep_key("nap", None), json!(true)).await.unwrap();
        assert!(is_sleep_disabled(&store, "nap", &first).await.unwrap());

        assert!(!is_sleep_disabled(&store, "other", &CacheKey::new("other", 1)).await.unwrap());
        store.put(DISABLE_ALL_SLEEPS, json!(true)).await.unwrap();
        assert!(is_sleep_disabled(&store, "other", &CacheKey::new("other", 1)).await.unwrap());
    }
}
