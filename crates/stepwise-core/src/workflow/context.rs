//! Workflow-facing API: `do_step`, `sleep`, `sleep_until`, `wait_for_event`.
//!
//! Each call derives a cache key `hash(kind, name)-count`, where `count` is how
//! many times that name has been used for the same kind of call in this run. On
//! replay the same call sequence yields the same keys and the persisted
//! outcome is returned without running anything.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use stepwise_types::error::{ErrorRecord, WorkflowError};
use stepwise_types::event::{WaitForEventOptions, WorkflowEvent};
use stepwise_types::instance::{InstanceEvent, InstanceStatus, NewLogEntry};
use stepwise_types::step::{InvalidDuration, ResolvedStepConfig, StepConfig, StepDuration, StepState};
use stepwise_types::wake::{WakeEntry, WakeKind};

use super::engine::{Engine, EventClaim, aborted, decode};
use super::keys::{CacheKey, CallKind};
use super::modifier::{self, StepOverride};
use super::retry::calc_retry_duration;
use super::validators::ensure_step_name;
use crate::storage::durable_store::StoreOp;

/// Handle passed to `Workflow::run`. Cheap to clone; clones share counters.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    engine: Arc<Engine>,
    counters: DashMap<String, u32>,
    steps_run: AtomicU32,
}

/// Identity of one `do_step` call.
struct StepCall<'a> {
    name: &'a str,
    key: &'a CacheKey,
    target: &'a str,
    config: &'a ResolvedStepConfig,
}

impl Context {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                engine,
                counters: DashMap::new(),
                steps_run: AtomicU32::new(0),
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        self.engine().instance_id()
    }

    fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Next 1-based occurrence of `name` for one kind of call.
    fn next_count(&self, kind: &str, name: &str) -> u32 {
        let mut count = self.inner.counters.entry(format!("{kind}-{name}")).or_insert(0);
        *count += 1;
        *count
    }

    async fn load_state(&self, key: &CacheKey) -> Result<StepState, WorkflowError> {
        match self.engine().store().get(&key.state()).await? {
            Some(value) => decode(value, "step state"),
            None => Ok(StepState::default()),
        }
    }

    async fn save_state(&self, key: &CacheKey, state: StepState) -> Result<(), WorkflowError> {
        self.engine().store().put(&key.state(), json!(state)).await?;
        Ok(())
    }

    async fn cached_error(&self, key: &CacheKey) -> Result<Option<WorkflowError>, WorkflowError> {
        Ok(self
            .engine()
            .store()
            .get(&key.error())
            .await?
            .map(|value| decode::<ErrorRecord>(value, "cached error"))
            .transpose()?
            .map(WorkflowError::from_record))
    }

    // -----------------------------------------------------------------------
    // do_step
    // -----------------------------------------------------------------------

    /// Run `closure` as a durable step with the engine's default config.
    pub async fn do_step<T, F, Fut>(&self, name: &str, closure: F) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, WorkflowError>> + Send,
    {
        self.do_step_with(name, StepConfig::default(), closure).await
    }

    /// Run `closure` as a durable step.
    ///
    /// A committed result is returned without calling `closure`. Otherwise
    /// the closure is attempted up to `retries.limit + 1` times, each attempt
    /// bounded by `timeout`. Non-retryable errors stop after one attempt.
    pub async fn do_step_with<T, F, Fut>(
        &self,
        name: &str,
        config: StepConfig,
        mut closure: F,
    ) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, WorkflowError>> + Send,
    {
        let engine = self.engine();
        engine.ensure_not_aborted()?;

        let max_steps = engine.config().max_steps;
        if self.inner.steps_run.fetch_add(1, Ordering::SeqCst) >= max_steps {
            tracing::warn!(instance_id = %engine.instance_id(), max_steps, "step limit reached");
            return Err(WorkflowError::InvalidStep(format!(
                "The limit of {max_steps} steps per Workflow instance has been reached"
            )));
        }
        if let Err(e) = ensure_step_name(name) {
            tracing::warn!(instance_id = %engine.instance_id(), error = %e, "invalid step name");
            return Err(e);
        }

        let count = self.next_count("run", name);
        let key = CacheKey::new(&engine.hash_call(CallKind::Step, name), count);
        let target = format!("{name}-{count}");
        let store = engine.store();

        if let Some(cached) = store.get(&key.value()).await? {
            tracing::debug!(instance_id = %engine.instance_id(), step = %target, "replaying cached step result");
            let value = cached.get("value").cloned().unwrap_or(Value::Null);
            return serde_json::from_value(value).map_err(|e| {
                WorkflowError::Fatal(format!("Cached result of step \"{name}\" does not match its output type: {e}"))
            });
        }
        if let Some(error) = self.cached_error(&key).await? {
            return Err(error);
        }

        let resolved = match store.get(&key.config()).await? {
            Some(frozen) => decode(frozen, "step config")?,
            None => {
                let resolved = config.resolve(&engine.config().step_defaults);
                store.put(&key.config(), json!(resolved)).await?;
                resolved
            }
        };

        let step = StepCall {
            name,
            key: &key,
            target: &target,
            config: &resolved,
        };
        if let Some(error) = self.recover_interrupted_attempt(&step).await? {
            return Err(error);
        }

        loop {
            if let Some(value) = self.attempt(&step, &mut closure).await? {
                return Ok(value);
            }
        }
    }

    /// A trailing `ATTEMPT_START` without an outcome means the process died
    /// mid-attempt. Record it as an internal failure so the attempt counts.
    async fn recover_interrupted_attempt(&self, step: &StepCall<'_>) -> Result<Option<WorkflowError>, WorkflowError> {
        let engine = self.engine();
        let logs = engine.read_logs_for(step.key.as_str()).await?;
        let interrupted = logs
            .iter()
            .rev()
            .find(|entry| {
                matches!(
                    entry.event,
                    InstanceEvent::AttemptStart | InstanceEvent::AttemptSuccess | InstanceEvent::AttemptFailure
                )
            })
            .is_some_and(|entry| entry.event == InstanceEvent::AttemptStart);
        if !interrupted {
            return Ok(None);
        }

        let mut state = self.load_state(step.key).await?;
        state.attempted_count = state.attempted_count.max(1);
        let attempt = state.attempted_count;
        engine
            .remove_wake(&step.key.attempt_hash(attempt), WakeKind::Timeout)
            .await?;

        let error = WorkflowError::Internal("Attempt failed due to internal workflows error".to_string());
        engine
            .write_log(
                InstanceEvent::AttemptFailure,
                Some(step.key.as_str()),
                Some(step.target),
                json!({ "attempt": attempt, "error": error.to_record() }),
            )
            .await?;
        self.save_state(step.key, state).await?;
        tracing::info!(
            instance_id = %engine.instance_id(),
            step = %step.target,
            attempt,
            "recovered interrupted attempt"
        );

        if attempt > step.config.retries.limit {
            self.fail_step(step, &error).await?;
            return Ok(Some(error));
        }
        Ok(None)
    }

    /// One attempt. `Ok(None)` means a retry was scheduled and waited out.
    async fn attempt<T, F, Fut>(&self, step: &StepCall<'_>, closure: &mut F) -> Result<Option<T>, WorkflowError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, WorkflowError>> + Send,
    {
        let engine = self.engine();
        let key = step.key;
        let mut state = self.load_state(key).await?;
        let mut permit = engine.acquire_step_permit().await?;

        if state.attempted_count == 0 {
            engine
                .write_log(
                    InstanceEvent::StepStart,
                    Some(key.as_str()),
                    Some(step.target),
                    json!({ "config": step.config }),
                )
                .await?;
        } else {
            // Resumed between attempts: the pending retry delay still applies.
            let retry_hash = key.attempt_hash(state.attempted_count);
            let pending = engine
                .wake_queue()
                .await?
                .get_first(|e| e.hash == retry_hash && e.kind == WakeKind::Retry)
                .await;
            if let Some(entry) = pending {
                drop(permit);
                engine.suspend_until(entry.target_timestamp).await?;
                engine.remove_wake(&retry_hash, WakeKind::Retry).await?;
                permit = engine.acquire_step_permit().await?;
            }
        }

        let attempt = state.attempted_count + 1;
        engine
            .write_log(
                InstanceEvent::AttemptStart,
                Some(key.as_str()),
                Some(step.target),
                json!({ "attempt": attempt }),
            )
            .await?;
        state.attempted_count = attempt;
        self.save_state(key, state).await?;

        let timeout_ms = step.config.timeout.to_millis().map_err(invalid_config)?;
        let timeout_hash = key.attempt_hash(attempt);
        let outcome = match modifier::step_override(engine.store(), key, attempt).await? {
            Some(StepOverride::Timeout) => Err(timeout_error(timeout_ms)),
            Some(StepOverride::Error(record)) => Err(WorkflowError::from_record(record)),
            Some(StepOverride::Result(value)) => serde_json::from_value::<T>(value).map_err(|e| {
                WorkflowError::Fatal(format!(
                    "Mocked result of step \"{}\" does not match its output type: {e}",
                    step.name
                ))
            }),
            None => {
                let deadline = engine.now_ms().saturating_add(clamp_ms(timeout_ms));
                engine
                    .add_wake(WakeEntry::new(timeout_hash.clone(), WakeKind::Timeout, deadline))
                    .await?;
                tokio::select! {
                    biased;
                    _ = engine.cancellation().cancelled() => return Err(aborted()),
                    result = closure() => result,
                    _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => Err(timeout_error(timeout_ms)),
                }
            }
        };
        engine.remove_wake(&timeout_hash, WakeKind::Timeout).await?;

        let error = match outcome {
            Ok(value) => {
                let serialized = match serde_json::to_value(&value) {
                    Ok(serialized) => serialized,
                    Err(e) => {
                        drop(permit);
                        return Err(self.abort_unserializable(step, attempt, &e).await?);
                    }
                };
                engine
                    .store()
                    .put(&key.value(), json!({ "value": serialized }))
                    .await?;
                engine
                    .write_log(
                        InstanceEvent::AttemptSuccess,
                        Some(key.as_str()),
                        Some(step.target),
                        json!({ "attempt": attempt }),
                    )
                    .await?;
                engine
                    .write_log(
                        InstanceEvent::StepSuccess,
                        Some(key.as_str()),
                        Some(step.target),
                        json!({ "result": serialized }),
                    )
                    .await?;
                tracing::debug!(instance_id = %engine.instance_id(), step = %step.target, attempt, "step succeeded");
                return Ok(Some(value));
            }
            Err(error @ WorkflowError::Aborted(_)) => return Err(error),
            Err(error) => error,
        };

        engine
            .write_log(
                InstanceEvent::AttemptFailure,
                Some(key.as_str()),
                Some(step.target),
                json!({ "attempt": attempt, "error": error.to_record() }),
            )
            .await?;
        drop(permit);

        if error.is_non_retryable() || attempt > step.config.retries.limit {
            self.fail_step(step, &error).await?;
            return Err(error);
        }

        let delay = calc_retry_duration(&step.config.retries, attempt).map_err(invalid_config)?;
        let retry_hash = key.attempt_hash(attempt);
        let wake_at = engine.now_ms().saturating_add(clamp_ms(delay));
        engine
            .add_wake(WakeEntry::new(retry_hash.clone(), WakeKind::Retry, wake_at))
            .await?;
        tracing::debug!(
            instance_id = %engine.instance_id(),
            step = %step.target,
            attempt,
            delay_ms = delay,
            error = %error,
            "attempt failed, retrying"
        );
        engine.suspend_until(wake_at).await?;
        engine.remove_wake(&retry_hash, WakeKind::Retry).await?;
        Ok(None)
    }

    async fn fail_step(&self, step: &StepCall<'_>, error: &WorkflowError) -> Result<(), WorkflowError> {
        let engine = self.engine();
        let record = error.to_record();
        engine.store().put(&step.key.error(), json!(record)).await?;
        engine
            .write_log(
                InstanceEvent::StepFailure,
                Some(step.key.as_str()),
                Some(step.target),
                json!({ "error": record }),
            )
            .await?;
        tracing::info!(instance_id = %engine.instance_id(), step = %step.target, error = %error, "step failed");
        Ok(())
    }

    /// A result that cannot be persisted ends the instance: the step and the
    /// instance are both failed and the run is aborted.
    async fn abort_unserializable(
        &self,
        step: &StepCall<'_>,
        attempt: u32,
        cause: &serde_json::Error,
    ) -> Result<WorkflowError, WorkflowError> {
        let engine = self.engine();
        let step_error = WorkflowError::Fatal(format!(
            "Value returned from step \"{}\" is not serialisable",
            step.name
        ));
        engine
            .write_log(
                InstanceEvent::AttemptFailure,
                Some(step.key.as_str()),
                Some(step.target),
                json!({ "attempt": attempt, "error": step_error.to_record() }),
            )
            .await?;
        engine
            .write_log(
                InstanceEvent::StepFailure,
                Some(step.key.as_str()),
                Some(step.target),
                json!({ "error": step_error.to_record() }),
            )
            .await?;

        let instance_error = WorkflowError::Fatal(format!(
            "The execution of the Workflow instance was terminated, as the step \"{}\" returned a value which is not serialisable",
            step.name
        ));
        let entry = NewLogEntry::new(
            InstanceEvent::WorkflowFailure,
            None,
            None,
            json!({ "error": instance_error.to_record() }),
        );
        engine
            .set_status_with_log(InstanceStatus::Errored, Some(entry))
            .await?;
        tracing::warn!(
            instance_id = %engine.instance_id(),
            step = %step.target,
            error = %cause,
            "step returned a value that is not serialisable"
        );

        engine.abort("Value is not serialisable");
        Ok(WorkflowError::Aborted("Value is not serialisable".to_string()))
    }

    // -----------------------------------------------------------------------
    // sleep / sleep_until
    // -----------------------------------------------------------------------

    /// Durable sleep. After a restart only the remaining time is waited.
    pub async fn sleep(&self, name: &str, duration: impl Into<StepDuration>) -> Result<(), WorkflowError> {
        let duration_ms = duration.into().to_millis().map_err(invalid_config)?;
        self.sleep_for(name, duration_ms).await
    }

    /// Durable sleep until an absolute instant. Past instants complete
    /// immediately.
    pub async fn sleep_until(&self, name: &str, until: DateTime<Utc>) -> Result<(), WorkflowError> {
        let duration_ms = until
            .timestamp_millis()
            .saturating_sub(self.engine().now_ms())
            .max(0);
        self.sleep_for(name, duration_ms.unsigned_abs()).await
    }

    async fn sleep_for(&self, name: &str, duration_ms: u64) -> Result<(), WorkflowError> {
        let engine = self.engine();
        engine.ensure_not_aborted()?;
        ensure_step_name(name)?;

        let count = self.next_count("sleep", name);
        let name_hash = engine.hash_call(CallKind::Sleep, name);
        let key = CacheKey::new(&name_hash, count);
        let target = format!("{name}-{count}");
        let store = engine.store();

        if store.contains(&key.value()).await? {
            let pending = engine
                .wake_queue()
                .await?
                .get_first(|e| e.hash == key.as_str() && e.kind == WakeKind::Sleep)
                .await;
            if let Some(entry) = pending {
                tracing::debug!(
                    instance_id = %engine.instance_id(),
                    sleep = %target,
                    target_timestamp = entry.target_timestamp,
                    "resuming sleep"
                );
                engine.suspend_until(entry.target_timestamp).await?;
            }
            return self.complete_sleep(&key, &target).await;
        }

        let duration_ms = if modifier::is_sleep_disabled(store, &name_hash, &key).await? {
            tracing::debug!(instance_id = %engine.instance_id(), sleep = %target, "sleep disabled");
            0
        } else {
            duration_ms
        };

        // The start marker and the wake entry land together, so a replay
        // that sees the marker always finds the deadline.
        let wake_at = engine.now_ms().saturating_add(clamp_ms(duration_ms));
        engine
            .add_wake_with(
                WakeEntry::new(key.as_str(), WakeKind::Sleep, wake_at),
                vec![
                    StoreOp::AppendLog(NewLogEntry::new(
                        InstanceEvent::SleepStart,
                        Some(key.as_str()),
                        Some(&target),
                        json!({ "durationMs": duration_ms }),
                    )),
                    StoreOp::put(key.value(), json!(true)),
                ],
            )
            .await?;
        engine.suspend_until(wake_at).await?;
        self.complete_sleep(&key, &target).await
    }

    async fn complete_sleep(&self, key: &CacheKey, target: &str) -> Result<(), WorkflowError> {
        let engine = self.engine();
        let mut ops = Vec::new();
        if !engine.store().contains(&key.log_written()).await? {
            ops.push(StoreOp::AppendLog(NewLogEntry::new(
                InstanceEvent::SleepComplete,
                Some(key.as_str()),
                Some(target),
                json!({}),
            )));
            ops.push(StoreOp::put(key.log_written(), json!(true)));
        }
        engine.remove_wake_with(key.as_str(), WakeKind::Sleep, ops).await
    }

    // -----------------------------------------------------------------------
    // wait_for_event
    // -----------------------------------------------------------------------

    /// Wait for the next event of `options.event_type`.
    ///
    /// Fails with a timeout error once the deadline passes. The deadline is
    /// persisted, so a wait whose deadline elapsed while the instance was idle
    /// times out deterministically on replay.
    pub async fn wait_for_event(
        &self,
        name: &str,
        options: WaitForEventOptions,
    ) -> Result<WorkflowEvent, WorkflowError> {
        let engine = self.engine();
        engine.ensure_not_aborted()?;
        ensure_step_name(name)?;

        let count = self.next_count("wait", name);
        let key = CacheKey::new(&engine.hash_call(CallKind::Wait, name), count);
        let target = format!("{name}-{count}");
        let store = engine.store();

        if let Some(cached) = store.get(&key.value()).await? {
            return decode(cached, "cached event");
        }
        if let Some(error) = self.cached_error(&key).await? {
            return Err(error);
        }

        let timeout_ms = options
            .timeout
            .as_ref()
            .unwrap_or(&engine.config().default_event_timeout)
            .to_millis()
            .map_err(invalid_config)?;

        if !store.contains(&key.registered()).await? {
            store
                .transaction(vec![
                    StoreOp::AppendLog(NewLogEntry::new(
                        InstanceEvent::WaitStart,
                        Some(key.as_str()),
                        Some(&target),
                        json!({ "type": options.event_type, "timeout": timeout_ms }),
                    )),
                    StoreOp::put(key.registered(), json!(true)),
                ])
                .await?;
        }

        let queue = engine.wake_queue().await?;
        let existing = queue
            .get_first(|e| e.hash == key.as_str() && e.kind == WakeKind::Timeout)
            .await;
        let elapsed = existing.is_none() && queue.check_if_existed_in_past(key.as_str(), WakeKind::Timeout).await;
        if elapsed || modifier::is_event_timeout_forced(store, &key).await? {
            return Err(self.time_out_wait(&key, &target, &options.event_type, timeout_ms).await?);
        }

        let deadline = match existing {
            Some(entry) => entry.target_timestamp,
            None => {
                let deadline = engine.now_ms().saturating_add(clamp_ms(timeout_ms));
                engine
                    .add_wake(WakeEntry::new(key.as_str(), WakeKind::Timeout, deadline))
                    .await?;
                deadline
            }
        };

        let received = match engine.claim_event(&options.event_type).await? {
            EventClaim::Ready(event) => Some(event),
            EventClaim::Pending(mut rx) => {
                tokio::select! {
                    biased;
                    _ = engine.cancellation().cancelled() => return Err(aborted()),
                    event = &mut rx => Some(event.map_err(|_| {
                        WorkflowError::Internal("event channel closed".to_string())
                    })?),
                    result = engine.suspend_until(deadline) => {
                        result?;
                        // An event handed over while the deadline fired still wins.
                        rx.close();
                        rx.try_recv().ok()
                    }
                }
            }
        };

        match received {
            Some(event) => {
                self.commit_wait(&key, &target, &event).await?;
                Ok(event)
            }
            None => Err(self.time_out_wait(&key, &target, &options.event_type, timeout_ms).await?),
        }
    }

    /// Record a received event as the wait's result. The cached value, the
    /// `WAIT_COMPLETE` entry, the release of the claimed event and the
    /// retirement of the deadline commit together.
    async fn commit_wait(&self, key: &CacheKey, target: &str, event: &WorkflowEvent) -> Result<(), WorkflowError> {
        let engine = self.engine();
        let ops = vec![
            StoreOp::put(key.value(), json!(event)),
            StoreOp::AppendLog(NewLogEntry::new(
                InstanceEvent::WaitComplete,
                Some(key.as_str()),
                Some(target),
                json!({ "event": event }),
            )),
            StoreOp::put(key.log_written(), json!(true)),
        ];
        engine.commit_event_wait(event, key.as_str(), ops).await?;
        tracing::debug!(instance_id = %engine.instance_id(), wait = %target, event_type = %event.event_type, "event received by wait");
        Ok(())
    }

    async fn time_out_wait(
        &self,
        key: &CacheKey,
        target: &str,
        event_type: &str,
        timeout_ms: u64,
    ) -> Result<WorkflowError, WorkflowError> {
        let engine = self.engine();
        let error = WorkflowError::Timeout(format!(
            "Execution timed out after {timeout_ms}ms waiting for event of type \"{event_type}\""
        ));
        let record = error.to_record();
        engine
            .remove_wake_with(
                key.as_str(),
                WakeKind::Timeout,
                vec![
                    StoreOp::put(key.error(), json!(record)),
                    StoreOp::AppendLog(NewLogEntry::new(
                        InstanceEvent::WaitTimedOut,
                        Some(key.as_str()),
                        Some(target),
                        json!({ "error": record }),
                    )),
                ],
            )
            .await?;
        tracing::debug!(instance_id = %engine.instance_id(), wait = %target, "wait timed out");
        Ok(error)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("instance_id", &self.instance_id())
            .finish_non_exhaustive()
    }
}

fn timeout_error(timeout_ms: u64) -> WorkflowError {
    WorkflowError::Timeout(format!("Execution timed out after {timeout_ms}ms"))
}

fn invalid_config(e: InvalidDuration) -> WorkflowError {
    WorkflowError::InvalidStep(e.to_string())
}

fn clamp_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}
