//! Per-instance engine: bootstrap/resume, status state machine, event log,
//! wake queue and in-memory waiter registries.
//!
//! # Lifecycle
//!
//! 1. `init` is idempotent while running and never re-runs a finished
//!    instance.
//! 2. The wake queue is rebuilt from its journal; entries that came due while
//!    the process was down are discarded, and the next alarm is scheduled.
//! 3. First bootstrap persists the instance metadata and logs
//!    `WORKFLOW_QUEUED` + `WORKFLOW_START`. Resumes skip this.
//! 4. Queued events are restored, status moves to `Running`, and the user
//!    workflow runs with a fresh `Context`.
//! 5. The outcome is logged and the status moves to `Complete` or `Errored`,
//!    unless the context already ended the instance.
//!
//! Waiters (status, step result, event) live only in memory and are never
//! persisted; after a restart they are rebuilt as callers register again.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use stepwise_types::config::EngineConfig;
use stepwise_types::error::{ErrorRecord, FATAL_ERROR_NAME, RepositoryError, WorkflowError};
use stepwise_types::event::{TriggerEvent, WorkflowEvent};
use stepwise_types::instance::{
    InstanceEvent, InstanceMetadata, InstanceStatus, InstanceStatusDetails, LogEntry, NewLogEntry,
};
use stepwise_types::wake::{WakeEntry, WakeKind};
use tokio::sync::{Mutex, OnceCell, OwnedSemaphorePermit, Semaphore, oneshot};
use tokio_util::sync::CancellationToken;

use super::clock::{AlarmScheduler, Clock, SystemClock};
use super::context::Context;
use super::keys::{CacheKey, CallKind, EVENT_MAP, INSTANCE_METADATA, INSTANCE_STATUS};
use super::modifier::{InstanceModifier, mock_event_key};
use super::wake_queue::WakeQueue;
use crate::service::hash::ContentHasher;
use crate::storage::box_store::BoxDurableStore;
use crate::storage::durable_store::StoreOp;

// ---------------------------------------------------------------------------
// Workflow entrypoint
// ---------------------------------------------------------------------------

/// User workflow entrypoint.
///
/// `run` is re-entered from the top after every restart; it must issue the
/// same sequence of context calls, with the same names, every time.
pub trait Workflow: Send + Sync + 'static {
    fn run(&self, event: TriggerEvent, ctx: Context) -> BoxFuture<'static, Result<Value, WorkflowError>>;
}

/// Adapts an async closure into a [`Workflow`].
pub struct FnWorkflow<F> {
    run: F,
}

impl<F> FnWorkflow<F> {
    pub fn new<Fut>(run: F) -> Self
    where
        F: Fn(TriggerEvent, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
    {
        Self { run }
    }
}

impl<F, Fut> Workflow for FnWorkflow<F>
where
    F: Fn(TriggerEvent, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
{
    fn run(&self, event: TriggerEvent, ctx: Context) -> BoxFuture<'static, Result<Value, WorkflowError>> {
        (self.run)(event, ctx).boxed()
    }
}

// ---------------------------------------------------------------------------
// Event registry
// ---------------------------------------------------------------------------

/// Queued events and FIFO waiters, per event type.
///
/// A type never has both queued events and live waiters: `claim_event`
/// drains the queue before registering, and `receive_event` hands queued
/// events to waiters immediately.
///
/// An event handed to a wait stays in `claimed` until the wait's outcome is
/// committed. The persisted map holds claimed events ahead of queued ones,
/// so a crash before that commit redelivers the event on replay.
#[derive(Default)]
struct EventRegistry {
    queued: HashMap<String, VecDeque<WorkflowEvent>>,
    claimed: HashMap<String, VecDeque<WorkflowEvent>>,
    waiters: HashMap<String, VecDeque<oneshot::Sender<WorkflowEvent>>>,
}

impl EventRegistry {
    fn claim(&mut self, event: WorkflowEvent) {
        self.claimed
            .entry(event.event_type.clone())
            .or_default()
            .push_back(event);
    }

    fn release(&mut self, event: &WorkflowEvent) -> bool {
        let Some(claimed) = self.claimed.get_mut(&event.event_type) else {
            return false;
        };
        match claimed.iter().position(|e| e == event) {
            Some(index) => claimed.remove(index).is_some(),
            None => false,
        }
    }

    /// Events that must survive a restart: claimed first, then queued.
    fn snapshot(&self) -> HashMap<String, VecDeque<WorkflowEvent>> {
        let mut snapshot = self.claimed.clone();
        for (event_type, queued) in &self.queued {
            snapshot
                .entry(event_type.clone())
                .or_default()
                .extend(queued.iter().cloned());
        }
        snapshot
    }

    fn to_store_op(&self) -> Result<StoreOp, WorkflowError> {
        let value = serde_json::to_value(self.snapshot())
            .map_err(|e| WorkflowError::Internal(format!("failed to encode event map: {e}")))?;
        Ok(StoreOp::put(EVENT_MAP, value))
    }
}

/// Result of asking for the next event of a type.
pub(crate) enum EventClaim {
    Ready(WorkflowEvent),
    Pending(oneshot::Receiver<WorkflowEvent>),
}

type StatusWaiter = oneshot::Sender<Result<(), WorkflowError>>;
type StepWaiter = oneshot::Sender<Result<Value, WorkflowError>>;

/// Clears `is_running` on every exit path of `init`, including task abort.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Controller of one workflow instance.
pub struct Engine {
    instance_id: String,
    store: BoxDurableStore,
    workflow: Arc<dyn Workflow>,
    hasher: Arc<dyn ContentHasher>,
    clock: Arc<dyn Clock>,
    alarm: Option<Arc<dyn AlarmScheduler>>,
    config: EngineConfig,
    wake_queue: OnceCell<WakeQueue>,
    is_running: AtomicBool,
    cancel: CancellationToken,
    /// Bounds how many steps may be in flight at once.
    step_permits: Arc<Semaphore>,
    status_waiters: DashMap<InstanceStatus, Vec<StatusWaiter>>,
    step_waiters: DashMap<String, Vec<StepWaiter>>,
    events: Mutex<EventRegistry>,
}

impl Engine {
    pub fn new(
        instance_id: impl Into<String>,
        store: BoxDurableStore,
        workflow: Arc<dyn Workflow>,
        hasher: Arc<dyn ContentHasher>,
        config: EngineConfig,
    ) -> Self {
        let permits = config.max_concurrent_steps.max(1);
        Self {
            instance_id: instance_id.into(),
            store,
            workflow,
            hasher,
            clock: Arc::new(SystemClock),
            alarm: None,
            config,
            wake_queue: OnceCell::new(),
            is_running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            step_permits: Arc::new(Semaphore::new(permits)),
            status_waiters: DashMap::new(),
            step_waiters: DashMap::new(),
            events: Mutex::new(EventRegistry::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_alarm(mut self, alarm: Arc<dyn AlarmScheduler>) -> Self {
        self.alarm = Some(alarm);
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn store(&self) -> &BoxDurableStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Test and introspection hooks for this instance.
    pub fn modifier(self: &Arc<Self>) -> InstanceModifier {
        InstanceModifier::new(Arc::clone(self))
    }

    /// Hash of `name` for cache keys of the given call kind.
    pub(crate) fn hash_call(&self, kind: CallKind, name: &str) -> String {
        self.hasher.compute_hash(&kind.hash_input(name))
    }

    pub(crate) fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn ensure_not_aborted(&self) -> Result<(), WorkflowError> {
        if self.is_aborted() {
            return Err(aborted());
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Bootstrap / resume
    // -----------------------------------------------------------------------

    /// Bootstrap or resume the instance and run the workflow to its next
    /// suspension, completion or failure.
    ///
    /// On resume the persisted metadata wins over `metadata`, so the trigger
    /// payload stays immutable across restarts.
    pub async fn init(self: Arc<Self>, metadata: InstanceMetadata) -> Result<(), WorkflowError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            tracing::debug!(instance_id = %self.instance_id, "instance already running");
            return Ok(());
        }
        let _running = RunningGuard(&self.is_running);

        let queue = self.wake_queue().await?;
        let missed = queue.pop_past_entries(self.now_ms()).await?;
        if !missed.is_empty() {
            tracing::debug!(
                instance_id = %self.instance_id,
                count = missed.len(),
                "discarded wake entries that elapsed while idle"
            );
        }
        self.schedule_next_alarm().await;

        let status = self.get_status().await?;
        if status.is_terminal() {
            tracing::info!(instance_id = %self.instance_id, status = %status, "instance already finished");
            return Ok(());
        }

        let metadata = match self.metadata().await? {
            Some(persisted) => {
                tracing::info!(instance_id = %self.instance_id, "resuming instance");
                persisted
            }
            None => {
                self.bootstrap(&metadata).await?;
                metadata
            }
        };

        self.restore_events().await?;
        self.set_status(InstanceStatus::Running).await?;

        let ctx = Context::new(Arc::clone(&self));
        let result = self.workflow.run(metadata.event.clone(), ctx).await;

        if self.is_aborted() {
            tracing::info!(instance_id = %self.instance_id, "instance aborted");
            return Ok(());
        }
        if self.get_status().await?.is_terminal() {
            return Ok(());
        }

        match result {
            Ok(output) => {
                let entry = NewLogEntry::new(
                    InstanceEvent::WorkflowSuccess,
                    None,
                    None,
                    json!({ "result": output }),
                );
                self.set_status_with_log(InstanceStatus::Complete, Some(entry))
                    .await?;
            }
            Err(error) => self.fail_instance(&error).await?,
        }
        Ok(())
    }

    /// Re-enter from persisted metadata. No-op if the instance was never
    /// bootstrapped.
    pub async fn init_from_storage(self: Arc<Self>) -> Result<(), WorkflowError> {
        match self.metadata().await? {
            Some(metadata) => self.init(metadata).await,
            None => {
                tracing::debug!(instance_id = %self.instance_id, "no persisted metadata, nothing to resume");
                Ok(())
            }
        }
    }

    async fn bootstrap(&self, metadata: &InstanceMetadata) -> Result<(), WorkflowError> {
        let value = serde_json::to_value(metadata)
            .map_err(|e| WorkflowError::Internal(format!("failed to encode instance metadata: {e}")))?;
        self.store
            .transaction(vec![
                StoreOp::put(INSTANCE_METADATA, value),
                StoreOp::put(INSTANCE_STATUS, json!(InstanceStatus::Queued)),
                StoreOp::AppendLog(NewLogEntry::new(InstanceEvent::WorkflowQueued, None, None, json!({}))),
                StoreOp::AppendLog(NewLogEntry::new(InstanceEvent::WorkflowStart, None, None, json!({}))),
            ])
            .await?;
        tracing::info!(
            instance_id = %self.instance_id,
            workflow = %metadata.workflow.name,
            "bootstrapped instance"
        );
        Ok(())
    }

    async fn fail_instance(&self, error: &WorkflowError) -> Result<(), WorkflowError> {
        let record = if error.is_non_retryable() {
            ErrorRecord::new(
                FATAL_ERROR_NAME,
                "The execution of the Workflow instance was terminated, as a step threw a NonRetryableError and it was not handled",
            )
        } else {
            error.to_record()
        };

        if error.is_user_error() {
            tracing::info!(instance_id = %self.instance_id, error = %error, "workflow failed");
        } else {
            tracing::error!(instance_id = %self.instance_id, error = %error, "workflow failed with internal error");
        }

        let entry = NewLogEntry::new(
            InstanceEvent::WorkflowFailure,
            None,
            None,
            json!({ "error": record }),
        );
        self.set_status_with_log(InstanceStatus::Errored, Some(entry))
            .await
    }

    /// Stop every suspension point of the current run. Nothing further is
    /// logged for this run.
    pub fn abort(&self, reason: &str) {
        tracing::warn!(instance_id = %self.instance_id, reason, "aborting instance");
        self.cancel.cancel();
    }

    /// Abort and wipe the partition. Test cleanup only.
    pub async fn unsafe_teardown(&self) -> Result<(), WorkflowError> {
        self.abort("teardown");
        self.store.clear().await?;
        Ok(())
    }

    pub async fn metadata(&self) -> Result<Option<InstanceMetadata>, WorkflowError> {
        self.store
            .get(INSTANCE_METADATA)
            .await?
            .map(|value| decode(value, "instance metadata"))
            .transpose()
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Persisted status, `Queued` if none was written yet.
    pub async fn get_status(&self) -> Result<InstanceStatus, WorkflowError> {
        match self.store.get(INSTANCE_STATUS).await? {
            Some(value) => decode(value, "instance status"),
            None => Ok(InstanceStatus::Queued),
        }
    }

    pub async fn set_status(&self, status: InstanceStatus) -> Result<(), WorkflowError> {
        self.set_status_with_log(status, None).await
    }

    /// Persist `status` and an optional log entry in one transaction, then
    /// settle status waiters. Terminal statuses are never left.
    pub async fn set_status_with_log(
        &self,
        status: InstanceStatus,
        entry: Option<NewLogEntry>,
    ) -> Result<(), WorkflowError> {
        let current = self.get_status().await?;
        if current.is_terminal() {
            tracing::warn!(
                instance_id = %self.instance_id,
                current = %current,
                requested = %status,
                "ignoring status change of finished instance"
            );
            return Ok(());
        }

        let mut ops = vec![StoreOp::put(INSTANCE_STATUS, json!(status))];
        ops.extend(entry.map(StoreOp::AppendLog));
        self.store.transaction(ops).await?;

        if status.is_terminal() {
            tracing::info!(instance_id = %self.instance_id, status = %status, "instance finished");
        } else {
            tracing::debug!(instance_id = %self.instance_id, status = %status, "status changed");
        }
        self.resolve_status_waiters(status);
        Ok(())
    }

    fn resolve_status_waiters(&self, status: InstanceStatus) {
        if let Some((_, waiters)) = self.status_waiters.remove(&status) {
            for waiter in waiters {
                let _ = waiter.send(Ok(()));
            }
        }
        if !status.is_terminal() {
            return;
        }

        let unreachable: Vec<InstanceStatus> = self.status_waiters.iter().map(|e| *e.key()).collect();
        for expected in unreachable {
            if let Some((_, waiters)) = self.status_waiters.remove(&expected) {
                for waiter in waiters {
                    let _ = waiter.send(Err(WorkflowError::Fatal(format!(
                        "The Workflow instance {} has reached status '{status}'. This is a finite status that prevents it from ever reaching the expected status of '{expected}'.",
                        self.instance_id
                    ))));
                }
            }
        }
    }

    /// Resolve once the instance reaches `status`; fail as soon as it reaches
    /// a different terminal status.
    pub async fn wait_for_status(&self, status: InstanceStatus) -> Result<(), WorkflowError> {
        let (tx, rx) = oneshot::channel();
        self.status_waiters.entry(status).or_default().push(tx);

        let current = self.get_status().await?;
        if current == status || current.is_terminal() {
            self.resolve_status_waiters(current);
        }

        rx.await
            .map_err(|_| WorkflowError::Internal("status waiter dropped".to_string()))?
    }

    /// Current status plus output (when complete) or error (when errored).
    pub async fn status_details(&self) -> Result<InstanceStatusDetails, WorkflowError> {
        let status = self.get_status().await?;
        let output = match status {
            InstanceStatus::Complete => Some(self.get_output_or_error(true).await?),
            _ => None,
        };
        let error = match status {
            InstanceStatus::Errored => {
                let value = self.get_output_or_error(false).await?;
                serde_json::from_value::<ErrorRecord>(value).ok()
            }
            _ => None,
        };
        Ok(InstanceStatusDetails {
            status,
            output,
            error,
        })
    }

    /// Output of a complete instance (`is_output`) or error of an errored one.
    /// Fails if the instance is not in the matching terminal status.
    pub async fn get_output_or_error(&self, is_output: bool) -> Result<Value, WorkflowError> {
        let status = self.get_status().await?;
        let (expected, event, field) = if is_output {
            (InstanceStatus::Complete, InstanceEvent::WorkflowSuccess, "result")
        } else {
            (InstanceStatus::Errored, InstanceEvent::WorkflowFailure, "error")
        };
        if status != expected {
            return Err(WorkflowError::Internal(format!(
                "Cannot retrieve {}: Workflow instance is in status '{status}' but must be '{expected}'",
                if is_output { "output" } else { "error" }
            )));
        }

        let logs = self.store.read_logs(None).await?;
        Ok(logs
            .iter()
            .rev()
            .find(|entry| entry.event == event)
            .and_then(|entry| entry.metadata.get(field).cloned())
            .unwrap_or(Value::Null))
    }

    // -----------------------------------------------------------------------
    // Event log
    // -----------------------------------------------------------------------

    /// Append a log entry; a step outcome settles that step's waiters.
    pub async fn write_log(
        &self,
        event: InstanceEvent,
        group_key: Option<&str>,
        target: Option<&str>,
        metadata: Value,
    ) -> Result<(), WorkflowError> {
        let entry = NewLogEntry::new(event, group_key, target, metadata);
        let resolution = match (group_key, event.is_step_outcome()) {
            (Some(group), true) => Some((group.to_string(), step_outcome(event, &entry.metadata))),
            _ => None,
        };

        self.store.append_log(entry).await?;

        if let Some((group, outcome)) = resolution {
            self.resolve_step_waiters(&group, outcome);
        }
        Ok(())
    }

    pub async fn read_logs(&self) -> Result<Vec<LogEntry>, WorkflowError> {
        Ok(self.store.read_logs(None).await?)
    }

    pub(crate) async fn read_logs_for(&self, group_key: &str) -> Result<Vec<LogEntry>, WorkflowError> {
        Ok(self.store.read_logs(Some(group_key)).await?)
    }

    fn resolve_step_waiters(&self, group_key: &str, outcome: Result<Value, WorkflowError>) {
        if let Some((_, waiters)) = self.step_waiters.remove(group_key) {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    /// Result of the `index`-th occurrence (1-based) of step `name`, waiting
    /// for it if the step has not finished yet.
    pub async fn wait_for_step_result(&self, name: &str, index: u32) -> Result<Value, WorkflowError> {
        let key = CacheKey::new(&self.hash_call(CallKind::Step, name), index);
        let (tx, rx) = oneshot::channel();
        self.step_waiters
            .entry(key.as_str().to_string())
            .or_default()
            .push(tx);

        let logs = self.read_logs_for(key.as_str()).await?;
        if let Some(last) = logs.iter().rev().find(|entry| entry.event.is_step_outcome()) {
            self.resolve_step_waiters(key.as_str(), step_outcome(last.event, &last.metadata));
        }

        rx.await
            .map_err(|_| WorkflowError::Internal("step waiter dropped".to_string()))?
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Deliver an external event.
    ///
    /// The event is queued (and persisted) first, then handed to the oldest
    /// waiter of its type. Events for finished instances are dropped. If the
    /// instance is idle and the type is not mocked, the instance is re-entered
    /// so that a pending wait can consume the event.
    pub async fn receive_event(self: &Arc<Self>, event: WorkflowEvent) -> Result<(), WorkflowError> {
        let status = self.get_status().await?;
        if status.is_terminal() {
            tracing::debug!(
                instance_id = %self.instance_id,
                event_type = %event.event_type,
                status = %status,
                "dropping event for finished instance"
            );
            return Ok(());
        }

        let event_type = event.event_type.clone();
        {
            let mut guard = self.events.lock().await;
            let registry = &mut *guard;
            let queue = registry.queued.entry(event_type.clone()).or_default();
            queue.push_back(event);

            if let Some(waiters) = registry.waiters.get_mut(&event_type) {
                while let Some(waiter) = waiters.pop_front() {
                    let Some(next) = queue.pop_front() else {
                        waiters.push_front(waiter);
                        break;
                    };
                    let handed = next.clone();
                    match waiter.send(next) {
                        Ok(()) => registry
                            .claimed
                            .entry(event_type.clone())
                            .or_default()
                            .push_back(handed),
                        Err(unclaimed) => queue.push_front(unclaimed),
                    }
                }
            }
            self.store.transaction(vec![registry.to_store_op()?]).await?;
        }
        tracing::debug!(instance_id = %self.instance_id, event_type = %event_type, "event received");

        if !self.is_running() && !self.store.contains(&mock_event_key(&event_type)).await? {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                let instance_id = engine.instance_id.clone();
                if let Err(e) = engine.init_from_storage().await {
                    tracing::error!(instance_id = %instance_id, error = %e, "failed to resume instance for event");
                }
            });
        }
        Ok(())
    }

    /// Take the oldest queued event of `event_type`, or register as its next
    /// FIFO waiter. The taken event stays persisted until
    /// [`Engine::commit_event_wait`] records the wait's outcome.
    pub(crate) async fn claim_event(&self, event_type: &str) -> Result<EventClaim, WorkflowError> {
        let mut guard = self.events.lock().await;
        let registry = &mut *guard;

        if let Some(event) = registry
            .queued
            .get_mut(event_type)
            .and_then(|queue| queue.pop_front())
        {
            registry.claim(event.clone());
            return Ok(EventClaim::Ready(event));
        }

        let (tx, rx) = oneshot::channel();
        registry
            .waiters
            .entry(event_type.to_string())
            .or_default()
            .push_back(tx);
        Ok(EventClaim::Pending(rx))
    }

    async fn restore_events(&self) -> Result<(), WorkflowError> {
        let queued: HashMap<String, VecDeque<WorkflowEvent>> = match self.store.get(EVENT_MAP).await? {
            Some(value) => decode(value, "event map")?,
            None => HashMap::new(),
        };
        let mut registry = self.events.lock().await;
        registry.queued = queued;
        registry.claimed.clear();
        Ok(())
    }

    /// Commit a wait's outcome `ops`, the release of its claimed `event` and
    /// the retirement of its timeout entry in one transaction.
    pub(crate) async fn commit_event_wait(
        &self,
        event: &WorkflowEvent,
        timeout_hash: &str,
        mut ops: Vec<StoreOp>,
    ) -> Result<(), WorkflowError> {
        let mut registry = self.events.lock().await;
        let released = registry.release(event);
        ops.push(registry.to_store_op()?);

        let committed = self.remove_wake_with(timeout_hash, WakeKind::Timeout, ops).await;
        if committed.is_err() && released {
            registry.claim(event.clone());
        }
        committed
    }

    // -----------------------------------------------------------------------
    // Wake queue and host timers
    // -----------------------------------------------------------------------

    /// The wake queue, rebuilt from the journal on first use.
    pub async fn wake_queue(&self) -> Result<&WakeQueue, RepositoryError> {
        self.wake_queue
            .get_or_try_init(|| WakeQueue::load(self.store.clone()))
            .await
    }

    pub(crate) async fn add_wake(&self, entry: WakeEntry) -> Result<(), WorkflowError> {
        self.add_wake_with(entry, Vec::new()).await
    }

    /// Add a wake entry, committing `ops` in the same transaction.
    pub(crate) async fn add_wake_with(&self, entry: WakeEntry, ops: Vec<StoreOp>) -> Result<(), WorkflowError> {
        self.wake_queue().await?.add_with(entry, ops).await?;
        self.schedule_next_alarm().await;
        Ok(())
    }

    pub(crate) async fn remove_wake(&self, hash: &str, kind: WakeKind) -> Result<(), WorkflowError> {
        self.remove_wake_with(hash, kind, Vec::new()).await
    }

    /// Retire a wake entry, committing `ops` in the same transaction.
    pub(crate) async fn remove_wake_with(
        &self,
        hash: &str,
        kind: WakeKind,
        ops: Vec<StoreOp>,
    ) -> Result<(), WorkflowError> {
        self.wake_queue().await?.remove_with(hash, kind, ops).await?;
        self.schedule_next_alarm().await;
        Ok(())
    }

    async fn schedule_next_alarm(&self) {
        let Some(alarm) = &self.alarm else {
            return;
        };
        let Ok(queue) = self.wake_queue().await else {
            return;
        };
        if let Some(at_ms) = queue.next_timestamp().await {
            alarm.set_alarm(&self.instance_id, at_ms);
        }
    }

    /// Suspend until `target_ms`, or fail if the instance is aborted first.
    pub(crate) async fn suspend_until(&self, target_ms: i64) -> Result<(), WorkflowError> {
        let delay = u64::try_from(target_ms.saturating_sub(self.now_ms())).unwrap_or(0);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(aborted()),
            _ = tokio::time::sleep(Duration::from_millis(delay)) => Ok(()),
        }
    }

    /// Permit to run one step attempt.
    pub(crate) async fn acquire_step_permit(&self) -> Result<OwnedSemaphorePermit, WorkflowError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(aborted()),
            permit = Arc::clone(&self.step_permits).acquire_owned() => permit
                .map_err(|_| WorkflowError::Internal("step permits closed".to_string())),
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("instance_id", &self.instance_id)
            .field("is_running", &self.is_running())
            .field("is_aborted", &self.is_aborted())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn aborted() -> WorkflowError {
    WorkflowError::Aborted("instance was aborted".to_string())
}

pub(crate) fn decode<T: DeserializeOwned>(value: Value, what: &str) -> Result<T, WorkflowError> {
    serde_json::from_value(value).map_err(|e| WorkflowError::Internal(format!("invalid {what}: {e}")))
}

/// Settle a step waiter from a `STEP_SUCCESS` / `STEP_FAILURE` entry.
fn step_outcome(event: InstanceEvent, metadata: &Value) -> Result<Value, WorkflowError> {
    match event {
        InstanceEvent::StepSuccess => Ok(metadata.get("result").cloned().unwrap_or(Value::Null)),
        _ => Err(metadata
            .get("error")
            .cloned()
            .and_then(|error| serde_json::from_value::<ErrorRecord>(error).ok())
            .map(WorkflowError::from_record)
            .unwrap_or_else(|| WorkflowError::Internal("step failed without a recorded error".to_string()))),
    }
}
