//! Instance creation and lookup for one workflow definition.
//!
//! A `WorkflowBinding` owns the engines of its instances (one per instance
//! id, created lazily over the instance's storage partition) and a tokio
//! alarm that re-enters idle instances when their next wake entry comes due.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use stepwise_types::config::EngineConfig;
use stepwise_types::error::{RepositoryError, WorkflowError};
use stepwise_types::event::{TriggerEvent, WorkflowEvent};
use stepwise_types::instance::{
    InstanceMeta, InstanceMetadata, InstanceStatus, InstanceStatusDetails, VersionMeta, WorkflowMeta,
};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::clock::AlarmScheduler;
use super::engine::{Engine, Workflow};
use super::validators::{MAX_INSTANCE_ID_LENGTH, validate_instance_id};
use crate::service::hash::ContentHasher;
use crate::storage::box_store::BoxDurableStore;

/// Source of per-instance storage partitions.
pub trait StoreProvider: Send + Sync {
    fn partition(&self, instance_id: &str) -> BoxDurableStore;
}

// ---------------------------------------------------------------------------
// WorkflowBinding
// ---------------------------------------------------------------------------

/// Entry point for creating and addressing instances of one workflow.
#[derive(Clone)]
pub struct WorkflowBinding {
    inner: Arc<BindingInner>,
}

struct BindingInner {
    account_id: i64,
    workflow_name: String,
    version_id: String,
    workflow: Arc<dyn Workflow>,
    provider: Arc<dyn StoreProvider>,
    hasher: Arc<dyn ContentHasher>,
    config: EngineConfig,
    engines: DashMap<String, Arc<Engine>>,
    alarm: Arc<TokioAlarm>,
}

impl BindingInner {
    fn engine(&self, instance_id: &str) -> Arc<Engine> {
        self.engines
            .entry(instance_id.to_string())
            .or_insert_with(|| {
                let alarm: Arc<dyn AlarmScheduler> = self.alarm.clone();
                Arc::new(
                    Engine::new(
                        instance_id,
                        self.provider.partition(instance_id),
                        Arc::clone(&self.workflow),
                        Arc::clone(&self.hasher),
                        self.config.clone(),
                    )
                    .with_alarm(alarm),
                )
            })
            .clone()
    }
}

impl WorkflowBinding {
    pub fn new(
        workflow_name: impl Into<String>,
        workflow: impl Workflow,
        provider: Arc<dyn StoreProvider>,
        hasher: Arc<dyn ContentHasher>,
        config: EngineConfig,
    ) -> Self {
        let workflow_name = workflow_name.into();
        let inner = Arc::new_cyclic(|weak| BindingInner {
            account_id: 0,
            version_id: format!("{workflow_name}@1"),
            workflow_name,
            workflow: Arc::new(workflow),
            provider,
            hasher,
            config,
            engines: DashMap::new(),
            alarm: Arc::new(TokioAlarm::new(weak.clone())),
        });
        Self { inner }
    }

    pub fn workflow_name(&self) -> &str {
        &self.inner.workflow_name
    }

    /// Engine for `instance_id`, created over its partition if needed.
    pub fn engine(&self, instance_id: &str) -> Arc<Engine> {
        self.inner.engine(instance_id)
    }

    /// Create and start a new instance. The id defaults to a UUIDv7.
    ///
    /// Fails if the id is malformed or already in use.
    pub async fn create(&self, id: Option<String>, params: Value) -> Result<InstanceHandle, WorkflowError> {
        let id = id.unwrap_or_else(|| Uuid::now_v7().to_string());
        if !validate_instance_id(&id) {
            return Err(WorkflowError::Fatal(format!(
                "Instance id \"{id}\" must match ^[a-zA-Z0-9_][a-zA-Z0-9-_]*$ and be at most {MAX_INSTANCE_ID_LENGTH} characters"
            )));
        }

        let engine = self.engine(&id);
        if engine.metadata().await?.is_some() {
            return Err(RepositoryError::Conflict(format!("instance {id} already exists")).into());
        }

        let metadata = InstanceMetadata {
            account_id: self.inner.account_id,
            workflow: WorkflowMeta {
                id: self.inner.workflow_name.clone(),
                name: self.inner.workflow_name.clone(),
            },
            version: VersionMeta {
                id: self.inner.version_id.clone(),
            },
            instance: InstanceMeta {
                id: id.clone(),
                created_on: Utc::now(),
            },
            event: TriggerEvent::new(&id, params),
        };

        tracing::info!(instance_id = %id, workflow = %self.inner.workflow_name, "creating instance");
        let runner = Arc::clone(&engine);
        tokio::spawn(async move {
            let instance_id = runner.instance_id().to_string();
            if let Err(e) = runner.init(metadata).await {
                tracing::error!(instance_id = %instance_id, error = %e, "instance run failed");
            }
        });

        Ok(InstanceHandle { id, engine })
    }

    /// Create several instances; stops at the first failure.
    pub async fn create_batch(
        &self,
        instances: Vec<(Option<String>, Value)>,
    ) -> Result<Vec<InstanceHandle>, WorkflowError> {
        let mut handles = Vec::with_capacity(instances.len());
        for (id, params) in instances {
            handles.push(self.create(id, params).await?);
        }
        Ok(handles)
    }

    /// Handle of an existing instance.
    pub async fn get(&self, id: &str) -> Result<InstanceHandle, WorkflowError> {
        if !validate_instance_id(id) {
            return Err(RepositoryError::NotFound.into());
        }
        let engine = self.engine(id);
        if engine.metadata().await?.is_none() {
            return Err(RepositoryError::NotFound.into());
        }
        Ok(InstanceHandle {
            id: id.to_string(),
            engine,
        })
    }

    /// Handle of an existing instance, re-entering it from storage if idle.
    ///
    /// This is how a host resumes instances after a process restart.
    pub async fn recover(&self, id: &str) -> Result<InstanceHandle, WorkflowError> {
        let handle = self.get(id).await?;
        if !handle.engine.is_running() {
            let runner = Arc::clone(&handle.engine);
            tokio::spawn(async move {
                let instance_id = runner.instance_id().to_string();
                if let Err(e) = runner.init_from_storage().await {
                    tracing::error!(instance_id = %instance_id, error = %e, "instance recovery failed");
                }
            });
        }
        Ok(handle)
    }
}

impl std::fmt::Debug for WorkflowBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowBinding")
            .field("workflow_name", &self.inner.workflow_name)
            .field("instances", &self.inner.engines.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// InstanceHandle
// ---------------------------------------------------------------------------

/// Caller-facing handle of one instance.
#[derive(Debug, Clone)]
pub struct InstanceHandle {
    id: String,
    engine: Arc<Engine>,
}

impl InstanceHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub async fn status(&self) -> Result<InstanceStatusDetails, WorkflowError> {
        self.engine.status_details().await
    }

    pub async fn send_event(&self, event_type: &str, payload: Value) -> Result<(), WorkflowError> {
        self.engine
            .receive_event(WorkflowEvent::new(event_type, payload))
            .await
    }

    /// Resolve once the instance reaches `status`.
    pub async fn wait_for_status(&self, status: InstanceStatus) -> Result<(), WorkflowError> {
        self.engine.wait_for_status(status).await
    }

    pub async fn pause(&self) -> Result<(), WorkflowError> {
        Err(not_supported("pause"))
    }

    pub async fn resume(&self) -> Result<(), WorkflowError> {
        Err(not_supported("resume"))
    }

    pub async fn terminate(&self) -> Result<(), WorkflowError> {
        Err(not_supported("terminate"))
    }

    pub async fn restart(&self) -> Result<(), WorkflowError> {
        Err(not_supported("restart"))
    }
}

fn not_supported(operation: &str) -> WorkflowError {
    WorkflowError::NotSupported(format!("{operation} is not implemented for workflow instances"))
}

// ---------------------------------------------------------------------------
// TokioAlarm
// ---------------------------------------------------------------------------

/// `AlarmScheduler` backed by one tokio timer task per instance.
///
/// When a timer fires and the instance is idle, it is re-entered from its
/// persisted metadata. A running instance wakes itself.
struct TokioAlarm {
    binding: Weak<BindingInner>,
    timers: DashMap<String, JoinHandle<()>>,
}

impl TokioAlarm {
    fn new(binding: Weak<BindingInner>) -> Self {
        Self {
            binding,
            timers: DashMap::new(),
        }
    }
}

impl AlarmScheduler for TokioAlarm {
    fn set_alarm(&self, instance_id: &str, at_ms: i64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(instance_id, "no tokio runtime, alarm not scheduled");
            return;
        };

        let delay = u64::try_from(at_ms.saturating_sub(Utc::now().timestamp_millis())).unwrap_or(0);
        let binding = self.binding.clone();
        let id = instance_id.to_string();
        let timer = runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            // The wake runs detached so replacing this timer never cancels it.
            tokio::spawn(wake_instance(binding, id));
        });

        if let Some(previous) = self.timers.insert(instance_id.to_string(), timer) {
            previous.abort();
        }
    }
}

async fn wake_instance(binding: Weak<BindingInner>, instance_id: String) {
    let Some(binding) = binding.upgrade() else {
        return;
    };
    let engine = binding.engine(&instance_id);
    if engine.is_running() || engine.is_aborted() {
        return;
    }
    tracing::debug!(instance_id = %instance_id, "alarm fired, re-entering instance");
    if let Err(e) = engine.init_from_storage().await {
        tracing::error!(instance_id = %instance_id, error = %e, "alarm re-entry failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStoreProvider;
    use crate::workflow::{Context, FnWorkflow};
    use serde_json::json;

    struct PlainHasher;

    impl ContentHasher for PlainHasher {
        fn compute_hash(&self, content: &str) -> String {
            content.to_string()
        }
    }

    fn binding() -> WorkflowBinding {
        let workflow = FnWorkflow::new(|event: TriggerEvent, ctx: Context| async move {
            let doubled: i64 = ctx
                .do_step("double", || {
                    let n = event.payload["n"].as_i64().unwrap_or_default();
                    async move { Ok(n * 2) }
                })
                .await?;
            Ok::<_, WorkflowError>(json!({ "doubled": doubled }))
        });
        WorkflowBinding::new(
            "doubler",
            workflow,
            Arc::new(InMemoryStoreProvider::new()),
            Arc::new(PlainHasher),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_create_runs_to_completion() {
        let binding = binding();
        let handle = binding
            .create(Some("job-1".into()), json!({"n": 21}))
            .await
            .unwrap();
        handle.wait_for_status(InstanceStatus::Complete).await.unwrap();

        let details = handle.status().await.unwrap();
        assert_eq!(details.output, Some(json!({"doubled": 42})));
        assert!(details.error.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_ids_are_rejected() {
        let binding = binding();
        binding.create(Some("dup".into()), json!({})).await.unwrap();
        binding
            .engine("dup")
            .wait_for_status(InstanceStatus::Complete)
            .await
            .unwrap();

        let err = binding.create(Some("dup".into()), json!({})).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Storage(RepositoryError::Conflict(_))));
        assert!(binding.create(Some("-bad".into()), json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_generated_id_and_get() {
        let binding = binding();
        let handle = binding.create(None, json!({"n": 1})).await.unwrap();
        assert!(validate_instance_id(handle.id()));
        handle.wait_for_status(InstanceStatus::Complete).await.unwrap();

        let fetched = binding.get(handle.id()).await.unwrap();
        assert_eq!(fetched.id(), handle.id());
        assert!(matches!(
            binding.get("missing").await.unwrap_err(),
            WorkflowError::Storage(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_controls_are_not_supported() {
        let binding = binding();
        let handle = binding.create(None, json!({})).await.unwrap();
        assert!(matches!(handle.pause().await, Err(WorkflowError::NotSupported(_))));
        assert!(matches!(handle.resume().await, Err(WorkflowError::NotSupported(_))));
        assert!(matches!(handle.terminate().await, Err(WorkflowError::NotSupported(_))));
        assert!(matches!(handle.restart().await, Err(WorkflowError::NotSupported(_))));
    }

    #[tokio::test]
    async fn test_create_batch() {
        let binding = binding();
        let handles = binding
            .create_batch(vec![(Some("a".into()), json!({"n": 1})), (Some("b".into()), json!({"n": 2}))])
            .await
            .unwrap();
        assert_eq!(handles.len(), 2);
        for handle in handles {
            handle.wait_for_status(InstanceStatus::Complete).await.unwrap();
        }
    }
}
