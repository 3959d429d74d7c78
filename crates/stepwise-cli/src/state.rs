//! Application state wiring the engine to its SQLite storage.
//!
//! AppState opens the data directory, loads `config.toml`, and registers one
//! `WorkflowBinding` per built-in demo workflow. Every binding shares the
//! same database pool; instances are partitioned by id.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, bail};
use stepwise_core::workflow::keys::INSTANCE_METADATA;
use stepwise_core::workflow::{StoreProvider, WorkflowBinding};
use stepwise_infra::config::{load_engine_config, resolve_data_dir};
use stepwise_infra::crypto::hash::Sha256ContentHasher;
use stepwise_infra::sqlite::durable_store::SqliteStoreProvider;
use stepwise_infra::sqlite::pool::{DatabasePool, default_database_url};
use stepwise_types::config::EngineConfig;
use stepwise_types::instance::InstanceMetadata;

use crate::demos;

/// Shared state for all CLI commands.
pub struct AppState {
    pub data_dir: PathBuf,
    provider: Arc<SqliteStoreProvider>,
    bindings: BTreeMap<&'static str, WorkflowBinding>,
}

impl AppState {
    /// Initialize the application state: open the DB, register workflows.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let db_pool = DatabasePool::new(&default_database_url()).await?;
        let config = load_engine_config(&data_dir).await;

        Ok(Self::with_pool(data_dir, db_pool, config))
    }

    pub fn with_pool(data_dir: PathBuf, db_pool: DatabasePool, config: EngineConfig) -> Self {
        let provider = Arc::new(SqliteStoreProvider::new(db_pool));
        let hasher = Arc::new(Sha256ContentHasher::new());

        let bindings = demos::NAMES
            .iter()
            .filter_map(|name| {
                let binding = demos::bind(name, provider.clone(), hasher.clone(), config.clone())?;
                Some((*name, binding))
            })
            .collect();

        Self {
            data_dir,
            provider,
            bindings,
        }
    }

    /// Binding for a workflow by name.
    pub fn binding(&self, workflow: &str) -> anyhow::Result<&WorkflowBinding> {
        match self.bindings.get(workflow) {
            Some(binding) => Ok(binding),
            None => bail!(
                "Unknown workflow '{workflow}' (available: {})",
                demos::NAMES.join(", ")
            ),
        }
    }

    /// Binding of the workflow an existing instance was created from.
    pub async fn binding_for_instance(&self, id: &str) -> anyhow::Result<&WorkflowBinding> {
        let metadata = self
            .provider
            .partition(id)
            .get(INSTANCE_METADATA)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read instance '{id}': {e}"))?
            .ok_or_else(|| anyhow::anyhow!("Instance '{id}' not found"))?;

        let metadata: InstanceMetadata =
            serde_json::from_value(metadata).context("Corrupt instance metadata")?;
        self.binding(&metadata.workflow.name)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use stepwise_types::instance::InstanceStatus;

    use super::*;

    async fn test_state() -> AppState {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("cli.db").display());
        let data_dir = dir.path().to_path_buf();
        std::mem::forget(dir);
        let pool = DatabasePool::new(&url).await.unwrap();
        AppState::with_pool(data_dir, pool, EngineConfig::default())
    }

    #[tokio::test]
    async fn test_all_demos_registered() {
        let state = test_state().await;
        for name in demos::NAMES {
            assert_eq!(state.binding(name).unwrap().workflow_name(), name);
        }
        assert!(state.binding("missing").is_err());
    }

    #[tokio::test]
    async fn test_binding_for_instance_reads_metadata() {
        let state = test_state().await;
        let handle = state
            .binding("approval")
            .unwrap()
            .create(Some("req-1".into()), json!({"request": "laptop"}))
            .await
            .unwrap();
        handle.wait_for_status(InstanceStatus::Running).await.unwrap();
        handle.engine().abort("test over");

        let binding = state.binding_for_instance("req-1").await.unwrap();
        assert_eq!(binding.workflow_name(), "approval");
        assert!(state.binding_for_instance("nope").await.is_err());
    }
}
