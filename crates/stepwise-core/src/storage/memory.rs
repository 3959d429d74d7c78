//! In-memory `DurableStore`.
//!
//! Clones share the same underlying partition, so a second `Engine` built
//! over a clone observes exactly what the first one committed. This is how
//! the tests simulate a process restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use serde_json::Value;
use stepwise_types::error::RepositoryError;
use stepwise_types::instance::LogEntry;
use stepwise_types::wake::WakeJournalRow;

use super::box_store::BoxDurableStore;
use super::durable_store::{DurableStore, StoreOp};
use crate::workflow::binding::StoreProvider;

#[derive(Debug, Default)]
struct Partition {
    kv: HashMap<String, Value>,
    logs: Vec<LogEntry>,
    journal: Vec<WakeJournalRow>,
    next_log_id: i64,
}

impl Partition {
    fn apply(&mut self, op: StoreOp) {
        match op {
            StoreOp::Put { key, value } => {
                self.kv.insert(key, value);
            }
            StoreOp::Delete { key } => {
                self.kv.remove(&key);
            }
            StoreOp::AppendLog(entry) => {
                self.next_log_id += 1;
                self.logs.push(LogEntry {
                    id: self.next_log_id,
                    event: entry.event,
                    group_key: entry.group_key,
                    target: entry.target,
                    metadata: entry.metadata,
                    timestamp: entry.timestamp,
                });
            }
            StoreOp::AppendWakeJournal(row) => {
                let duplicate = self.journal.iter().any(|existing| {
                    existing.action == row.action
                        && existing.kind == row.kind
                        && existing.hash == row.hash
                });
                if !duplicate {
                    self.journal.push(row);
                }
            }
        }
    }
}

/// Process-local store for one instance.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDurableStore {
    partition: Arc<Mutex<Partition>>,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Partition>, RepositoryError> {
        self.partition
            .lock()
            .map_err(|e| RepositoryError::Query(format!("store lock poisoned: {e}")))
    }
}

impl DurableStore for InMemoryDurableStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, RepositoryError> {
        Ok(self.lock()?.kv.get(key).cloned())
    }

    async fn transaction(&self, ops: Vec<StoreOp>) -> Result<(), RepositoryError> {
        let mut partition = self.lock()?;
        for op in ops {
            partition.apply(op);
        }
        Ok(())
    }

    async fn read_logs(&self, group_key: Option<&str>) -> Result<Vec<LogEntry>, RepositoryError> {
        let partition = self.lock()?;
        Ok(partition
            .logs
            .iter()
            .filter(|entry| group_key.is_none() || entry.group_key.as_deref() == group_key)
            .cloned()
            .collect())
    }

    async fn read_wake_journal(&self) -> Result<Vec<WakeJournalRow>, RepositoryError> {
        Ok(self.lock()?.journal.clone())
    }

    async fn clear(&self) -> Result<(), RepositoryError> {
        *self.lock()? = Partition::default();
        Ok(())
    }
}

/// Hands out one shared in-memory partition per instance id.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStoreProvider {
    partitions: Arc<DashMap<String, InMemoryDurableStore>>,
}

impl InMemoryStoreProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct access to an instance's partition (creating it if needed).
    pub fn store(&self, instance_id: &str) -> InMemoryDurableStore {
        self.partitions
            .entry(instance_id.to_string())
            .or_default()
            .clone()
    }
}

impl StoreProvider for InMemoryStoreProvider {
    fn partition(&self, instance_id: &str) -> BoxDurableStore {
        BoxDurableStore::new(self.store(instance_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_types::instance::{InstanceEvent, NewLogEntry};
    use stepwise_types::wake::{WakeAction, WakeEntry, WakeKind};

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = InMemoryDurableStore::new();
        let other = store.clone();
        store
            .transaction(vec![StoreOp::put("a", json!(1))])
            .await
            .unwrap();
        assert_eq!(other.get("a").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_logs_are_ordered_and_filterable() {
        let store = InMemoryDurableStore::new();
        store
            .transaction(vec![
                StoreOp::AppendLog(NewLogEntry::new(InstanceEvent::WorkflowQueued, None, None, json!({}))),
                StoreOp::AppendLog(NewLogEntry::new(InstanceEvent::StepStart, Some("k-1"), Some("s-1"), json!({}))),
                StoreOp::AppendLog(NewLogEntry::new(InstanceEvent::StepSuccess, Some("k-1"), Some("s-1"), json!({}))),
            ])
            .await
            .unwrap();

        let all = store.read_logs(None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));

        let step = store.read_logs(Some("k-1")).await.unwrap();
        assert_eq!(step.len(), 2);
        assert_eq!(step[1].event, InstanceEvent::StepSuccess);
    }

    #[tokio::test]
    async fn test_duplicate_journal_rows_are_ignored() {
        let store = InMemoryDurableStore::new();
        let entry = WakeEntry::new("h", WakeKind::Sleep, 10);
        let row = WakeJournalRow::new(&entry, WakeAction::Added);
        store
            .transaction(vec![
                StoreOp::AppendWakeJournal(row.clone()),
                StoreOp::AppendWakeJournal(row),
            ])
            .await
            .unwrap();
        assert_eq!(store.read_wake_journal().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let store = InMemoryDurableStore::new();
        store
            .transaction(vec![
                StoreOp::put("a", json!(true)),
                StoreOp::AppendLog(NewLogEntry::new(InstanceEvent::WorkflowQueued, None, None, json!({}))),
            ])
            .await
            .unwrap();
        store.clear().await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.read_logs(None).await.unwrap().is_empty());
    }

    #[test]
    fn test_provider_returns_same_partition() {
        let provider = InMemoryStoreProvider::new();
        let a = provider.store("inst");
        let b = provider.store("inst");
        assert!(Arc::ptr_eq(&a.partition, &b.partition));
    }
}
