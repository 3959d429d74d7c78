//! SQLite durable store implementation.
//!
//! Implements `DurableStore` from `stepwise-core` using sqlx with split
//! read/write pools. One `SqliteDurableStore` is scoped to one instance id;
//! all instances share the same three tables, partitioned by `instance_id`.
//! Values and log metadata are stored as JSON text.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use stepwise_core::storage::box_store::BoxDurableStore;
use stepwise_core::storage::durable_store::{DurableStore, StoreOp};
use stepwise_core::workflow::StoreProvider;
use stepwise_types::error::RepositoryError;
use stepwise_types::instance::{InstanceEvent, LogEntry};
use stepwise_types::wake::{WakeAction, WakeJournalRow, WakeKind};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `DurableStore` for one instance.
pub struct SqliteDurableStore {
    pool: DatabasePool,
    instance_id: String,
}

impl SqliteDurableStore {
    /// Create a store for `instance_id` backed by the given database pool.
    pub fn new(pool: DatabasePool, instance_id: impl Into<String>) -> Self {
        Self {
            pool,
            instance_id: instance_id.into(),
        }
    }
}

/// Hands out one `SqliteDurableStore` per instance over a shared pool.
#[derive(Clone)]
pub struct SqliteStoreProvider {
    pool: DatabasePool,
}

impl SqliteStoreProvider {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

impl StoreProvider for SqliteStoreProvider {
    fn partition(&self, instance_id: &str) -> BoxDurableStore {
        BoxDurableStore::new(SqliteDurableStore::new(self.pool.clone(), instance_id))
    }
}

// ---------------------------------------------------------------------------
// Private Row types for SQLite-to-domain mapping
// ---------------------------------------------------------------------------

struct StateRow {
    id: i64,
    created_on: String,
    group_key: Option<String>,
    target: Option<String>,
    metadata: String,
    event: i64,
}

impl StateRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            created_on: row.try_get("created_on")?,
            group_key: row.try_get("group_key")?,
            target: row.try_get("target")?,
            metadata: row.try_get("metadata")?,
            event: row.try_get("event")?,
        })
    }

    fn into_entry(self) -> Result<LogEntry, RepositoryError> {
        let event = InstanceEvent::from_code(self.event)
            .ok_or_else(|| RepositoryError::Query(format!("invalid event code: {}", self.event)))?;
        let metadata: Value = serde_json::from_str(&self.metadata)
            .map_err(|e| RepositoryError::Query(format!("invalid JSON metadata: {e}")))?;

        Ok(LogEntry {
            id: self.id,
            event,
            group_key: self.group_key,
            target: self.target,
            metadata,
            timestamp: parse_datetime(&self.created_on)?,
        })
    }
}

struct JournalRow {
    created_on: String,
    target_timestamp: i64,
    action: i64,
    entry_type: i64,
    hash: String,
}

impl JournalRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            created_on: row.try_get("created_on")?,
            target_timestamp: row.try_get("target_timestamp")?,
            action: row.try_get("action")?,
            entry_type: row.try_get("entry_type")?,
            hash: row.try_get("hash")?,
        })
    }

    fn into_journal_row(self) -> Result<WakeJournalRow, RepositoryError> {
        let action = WakeAction::from_code(self.action)
            .ok_or_else(|| RepositoryError::Query(format!("invalid journal action: {}", self.action)))?;
        let kind = WakeKind::from_code(self.entry_type)
            .ok_or_else(|| RepositoryError::Query(format!("invalid wake entry type: {}", self.entry_type)))?;

        Ok(WakeJournalRow {
            created_on: parse_datetime(&self.created_on)?,
            target_timestamp: self.target_timestamp,
            action,
            kind,
            hash: self.hash,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn to_json(value: &Value) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|e| RepositoryError::Query(format!("failed to serialize value: {e}")))
}

// ---------------------------------------------------------------------------
// DurableStore implementation
// ---------------------------------------------------------------------------

impl DurableStore for SqliteDurableStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, RepositoryError> {
        let row = sqlx::query("SELECT value FROM kv_storage WHERE instance_id = ? AND key = ?")
            .bind(&self.instance_id)
            .bind(key)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let value_str: String = row
                    .try_get("value")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                let value: Value = serde_json::from_str(&value_str)
                    .map_err(|e| RepositoryError::Query(format!("invalid JSON value: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn transaction(&self, ops: Vec<StoreOp>) -> Result<(), RepositoryError> {
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        for op in ops {
            match op {
                StoreOp::Put { key, value } => {
                    sqlx::query(
                        r#"INSERT INTO kv_storage (instance_id, key, value, updated_at)
                           VALUES (?, ?, ?, ?)
                           ON CONFLICT (instance_id, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at"#,
                    )
                    .bind(&self.instance_id)
                    .bind(&key)
                    .bind(to_json(&value)?)
                    .bind(format_datetime(&Utc::now()))
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                }
                StoreOp::Delete { key } => {
                    sqlx::query("DELETE FROM kv_storage WHERE instance_id = ? AND key = ?")
                        .bind(&self.instance_id)
                        .bind(&key)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| RepositoryError::Query(e.to_string()))?;
                }
                StoreOp::AppendLog(entry) => {
                    sqlx::query(
                        "INSERT INTO states (instance_id, created_on, group_key, target, metadata, event)
                         VALUES (?, ?, ?, ?, ?, ?)",
                    )
                    .bind(&self.instance_id)
                    .bind(format_datetime(&entry.timestamp))
                    .bind(&entry.group_key)
                    .bind(&entry.target)
                    .bind(to_json(&entry.metadata)?)
                    .bind(entry.event.code())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                }
                StoreOp::AppendWakeJournal(row) => {
                    sqlx::query(
                        r#"INSERT INTO priority_queue (instance_id, created_on, target_timestamp, action, entry_type, hash)
                           VALUES (?, ?, ?, ?, ?, ?)
                           ON CONFLICT (instance_id, action, entry_type, hash) DO NOTHING"#,
                    )
                    .bind(&self.instance_id)
                    .bind(format_datetime(&row.created_on))
                    .bind(row.target_timestamp)
                    .bind(row.action.code())
                    .bind(row.kind.code())
                    .bind(&row.hash)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn read_logs(&self, group_key: Option<&str>) -> Result<Vec<LogEntry>, RepositoryError> {
        let query = match group_key {
            Some(group_key) => sqlx::query(
                "SELECT id, created_on, group_key, target, metadata, event FROM states
                 WHERE instance_id = ? AND group_key = ? ORDER BY id",
            )
            .bind(&self.instance_id)
            .bind(group_key),
            None => sqlx::query(
                "SELECT id, created_on, group_key, target, metadata, event FROM states
                 WHERE instance_id = ? ORDER BY id",
            )
            .bind(&self.instance_id),
        };

        let rows = query
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                StateRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_entry()
            })
            .collect()
    }

    async fn read_wake_journal(&self) -> Result<Vec<WakeJournalRow>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT created_on, target_timestamp, action, entry_type, hash FROM priority_queue
             WHERE instance_id = ? ORDER BY id",
        )
        .bind(&self.instance_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                JournalRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_journal_row()
            })
            .collect()
    }

    async fn clear(&self) -> Result<(), RepositoryError> {
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        for table in ["kv_storage", "states", "priority_queue"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE instance_id = ?"))
                .bind(&self.instance_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::debug!(instance_id = %self.instance_id, "cleared instance storage");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use serde_json::json;
    use stepwise_core::workflow::{Context, Engine, FnWorkflow};
    use stepwise_types::config::EngineConfig;
    use stepwise_types::error::WorkflowError;
    use stepwise_types::event::TriggerEvent;
    use stepwise_types::instance::{
        InstanceMeta, InstanceMetadata, InstanceStatus, NewLogEntry, VersionMeta, WorkflowMeta,
    };
    use stepwise_types::wake::WakeEntry;

    use super::*;
    use crate::crypto::hash::Sha256ContentHasher;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = SqliteDurableStore::new(test_pool().await, "inst-1");

        assert!(store.get("missing").await.unwrap().is_none());
        store
            .transaction(vec![StoreOp::put("k", json!({"value": [1, 2]}))])
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"value": [1, 2]})));

        store.transaction(vec![StoreOp::put("k", json!(3))]).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!(3)));

        store.transaction(vec![StoreOp::delete("k")]).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partitions_are_isolated() {
        let pool = test_pool().await;
        let a = SqliteDurableStore::new(pool.clone(), "a");
        let b = SqliteDurableStore::new(pool, "b");

        a.transaction(vec![
            StoreOp::put("status", json!("running")),
            StoreOp::AppendLog(NewLogEntry::new(InstanceEvent::WorkflowQueued, None, None, json!({}))),
        ])
        .await
        .unwrap();

        assert!(b.get("status").await.unwrap().is_none());
        assert!(b.read_logs(None).await.unwrap().is_empty());

        b.transaction(vec![StoreOp::put("status", json!("queued"))])
            .await
            .unwrap();
        b.clear().await.unwrap();
        assert_eq!(a.get("status").await.unwrap(), Some(json!("running")));
    }

    #[tokio::test]
    async fn test_logs_round_trip_in_order() {
        let store = SqliteDurableStore::new(test_pool().await, "inst-1");
        store
            .transaction(vec![
                StoreOp::AppendLog(NewLogEntry::new(InstanceEvent::WorkflowQueued, None, None, json!({}))),
                StoreOp::AppendLog(NewLogEntry::new(
                    InstanceEvent::AttemptStart,
                    Some("abc-1"),
                    Some("fetch-1"),
                    json!({"attempt": 1}),
                )),
                StoreOp::AppendLog(NewLogEntry::new(
                    InstanceEvent::StepSuccess,
                    Some("abc-1"),
                    Some("fetch-1"),
                    json!({"result": "ok"}),
                )),
            ])
            .await
            .unwrap();

        let all = store.read_logs(None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));

        let step = store.read_logs(Some("abc-1")).await.unwrap();
        assert_eq!(step.len(), 2);
        assert_eq!(step[0].event, InstanceEvent::AttemptStart);
        assert_eq!(step[1].metadata, json!({"result": "ok"}));
        assert_eq!(step[1].target.as_deref(), Some("fetch-1"));
    }

    #[tokio::test]
    async fn test_failed_transaction_applies_nothing() {
        let pool = test_pool().await;
        let store = SqliteDurableStore::new(pool.clone(), "inst-1");
        store.transaction(vec![StoreOp::put("before", json!(1))]).await.unwrap();

        sqlx::query("DROP TABLE states")
            .execute(&pool.writer)
            .await
            .unwrap();

        let result = store
            .transaction(vec![
                StoreOp::put("after", json!(2)),
                StoreOp::AppendLog(NewLogEntry::new(InstanceEvent::WorkflowStart, None, None, json!({}))),
            ])
            .await;
        assert!(result.is_err());
        assert!(store.get("after").await.unwrap().is_none());
        assert_eq!(store.get("before").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_journal_ignores_duplicates() {
        let store = SqliteDurableStore::new(test_pool().await, "inst-1");
        let entry = WakeEntry::new("k-1", WakeKind::Timeout, 1_000);
        store
            .transaction(vec![
                StoreOp::AppendWakeJournal(WakeJournalRow::new(&entry, WakeAction::Added)),
                StoreOp::AppendWakeJournal(WakeJournalRow::new(&entry, WakeAction::Added)),
                StoreOp::AppendWakeJournal(WakeJournalRow::new(&entry, WakeAction::Removed)),
            ])
            .await
            .unwrap();

        let journal = store.read_wake_journal().await.unwrap();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal[0].action, WakeAction::Added);
        assert_eq!(journal[1].action, WakeAction::Removed);
        assert_eq!(journal[1].entry(), entry);
    }

    // -----------------------------------------------------------------------
    // End to end: crash and resume over SQLite
    // -----------------------------------------------------------------------

    fn metadata() -> InstanceMetadata {
        InstanceMetadata {
            account_id: 1,
            workflow: WorkflowMeta {
                id: "billing".into(),
                name: "billing".into(),
            },
            version: VersionMeta { id: "billing@1".into() },
            instance: InstanceMeta {
                id: "order-9".into(),
                created_on: Utc::now(),
            },
            event: TriggerEvent::new("order-9", json!({"amount": 30})),
        }
    }

    fn engine(pool: &DatabasePool, charges: &Arc<AtomicUsize>) -> Arc<Engine> {
        let charges = Arc::clone(charges);
        Arc::new(Engine::new(
            "order-9",
            BoxDurableStore::new(SqliteDurableStore::new(pool.clone(), "order-9")),
            Arc::new(FnWorkflow::new(move |event: TriggerEvent, ctx: Context| {
                let charges = Arc::clone(&charges);
                async move {
                    let amount = event.payload["amount"].as_i64().unwrap_or_default();
                    let receipt: String = ctx
                        .do_step("charge", || async {
                            charges.fetch_add(1, Ordering::SeqCst);
                            Ok(format!("receipt-{amount}"))
                        })
                        .await?;
                    ctx.sleep("cool down", "300 ms").await?;
                    Ok::<_, WorkflowError>(json!({ "receipt": receipt }))
                }
            })),
            Arc::new(Sha256ContentHasher::new()),
            EngineConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_crash_and_resume_replays_from_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("resume.db").display());
        let charges = Arc::new(AtomicUsize::new(0));

        let first = engine(&DatabasePool::new(&url).await.unwrap(), &charges);
        let task = {
            let first = Arc::clone(&first);
            tokio::spawn(async move { first.init(metadata()).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        first.abort("simulated crash");
        task.await.unwrap().unwrap();
        assert_eq!(first.get_status().await.unwrap(), InstanceStatus::Running);

        // A fresh pool stands in for a new process.
        let second = engine(&DatabasePool::new(&url).await.unwrap(), &charges);
        let resumed = Instant::now();
        Arc::clone(&second).init_from_storage().await.unwrap();

        assert!(resumed.elapsed() < Duration::from_millis(300));
        assert_eq!(second.get_status().await.unwrap(), InstanceStatus::Complete);
        assert_eq!(
            second.get_output_or_error(true).await.unwrap(),
            json!({ "receipt": "receipt-30" })
        );
        assert_eq!(charges.load(Ordering::SeqCst), 1);

        let events: Vec<InstanceEvent> = second
            .read_logs()
            .await
            .unwrap()
            .iter()
            .map(|entry| entry.event)
            .collect();
        assert_eq!(events.iter().filter(|e| **e == InstanceEvent::WorkflowStart).count(), 1);
        assert_eq!(events.iter().filter(|e| **e == InstanceEvent::SleepComplete).count(), 1);
        assert_eq!(events.last(), Some(&InstanceEvent::WorkflowSuccess));
    }
}
