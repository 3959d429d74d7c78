//! Durable store trait.
//!
//! One store instance is bound to exactly one workflow instance (its
//! partition). Implementations live in stepwise-infra (SQLite) and in
//! `storage::memory` (tests, simulated restarts).

use serde_json::Value;
use stepwise_types::error::RepositoryError;
use stepwise_types::instance::{LogEntry, NewLogEntry};
use stepwise_types::wake::WakeJournalRow;

/// A single write inside a [`DurableStore::transaction`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Upsert a key-value pair.
    Put { key: String, value: Value },
    /// Delete a key. No-op if the key does not exist.
    Delete { key: String },
    /// Append an entry to the event log.
    AppendLog(NewLogEntry),
    /// Append a row to the wake-queue journal. Duplicate
    /// `(action, kind, hash)` rows are ignored.
    AppendWakeJournal(WakeJournalRow),
}

impl StoreOp {
    pub fn put(key: impl Into<String>, value: Value) -> Self {
        StoreOp::Put {
            key: key.into(),
            value,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        StoreOp::Delete { key: key.into() }
    }
}

/// Transactional storage for one workflow instance.
///
/// Combines a key-value surface (step caches, status, metadata) with two
/// append-only relations: the event log and the wake-queue journal.
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
pub trait DurableStore: Send + Sync {
    /// Get a value by key. Returns None if the key does not exist.
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Value>, RepositoryError>> + Send;

    /// Apply all operations atomically, in order.
    fn transaction(
        &self,
        ops: Vec<StoreOp>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Read the event log in insertion order, optionally filtered by group key.
    fn read_logs(
        &self,
        group_key: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<LogEntry>, RepositoryError>> + Send;

    /// Read the whole wake-queue journal in insertion order.
    fn read_wake_journal(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WakeJournalRow>, RepositoryError>> + Send;

    /// Remove everything stored for this instance.
    fn clear(&self) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
