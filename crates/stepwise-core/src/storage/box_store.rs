//! BoxDurableStore -- object-safe dynamic dispatch wrapper for DurableStore.
//!
//! Same blanket-impl pattern as the other Box* wrappers:
//! 1. Define an object-safe `DurableStoreDyn` trait with boxed futures
//! 2. Blanket-impl `DurableStoreDyn` for all `T: DurableStore`
//! 3. `BoxDurableStore` wraps `Arc<dyn DurableStoreDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use stepwise_types::error::RepositoryError;
use stepwise_types::instance::{LogEntry, NewLogEntry};
use stepwise_types::wake::WakeJournalRow;

use super::durable_store::{DurableStore, StoreOp};

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, RepositoryError>> + Send + 'a>>;

/// Object-safe version of [`DurableStore`] with boxed futures.
///
/// This trait exists solely to enable dynamic dispatch (`dyn DurableStoreDyn`).
/// A blanket implementation is provided for all types implementing `DurableStore`.
pub trait DurableStoreDyn: Send + Sync {
    fn get_boxed<'a>(&'a self, key: &'a str) -> BoxFut<'a, Option<Value>>;

    fn transaction_boxed(&self, ops: Vec<StoreOp>) -> BoxFut<'_, ()>;

    fn read_logs_boxed<'a>(&'a self, group_key: Option<&'a str>) -> BoxFut<'a, Vec<LogEntry>>;

    fn read_wake_journal_boxed(&self) -> BoxFut<'_, Vec<WakeJournalRow>>;

    fn clear_boxed(&self) -> BoxFut<'_, ()>;
}

/// Blanket implementation: any `DurableStore` automatically implements `DurableStoreDyn`.
impl<T: DurableStore> DurableStoreDyn for T {
    fn get_boxed<'a>(&'a self, key: &'a str) -> BoxFut<'a, Option<Value>> {
        Box::pin(self.get(key))
    }

    fn transaction_boxed(&self, ops: Vec<StoreOp>) -> BoxFut<'_, ()> {
        Box::pin(self.transaction(ops))
    }

    fn read_logs_boxed<'a>(&'a self, group_key: Option<&'a str>) -> BoxFut<'a, Vec<LogEntry>> {
        Box::pin(self.read_logs(group_key))
    }

    fn read_wake_journal_boxed(&self) -> BoxFut<'_, Vec<WakeJournalRow>> {
        Box::pin(self.read_wake_journal())
    }

    fn clear_boxed(&self) -> BoxFut<'_, ()> {
        Box::pin(self.clear())
    }
}

/// Type-erased durable store, selected at runtime (SQLite vs in-memory).
///
/// Since `DurableStore` uses RPITIT, it cannot be used as a trait object
/// directly. `BoxDurableStore` provides equivalent methods that delegate to
/// the inner `DurableStoreDyn` trait object. Cloning shares the same store.
#[derive(Clone)]
pub struct BoxDurableStore {
    inner: Arc<dyn DurableStoreDyn + Send + Sync>,
}

impl BoxDurableStore {
    /// Wrap a concrete `DurableStore` implementation in a type-erased box.
    pub fn new<T: DurableStore + 'static>(store: T) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, RepositoryError> {
        self.inner.get_boxed(key).await
    }

    pub async fn transaction(&self, ops: Vec<StoreOp>) -> Result<(), RepositoryError> {
        if ops.is_empty() {
            return Ok(());
        }
        self.inner.transaction_boxed(ops).await
    }

    pub async fn read_logs(&self, group_key: Option<&str>) -> Result<Vec<LogEntry>, RepositoryError> {
        self.inner.read_logs_boxed(group_key).await
    }

    pub async fn read_wake_journal(&self) -> Result<Vec<WakeJournalRow>, RepositoryError> {
        self.inner.read_wake_journal_boxed().await
    }

    pub async fn clear(&self) -> Result<(), RepositoryError> {
        self.inner.clear_boxed().await
    }

    // -----------------------------------------------------------------------
    // Single-operation conveniences
    // -----------------------------------------------------------------------

    pub async fn put(&self, key: &str, value: Value) -> Result<(), RepositoryError> {
        self.transaction(vec![StoreOp::put(key, value)]).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), RepositoryError> {
        self.transaction(vec![StoreOp::delete(key)]).await
    }

    pub async fn append_log(&self, entry: NewLogEntry) -> Result<(), RepositoryError> {
        self.transaction(vec![StoreOp::AppendLog(entry)]).await
    }

    /// Whether a key is present.
    pub async fn contains(&self, key: &str) -> Result<bool, RepositoryError> {
        Ok(self.get(key).await?.is_some())
    }
}

impl std::fmt::Debug for BoxDurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxDurableStore").finish_non_exhaustive()
    }
}
