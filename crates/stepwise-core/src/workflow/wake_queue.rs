//! Durable, crash-recoverable wake queue.
//!
//! A min-heap of pending wake conditions (sleep ends, retry delays, timeouts)
//! backed by an append-only add/remove journal. The live queue is never
//! stored directly: on construction the journal is replayed in insertion
//! order and each row toggles membership of its `(hash, kind)` pair.
//!
//! Every mutation appends its journal row inside a store transaction before
//! the in-memory heap changes, so a crash between the two leaves a journal
//! that replays to the committed state.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use stepwise_types::error::RepositoryError;
use stepwise_types::wake::{WakeAction, WakeEntry, WakeJournalRow, WakeKind};
use tokio::sync::Mutex;

use crate::storage::box_store::BoxDurableStore;
use crate::storage::durable_store::StoreOp;

type EntryKey = (String, WakeKind);

#[derive(Debug, Default)]
struct QueueState {
    /// Min-heap by target timestamp. May hold stale entries that were
    /// removed from `active`; they are skipped lazily.
    heap: BinaryHeap<Reverse<WakeEntry>>,
    active: HashMap<EntryKey, WakeEntry>,
    /// Keys that were added and later removed.
    retired: HashSet<EntryKey>,
}

impl QueueState {
    fn from_journal(rows: Vec<WakeJournalRow>) -> Self {
        let mut state = QueueState::default();
        for row in rows {
            let entry = row.entry();
            match row.action {
                WakeAction::Added => {
                    state.active.insert(entry.key(), entry);
                }
                WakeAction::Removed => {
                    if state.active.remove(&entry.key()).is_some() {
                        state.retired.insert(entry.key());
                    }
                }
            }
        }
        state.heap = state.active.values().cloned().map(Reverse).collect();
        state
    }

    fn is_live(&self, entry: &WakeEntry) -> bool {
        self.active.get(&entry.key()) == Some(entry)
    }

    /// Drop stale heap tops so `peek` reflects the live minimum.
    fn prune_top(&mut self) {
        while let Some(Reverse(top)) = self.heap.peek() {
            if self.is_live(top) {
                break;
            }
            self.heap.pop();
        }
    }
}

/// Time-ordered queue of wake conditions for one instance.
pub struct WakeQueue {
    store: BoxDurableStore,
    state: Mutex<QueueState>,
}

impl WakeQueue {
    /// Rebuild the queue from the store's journal.
    pub async fn load(store: BoxDurableStore) -> Result<Self, RepositoryError> {
        let rows = store.read_wake_journal().await?;
        let journal_len = rows.len();
        let state = QueueState::from_journal(rows);

        tracing::debug!(
            journal_len,
            active = state.active.len(),
            "rebuilt wake queue from journal"
        );

        Ok(Self {
            store,
            state: Mutex::new(state),
        })
    }

    /// Add an entry. No-op if the same `(hash, kind)` is already active or
    /// has already been retired.
    pub async fn add(&self, entry: WakeEntry) -> Result<(), RepositoryError> {
        self.add_with(entry, Vec::new()).await
    }

    /// Add an entry and commit `ops` in the same transaction. `ops` are
    /// committed even when the add itself is a no-op.
    pub async fn add_with(&self, entry: WakeEntry, mut ops: Vec<StoreOp>) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let key = entry.key();
        let effective = !state.active.contains_key(&key) && !state.retired.contains(&key);

        if effective {
            ops.push(StoreOp::AppendWakeJournal(WakeJournalRow::new(&entry, WakeAction::Added)));
        }
        if !ops.is_empty() {
            self.store.transaction(ops).await?;
        }
        if !effective {
            return Ok(());
        }

        tracing::debug!(
            hash = %entry.hash,
            kind = ?entry.kind,
            target_timestamp = entry.target_timestamp,
            "wake entry added"
        );
        state.active.insert(key, entry.clone());
        state.heap.push(Reverse(entry));
        Ok(())
    }

    /// Remove the active entry for `(hash, kind)`. No-op if none is active.
    pub async fn remove(&self, hash: &str, kind: WakeKind) -> Result<(), RepositoryError> {
        self.remove_with(hash, kind, Vec::new()).await
    }

    /// Remove the active entry for `(hash, kind)` and commit `ops` in the
    /// same transaction. `ops` are committed even when no entry is active.
    pub async fn remove_with(
        &self,
        hash: &str,
        kind: WakeKind,
        mut ops: Vec<StoreOp>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let key = (hash.to_string(), kind);
        let removed = state.active.get(&key).cloned();

        if let Some(entry) = &removed {
            ops.push(StoreOp::AppendWakeJournal(WakeJournalRow::new(entry, WakeAction::Removed)));
        }
        if !ops.is_empty() {
            self.store.transaction(ops).await?;
        }
        if removed.is_none() {
            return Ok(());
        }

        tracing::debug!(hash, kind = ?kind, "wake entry removed");
        state.active.remove(&key);
        state.retired.insert(key);
        state.prune_top();
        Ok(())
    }

    /// Remove and return every entry due at or before `now_ms`, in one
    /// transaction. Used at bootstrap to catch up on missed wake-ups.
    pub async fn pop_past_entries(&self, now_ms: i64) -> Result<Vec<WakeEntry>, RepositoryError> {
        let mut state = self.state.lock().await;
        let mut due: Vec<WakeEntry> = state
            .active
            .values()
            .filter(|entry| entry.target_timestamp <= now_ms)
            .cloned()
            .collect();
        if due.is_empty() {
            return Ok(due);
        }
        due.sort();

        let ops = due
            .iter()
            .map(|entry| StoreOp::AppendWakeJournal(WakeJournalRow::new(entry, WakeAction::Removed)))
            .collect();
        self.store.transaction(ops).await?;

        for entry in &due {
            let key = entry.key();
            state.active.remove(&key);
            state.retired.insert(key);
        }
        state.prune_top();
        Ok(due)
    }

    /// Earliest active entry matching `predicate`, as an owned copy.
    pub async fn get_first<P>(&self, predicate: P) -> Option<WakeEntry>
    where
        P: Fn(&WakeEntry) -> bool,
    {
        let state = self.state.lock().await;
        state
            .active
            .values()
            .filter(|entry| predicate(entry))
            .min()
            .cloned()
    }

    /// Whether `(hash, kind)` was ever added and later removed.
    pub async fn check_if_existed_in_past(&self, hash: &str, kind: WakeKind) -> bool {
        let state = self.state.lock().await;
        state.retired.contains(&(hash.to_string(), kind))
    }

    /// Target timestamp of the earliest active entry.
    pub async fn next_timestamp(&self) -> Option<i64> {
        let mut state = self.state.lock().await;
        state.prune_top();
        state.heap.peek().map(|Reverse(entry)| entry.target_timestamp)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.active.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl std::fmt::Debug for WakeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeQueue").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::durable_store::DurableStore;
    use crate::storage::memory::InMemoryDurableStore;

    fn store() -> (InMemoryDurableStore, BoxDurableStore) {
        let mem = InMemoryDurableStore::new();
        (mem.clone(), BoxDurableStore::new(mem))
    }

    #[tokio::test]
    async fn test_next_timestamp_is_minimum() {
        let (_, store) = store();
        let queue = WakeQueue::load(store).await.unwrap();
        queue.add(WakeEntry::new("b", WakeKind::Sleep, 300)).await.unwrap();
        queue.add(WakeEntry::new("a", WakeKind::Retry, 100)).await.unwrap();
        queue.add(WakeEntry::new("c", WakeKind::Timeout, 200)).await.unwrap();
        assert_eq!(queue.next_timestamp().await, Some(100));

        queue.remove("a", WakeKind::Retry).await.unwrap();
        assert_eq!(queue.next_timestamp().await, Some(200));
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_add_then_remove_replays_to_empty() {
        let (mem, store) = store();
        let queue = WakeQueue::load(store).await.unwrap();
        queue.add(WakeEntry::new("k-1", WakeKind::Timeout, 50)).await.unwrap();
        queue.remove("k-1", WakeKind::Timeout).await.unwrap();

        let rebuilt = WakeQueue::load(BoxDurableStore::new(mem)).await.unwrap();
        assert!(rebuilt.is_empty().await);
        assert!(rebuilt.check_if_existed_in_past("k-1", WakeKind::Timeout).await);
        assert!(!rebuilt.check_if_existed_in_past("k-1", WakeKind::Retry).await);
    }

    #[tokio::test]
    async fn test_rebuild_keeps_active_entries() {
        let (mem, store) = store();
        let queue = WakeQueue::load(store).await.unwrap();
        queue.add(WakeEntry::new("s", WakeKind::Sleep, 1_000)).await.unwrap();

        let rebuilt = WakeQueue::load(BoxDurableStore::new(mem)).await.unwrap();
        let entry = rebuilt
            .get_first(|e| e.hash == "s" && e.kind == WakeKind::Sleep)
            .await
            .unwrap();
        assert_eq!(entry.target_timestamp, 1_000);
        assert!(!rebuilt.check_if_existed_in_past("s", WakeKind::Sleep).await);
    }

    #[tokio::test]
    async fn test_duplicate_add_and_missing_remove_are_noops() {
        let (mem, store) = store();
        let queue = WakeQueue::load(store).await.unwrap();
        queue.add(WakeEntry::new("x", WakeKind::Sleep, 10)).await.unwrap();
        queue.add(WakeEntry::new("x", WakeKind::Sleep, 99)).await.unwrap();
        queue.remove("nope", WakeKind::Sleep).await.unwrap();

        assert_eq!(queue.len().await, 1);
        assert_eq!(mem.read_wake_journal().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pop_past_entries_drains_due_only() {
        let (mem, store) = store();
        let queue = WakeQueue::load(store).await.unwrap();
        queue.add(WakeEntry::new("old", WakeKind::Sleep, 100)).await.unwrap();
        queue.add(WakeEntry::new("older", WakeKind::Retry, 50)).await.unwrap();
        queue.add(WakeEntry::new("future", WakeKind::Timeout, 10_000)).await.unwrap();

        let popped = queue.pop_past_entries(100).await.unwrap();
        let hashes: Vec<&str> = popped.iter().map(|e| e.hash.as_str()).collect();
        assert_eq!(hashes, vec!["older", "old"]);
        assert_eq!(queue.next_timestamp().await, Some(10_000));
        assert!(queue.check_if_existed_in_past("old", WakeKind::Sleep).await);

        let rebuilt = WakeQueue::load(BoxDurableStore::new(mem)).await.unwrap();
        assert_eq!(rebuilt.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_first_returns_earliest_match() {
        let (_, store) = store();
        let queue = WakeQueue::load(store).await.unwrap();
        queue.add(WakeEntry::new("t-2", WakeKind::Timeout, 20)).await.unwrap();
        queue.add(WakeEntry::new("t-1", WakeKind::Timeout, 10)).await.unwrap();
        queue.add(WakeEntry::new("s-1", WakeKind::Sleep, 5)).await.unwrap();

        let first = queue
            .get_first(|e| e.kind == WakeKind::Timeout)
            .await
            .unwrap();
        assert_eq!(first.hash, "t-1");
        assert!(queue.get_first(|e| e.hash == "missing").await.is_none());
    }

    #[tokio::test]
    async fn test_add_with_and_remove_with_commit_ops_alongside_journal() {
        let (mem, store) = store();
        let queue = WakeQueue::load(store).await.unwrap();

        queue
            .add_with(
                WakeEntry::new("nap", WakeKind::Sleep, 500),
                vec![StoreOp::put("nap-value", serde_json::json!(true))],
            )
            .await
            .unwrap();
        assert_eq!(mem.get("nap-value").await.unwrap(), Some(serde_json::json!(true)));
        assert_eq!(mem.read_wake_journal().await.unwrap().len(), 1);

        queue
            .remove_with("nap", WakeKind::Sleep, vec![StoreOp::put("nap-done", serde_json::json!(true))])
            .await
            .unwrap();
        assert!(mem.get("nap-done").await.unwrap().is_some());
        assert_eq!(mem.read_wake_journal().await.unwrap().len(), 2);

        // Already retired: only the extra ops land.
        queue
            .remove_with("nap", WakeKind::Sleep, vec![StoreOp::delete("nap-done")])
            .await
            .unwrap();
        assert!(mem.get("nap-done").await.unwrap().is_none());
        assert_eq!(mem.read_wake_journal().await.unwrap().len(), 2);
        assert!(queue.is_empty().await);
    }
}
