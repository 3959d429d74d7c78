//! Wake-queue entries and their journal rows.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why the engine needs to wake up at a given time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeKind {
    Sleep,
    Retry,
    Timeout,
}

impl WakeKind {
    /// Integer stored in the journal's `entry_type` column.
    pub fn code(self) -> i64 {
        match self {
            WakeKind::Sleep => 0,
            WakeKind::Retry => 1,
            WakeKind::Timeout => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(WakeKind::Sleep),
            1 => Some(WakeKind::Retry),
            2 => Some(WakeKind::Timeout),
            _ => None,
        }
    }
}

/// A pending wake condition. `(hash, kind)` identifies the entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WakeEntry {
    pub hash: String,
    pub kind: WakeKind,
    /// Unix epoch milliseconds.
    pub target_timestamp: i64,
}

impl WakeEntry {
    pub fn new(hash: impl Into<String>, kind: WakeKind, target_timestamp: i64) -> Self {
        Self {
            hash: hash.into(),
            kind,
            target_timestamp,
        }
    }

    pub fn key(&self) -> (String, WakeKind) {
        (self.hash.clone(), self.kind)
    }
}

// Heap order is by target timestamp; ties break on identity so that Ord
// stays consistent with Eq.
impl Ord for WakeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.target_timestamp
            .cmp(&other.target_timestamp)
            .then_with(|| self.kind.cmp(&other.kind))
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for WakeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Journal action: each row toggles membership of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WakeAction {
    Removed = 0,
    Added = 1,
}

impl WakeAction {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(WakeAction::Removed),
            1 => Some(WakeAction::Added),
            _ => None,
        }
    }
}

/// One row of the append-only wake-queue journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeJournalRow {
    pub created_on: DateTime<Utc>,
    pub target_timestamp: i64,
    pub action: WakeAction,
    pub kind: WakeKind,
    pub hash: String,
}

impl WakeJournalRow {
    pub fn new(entry: &WakeEntry, action: WakeAction) -> Self {
        Self {
            created_on: Utc::now(),
            target_timestamp: entry.target_timestamp,
            action,
            kind: entry.kind,
            hash: entry.hash.clone(),
        }
    }

    pub fn entry(&self) -> WakeEntry {
        WakeEntry::new(self.hash.clone(), self.kind, self.target_timestamp)
    }
}
