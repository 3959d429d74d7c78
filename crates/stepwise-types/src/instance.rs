//! Instance domain types.
//!
//! An instance is one durable execution of a workflow. Its life is recorded
//! in an append-only event log (`LogEntry`) and its status only moves forward
//! through `InstanceStatus`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorRecord;
use crate::event::TriggerEvent;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Status of a workflow instance.
///
/// `Queued -> Running -> {Errored | Terminated | Complete}`. `Paused` is
/// reserved and never entered by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Queued,
    Running,
    Paused,
    Errored,
    Terminated,
    Complete,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 6] = [
        InstanceStatus::Queued,
        InstanceStatus::Running,
        InstanceStatus::Paused,
        InstanceStatus::Errored,
        InstanceStatus::Terminated,
        InstanceStatus::Complete,
    ];

    /// Terminal statuses are mutually exclusive and never left.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Errored | InstanceStatus::Terminated | InstanceStatus::Complete
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Queued => "queued",
            InstanceStatus::Running => "running",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Errored => "errored",
            InstanceStatus::Terminated => "terminated",
            InstanceStatus::Complete => "complete",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InstanceStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown instance status: '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Log events
// ---------------------------------------------------------------------------

/// Kind of an event-log entry.
///
/// Persisted as its integer code; the order of variants is part of the
/// storage format and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceEvent {
    WorkflowQueued,
    WorkflowStart,
    WorkflowSuccess,
    WorkflowFailure,
    WorkflowTerminated,
    StepStart,
    StepSuccess,
    StepFailure,
    SleepStart,
    SleepComplete,
    AttemptStart,
    AttemptSuccess,
    AttemptFailure,
    WaitStart,
    WaitComplete,
    WaitTimedOut,
}

impl InstanceEvent {
    const ALL: [InstanceEvent; 16] = [
        InstanceEvent::WorkflowQueued,
        InstanceEvent::WorkflowStart,
        InstanceEvent::WorkflowSuccess,
        InstanceEvent::WorkflowFailure,
        InstanceEvent::WorkflowTerminated,
        InstanceEvent::StepStart,
        InstanceEvent::StepSuccess,
        InstanceEvent::StepFailure,
        InstanceEvent::SleepStart,
        InstanceEvent::SleepComplete,
        InstanceEvent::AttemptStart,
        InstanceEvent::AttemptSuccess,
        InstanceEvent::AttemptFailure,
        InstanceEvent::WaitStart,
        InstanceEvent::WaitComplete,
        InstanceEvent::WaitTimedOut,
    ];

    /// Integer code used by the `states` table.
    pub fn code(self) -> i64 {
        Self::ALL
            .iter()
            .position(|e| *e == self)
            .map(|p| p as i64)
            .unwrap_or_default()
    }

    pub fn from_code(code: i64) -> Option<Self> {
        usize::try_from(code).ok().and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceEvent::WorkflowQueued => "WORKFLOW_QUEUED",
            InstanceEvent::WorkflowStart => "WORKFLOW_START",
            InstanceEvent::WorkflowSuccess => "WORKFLOW_SUCCESS",
            InstanceEvent::WorkflowFailure => "WORKFLOW_FAILURE",
            InstanceEvent::WorkflowTerminated => "WORKFLOW_TERMINATED",
            InstanceEvent::StepStart => "STEP_START",
            InstanceEvent::StepSuccess => "STEP_SUCCESS",
            InstanceEvent::StepFailure => "STEP_FAILURE",
            InstanceEvent::SleepStart => "SLEEP_START",
            InstanceEvent::SleepComplete => "SLEEP_COMPLETE",
            InstanceEvent::AttemptStart => "ATTEMPT_START",
            InstanceEvent::AttemptSuccess => "ATTEMPT_SUCCESS",
            InstanceEvent::AttemptFailure => "ATTEMPT_FAILURE",
            InstanceEvent::WaitStart => "WAIT_START",
            InstanceEvent::WaitComplete => "WAIT_COMPLETE",
            InstanceEvent::WaitTimedOut => "WAIT_TIMED_OUT",
        }
    }

    /// Events that settle a step-result waiter.
    pub fn is_step_outcome(self) -> bool {
        matches!(self, InstanceEvent::StepSuccess | InstanceEvent::StepFailure)
    }
}

impl std::fmt::Display for InstanceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A log row as appended by the engine (before the store assigns an id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLogEntry {
    pub event: InstanceEvent,
    pub group_key: Option<String>,
    pub target: Option<String>,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

impl NewLogEntry {
    pub fn new(
        event: InstanceEvent,
        group_key: Option<&str>,
        target: Option<&str>,
        metadata: Value,
    ) -> Self {
        Self {
            event,
            group_key: group_key.map(str::to_string),
            target: target.map(str::to_string),
            metadata,
            timestamp: Utc::now(),
        }
    }
}

/// A persisted, immutable event-log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonic insertion id within the instance partition.
    pub id: i64,
    pub event: InstanceEvent,
    /// Step/sleep/wait cache key, `None` for instance-level events.
    pub group_key: Option<String>,
    /// Human readable `<name>-<count>` of the step, if any.
    pub target: Option<String>,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Instance metadata
// ---------------------------------------------------------------------------

/// Identity of the workflow an instance belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowMeta {
    pub id: String,
    pub name: String,
}

/// Identity of the deployed workflow version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMeta {
    pub id: String,
}

/// Identity of the instance itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMeta {
    pub id: String,
    pub created_on: DateTime<Utc>,
}

/// Everything `Engine::init` needs to bootstrap or resume an instance.
///
/// Persisted once on first bootstrap and never rewritten, so that the engine
/// can re-enter itself (alarm, late event) without the original caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub account_id: i64,
    pub workflow: WorkflowMeta,
    pub version: VersionMeta,
    pub instance: InstanceMeta,
    pub event: TriggerEvent,
}

/// Snapshot returned by an instance handle's `status()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatusDetails {
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(InstanceStatus::Complete.is_terminal());
        assert!(InstanceStatus::Errored.is_terminal());
        assert!(InstanceStatus::Terminated.is_terminal());
        assert!(!InstanceStatus::Running.is_terminal());
        assert!(!InstanceStatus::Paused.is_terminal());
    }

    #[test]
    fn test_status_parse_and_serde_agree() {
        for status in InstanceStatus::ALL {
            let parsed: InstanceStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, serde_json::json!(status.as_str()));
        }
        assert!("finished".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn test_event_codes_are_stable() {
        assert_eq!(InstanceEvent::WorkflowQueued.code(), 0);
        assert_eq!(InstanceEvent::StepSuccess.code(), 6);
        assert_eq!(InstanceEvent::WaitTimedOut.code(), 15);
        assert_eq!(InstanceEvent::from_code(12), Some(InstanceEvent::AttemptFailure));
        assert_eq!(InstanceEvent::from_code(16), None);
        assert_eq!(InstanceEvent::from_code(-1), None);
    }

    #[test]
    fn test_event_serde_uses_log_names() {
        let json = serde_json::to_value(InstanceEvent::WaitTimedOut).unwrap();
        assert_eq!(json, serde_json::json!("WAIT_TIMED_OUT"));
        assert_eq!(InstanceEvent::WaitTimedOut.to_string(), "WAIT_TIMED_OUT");
    }
}
