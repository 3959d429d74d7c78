//! External events delivered to workflow instances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::step::StepDuration;

/// The payload an instance was created with, passed to `run()` on every entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub instance_id: String,
}

impl TriggerEvent {
    pub fn new(instance_id: impl Into<String>, payload: Value) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
            instance_id: instance_id.into(),
        }
    }
}

/// An event sent to a running (or sleeping) instance via `send_event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Options for `Context::wait_for_event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitForEventOptions {
    #[serde(rename = "type")]
    pub event_type: String,
    /// Falls back to `EngineConfig::default_event_timeout` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<StepDuration>,
}

impl WaitForEventOptions {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: impl Into<StepDuration>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_serializes_as_type() {
        let event = WorkflowEvent::new("approval", serde_json::json!({"ok": true}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "approval");
        assert_eq!(json["payload"]["ok"], true);
    }

    #[test]
    fn test_wait_options_builder() {
        let opts = WaitForEventOptions::new("t").with_timeout("5 seconds");
        assert_eq!(opts.event_type, "t");
        assert_eq!(opts.timeout.unwrap().to_millis().unwrap(), 5_000);
    }
}
