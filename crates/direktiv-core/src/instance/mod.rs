//! Durable instance records.

mod events;
mod messages;
mod variables;

pub use events::{CloudEvent, EventFilter, EventListenerRecord};
pub use messages::{
    ActionResultPayload, CancelPayload, EventPayload, InstanceMessage, MessageKind,
    TransitionPayload,
};
pub use variables::{decode_variable, encode_variable, is_delete_value, VariableRecord, DEFAULT_MIME_TYPE};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Instance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Running or suspended.
    Pending,
    /// Finished without a recorded error.
    Complete,
    /// Finished with a workflow-visible error.
    Failed,
    /// Finished on an internal error.
    Crashed,
}

impl InstanceStatus {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Crashed => "crashed",
        }
    }

    /// Whether the instance can no longer change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "crashed" => Ok(Self::Crashed),
            _ => Err(format!("Unknown instance status: {}", s)),
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: Uuid,
    pub namespace_id: Uuid,
    pub namespace: String,
    pub workflow_id: Uuid,
    pub revision_id: Uuid,
    /// Workflow path plus the ref used, e.g. `/orders.yaml:latest`.
    pub as_path: String,
    pub status: InstanceStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Who started the instance (`api`, `cron`, `instance:<id>`, ...).
    pub invoker: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub input: Value,
    pub output: Option<Value>,
}

/// The parent state waiting on a subflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallerData {
    pub instance_id: Uuid,
    /// Step of the parent that dispatched the subflow.
    pub step: usize,
}

/// Runtime half of an instance: everything the engine mutates per transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeRecord {
    pub instance_id: Uuid,
    /// Replica currently responsible for the instance.
    pub controller: String,
    /// State ids visited so far; its length is the step counter.
    pub flow: Vec<String>,
    pub state_begin_time: DateTime<Utc>,
    pub attempts: u32,
    /// Save-data of the suspended state.
    pub memory: Option<Value>,
    /// Instance data visible to expressions.
    pub data: Value,
    /// Deadline of the current state.
    pub deadline: Option<DateTime<Utc>>,
    pub caller: Option<CallerData>,
    pub updated_at: DateTime<Utc>,
}

impl RuntimeRecord {
    /// Fresh runtime for a new instance.
    pub fn new(instance_id: Uuid, controller: &str, data: Value, caller: Option<CallerData>) -> Self {
        let now = Utc::now();
        Self {
            instance_id,
            controller: controller.to_string(),
            flow: Vec::new(),
            state_begin_time: now,
            attempts: 0,
            memory: None,
            data,
            deadline: None,
            caller,
            updated_at: now,
        }
    }

    /// Number of states entered so far.
    pub fn step(&self) -> usize {
        self.flow.len()
    }

    /// Current state id.
    pub fn current_state(&self) -> Option<&str> {
        self.flow.last().map(String::as_str)
    }
}

/// One line of an instance's log stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceLogEntry {
    pub instance_id: Uuid,
    pub time: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn test_status_round_trip() {
        for status in [
            InstanceStatus::Pending,
            InstanceStatus::Complete,
            InstanceStatus::Failed,
            InstanceStatus::Crashed,
        ] {
            assert_eq!(InstanceStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(InstanceStatus::from_str("running").is_err());
        assert!(!InstanceStatus::Pending.is_terminal());
        assert!(InstanceStatus::Crashed.is_terminal());
    }

    #[test]
    fn test_runtime_step_counter() {
        let mut rt = RuntimeRecord::new(Uuid::new_v4(), "node-a", json!({}), None);
        assert_eq!(rt.step(), 0);
        assert_eq!(rt.current_state(), None);
        rt.flow.push("a".into());
        rt.flow.push("b".into());
        assert_eq!(rt.step(), 2);
        assert_eq!(rt.current_state(), Some("b"));
    }
}
