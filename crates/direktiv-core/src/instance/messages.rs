use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::CloudEvent;

/// Instance message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Cancel,
    Wake,
    Event,
    Action,
    Transition,
}

impl MessageKind {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancel => "cancel",
            Self::Wake => "wake",
            Self::Event => "event",
            Self::Action => "action",
            Self::Transition => "transition",
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cancel" => Ok(Self::Cancel),
            "wake" => Ok(Self::Wake),
            "event" => Ok(Self::Event),
            "action" => Ok(Self::Action),
            "transition" => Ok(Self::Transition),
            _ => Err(format!("Unknown instance message type: {}", s)),
        }
    }
}

/// A queued instruction for one instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMessage {
    pub id: i64,
    pub instance_id: Uuid,
    pub kind: MessageKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Payload of `cancel` messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CancelPayload {
    pub code: String,
    pub message: String,
    /// Soft cancels are catchable; hard cancels are not.
    pub soft: bool,
    /// Step the cancel targets; `0` targets whatever step is current.
    #[serde(default)]
    pub step: usize,
}

/// Payload of `event` messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    /// Step whose listener matched.
    pub step: usize,
    pub event: CloudEvent,
}

/// Payload of `action` messages: the outcome of a function call or subflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionResultPayload {
    pub action_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub output: Value,
}

impl ActionResultPayload {
    /// Whether the action failed.
    pub fn is_error(&self) -> bool {
        self.error_code.is_some() || self.error_message.is_some()
    }
}

/// Payload of `transition` messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransitionPayload {
    pub state: String,
    #[serde(default)]
    pub attempt: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn test_kind_strings() {
        assert_eq!(MessageKind::from_str("action").unwrap(), MessageKind::Action);
        assert_eq!(MessageKind::Transition.as_str(), "transition");
        assert!(MessageKind::from_str("poke").is_err());
    }

    #[test]
    fn test_action_result_wire_format() {
        let payload: ActionResultPayload = serde_json::from_value(json!({
            "actionId": "abc",
            "errorCode": "app.failed",
            "errorMessage": "nope"
        }))
        .unwrap();
        assert!(payload.is_error());
        assert_eq!(payload.output, Value::Null);

        let ok: ActionResultPayload =
            serde_json::from_value(json!({"actionId": "abc", "output": {"x": 1}})).unwrap();
        assert!(!ok.is_error());
    }
}
