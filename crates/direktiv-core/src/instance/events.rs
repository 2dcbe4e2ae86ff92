use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A CloudEvents 1.0 event in structured JSON form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudEvent {
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default = "default_spec_version")]
    pub specversion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Extension attributes.
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

fn default_spec_version() -> String {
    "1.0".to_string()
}

impl CloudEvent {
    /// Create an event with a random id, stamped with the current time.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            event_type: event_type.into(),
            specversion: default_spec_version(),
            subject: None,
            time: Some(Utc::now()),
            datacontenttype: Some("application/json".to_string()),
            data,
            extensions: Map::new(),
        }
    }

    /// Look up a context attribute by name.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "source" => Some(Value::String(self.source.clone())),
            "type" => Some(Value::String(self.event_type.clone())),
            "specversion" => Some(Value::String(self.specversion.clone())),
            "subject" => self.subject.clone().map(Value::String),
            "datacontenttype" => self.datacontenttype.clone().map(Value::String),
            _ => self.extensions.get(name).cloned(),
        }
    }
}

/// One event an instance is waiting for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    pub event_type: String,
    /// Evaluated context attributes; string values may contain `*` wildcards.
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl EventFilter {
    /// Whether `event` satisfies this filter.
    pub fn matches(&self, event: &CloudEvent) -> bool {
        if self.event_type != event.event_type {
            return false;
        }
        self.context.iter().all(|(name, expected)| {
            event
                .attribute(name)
                .map(|actual| attribute_matches(expected, &actual))
                .unwrap_or(false)
        })
    }
}

fn attribute_matches(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::String(pattern), Value::String(value)) if pattern.contains('*') => {
            let escaped = regex::escape(pattern).replace("\\*", ".*");
            Regex::new(&format!("^{}$", escaped))
                .map(|re| re.is_match(value))
                .unwrap_or(false)
        }
        _ => expected == actual,
    }
}

/// Event listener registered by a waiting event state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventListenerRecord {
    pub id: Uuid,
    pub namespace: String,
    pub instance_id: Uuid,
    /// Step of the waiting state.
    pub step: usize,
    pub filters: Vec<EventFilter>,
    pub created_at: DateTime<Utc>,
}

impl EventListenerRecord {
    /// Whether any filter matches `event`.
    pub fn matches(&self, event: &CloudEvent) -> bool {
        self.filters.iter().any(|f| f.matches(event))
    }
}
