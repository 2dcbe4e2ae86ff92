mod schedule;

pub use schedule::{CronParseError, CronSchedule};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Function fired by soft and hard deadline timers.
pub const TIMEOUT_FUNCTION: &str = "timeoutFunction";
/// Function fired by delay, sleep and retry timers.
pub const SLEEP_WAKEUP_FUNCTION: &str = "sleepWakeup";
/// Function fired by delayed generate-event timers.
pub const SEND_EVENT_FUNCTION: &str = "sendEventFunction";
/// Cron handler scanning for instances whose controller went quiet.
pub const STALLED_INSTANCES_FUNCTION: &str = "stalledInstances";

/// Timer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimerKind {
    /// Fires repeatedly on a cron pattern.
    Cron,
    /// Fires once at a point in time.
    OneShot,
}

impl TimerKind {
    /// Convert to string for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::OneShot => "one-shot",
        }
    }
}

/// When a timer fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerSchedule {
    /// Cron pattern.
    Cron(String),
    /// Absolute time.
    At(DateTime<Utc>),
}

/// A registered timer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timer {
    /// Deterministic identity; scheduling a timer under an existing name replaces it.
    pub name: String,
    /// Timer type.
    pub kind: TimerKind,
    /// Name of the registered function to invoke.
    pub function: String,
    /// When the timer fires.
    pub schedule: TimerSchedule,
    /// Payload handed to the function.
    pub payload: serde_json::Value,
}

/// Payload of deadline timers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutPayload {
    pub instance_id: Uuid,
    /// Step the deadline belongs to; `0` is the whole-workflow deadline.
    pub step: usize,
    pub soft: bool,
}

/// Payload of wake-up timers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WakePayload {
    pub instance_id: Uuid,
    pub step: usize,
    /// Wake data handed to the state logic on resume.
    pub data: serde_json::Value,
}

/// Timer naming scheme.
///
/// Every instance timer is named `<purpose>:<instance>:...` so any replica can
/// recompute a name and cancel it without shared memory.
pub mod names {
    use uuid::Uuid;

    /// Deadline timer of one step (`step == 0` for the whole workflow).
    pub fn timeout(instance: Uuid, soft: bool, step: usize) -> String {
        let kind = if soft { "soft" } else { "hard" };
        format!("timeout:{}:{}:{}", instance, kind, step)
    }

    /// Wake-up timer of one step.
    pub fn sleep(instance: Uuid, step: usize, tag: &str) -> String {
        format!("sleep:{}:{}:{}", instance, step, tag)
    }

    /// Delayed event delivery.
    pub fn send_event(instance: Uuid, event_id: &str) -> String {
        format!("event:{}:{}", instance, event_id)
    }

    /// Instance whose lifetime bounds a timer.
    ///
    /// Delayed events outlive the instance that generated them.
    pub fn instance_of(name: &str) -> Option<Uuid> {
        let mut parts = name.split(':');
        match parts.next() {
            Some("timeout") | Some("sleep") => parts.next().and_then(|id| Uuid::parse_str(id).ok()),
            _ => None,
        }
    }
}
