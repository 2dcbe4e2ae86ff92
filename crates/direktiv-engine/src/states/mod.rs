//! State Logic: one implementation per state type behind a shared contract.
//!
//! `run` is called on first entry with no memory and no wake data, and again
//! for every instance message addressed to the state. States that wait for
//! something persist save-data with [`InstanceMemory::set_memory`] before
//! suspending, since the next call only sees the wake data.

mod action;
mod branches;
mod delay;
mod error;
mod events;
mod foreach;
mod generate;
mod noop;
mod parallel;
mod switch;
mod validate;
mod variables;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use direktiv_core::config::EngineConfig;
use direktiv_core::duration;
use direktiv_core::error::{codes, DirektivError, Result};
use direktiv_core::expr;
use direktiv_core::instance::{ActionResultPayload, CloudEvent, EventFilter};
use direktiv_core::model::{
    ActionDefinition, ErrorCatcher, RetryPolicy, State, StateBase, StateType, VarScope,
};

use crate::engine::InstanceMemory;

/// Result of running a state: where to go next.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// `None` ends the instance.
    pub next_state: Option<String>,
    /// Data transform applied before moving on.
    pub transform: Option<Value>,
}

impl Transition {
    pub fn new(next_state: Option<String>, transform: Option<Value>) -> Self {
        Self {
            next_state,
            transform,
        }
    }

    /// The state's declared transition and transform.
    pub fn from_base(base: &StateBase) -> Self {
        Self::new(base.transition.clone(), base.transform.clone())
    }
}

/// Kind of work spawned by a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildKind {
    Function,
    Subflow,
}

/// A spawned action or subflow still owned by a state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ChildKind,
}

/// Options of one action dispatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchOptions {
    /// Branch index inside foreach and parallel states.
    pub iterator: Option<usize>,
    /// Retry number of this dispatch.
    pub attempt: u32,
    pub asynchronous: bool,
}

/// Engine services available to state logic.
#[async_trait]
pub trait StateRuntime: Send + Sync {
    fn engine_config(&self) -> &EngineConfig;

    /// Start a function call or subflow. The call itself happens after the
    /// instance lock is released.
    async fn dispatch_action(
        &self,
        im: &mut InstanceMemory,
        action: &ActionDefinition,
        input: Value,
        opts: DispatchOptions,
    ) -> Result<ChildInfo>;

    /// Resume the current step at `at` with `data` as wake data.
    async fn schedule_wakeup(
        &self,
        im: &InstanceMemory,
        tag: &str,
        at: DateTime<Utc>,
        data: Value,
    ) -> Result<()>;

    /// Replace the instance's event listeners.
    async fn listen_for_events(&self, im: &InstanceMemory, filters: Vec<EventFilter>)
        -> Result<()>;

    async fn delete_event_listeners(&self, im: &InstanceMemory) -> Result<()>;

    async fn get_variable(
        &self,
        im: &InstanceMemory,
        scope: VarScope,
        key: &str,
    ) -> Result<Option<Value>>;

    /// Write a variable; `null` or an empty string deletes it.
    async fn set_variable(
        &self,
        im: &InstanceMemory,
        scope: VarScope,
        key: &str,
        value: &Value,
        mime_type: &str,
    ) -> Result<()>;

    async fn generate_event(
        &self,
        im: &mut InstanceMemory,
        event: CloudEvent,
        delay: Option<chrono::Duration>,
    ) -> Result<()>;

    /// Stop children; best effort.
    async fn cancel_children(&self, im: &mut InstanceMemory, children: Vec<ChildInfo>);
}

/// Behaviour shared by every state type.
#[async_trait]
pub trait StateLogic: Send + Sync {
    fn base(&self) -> &StateBase;

    fn state_type(&self) -> StateType;

    fn id(&self) -> &str {
        &self.base().id
    }

    fn error_catchers(&self) -> &[ErrorCatcher] {
        &self.base().catch
    }

    fn log_expr(&self) -> Option<&Value> {
        self.base().log.as_ref()
    }

    /// When the state times out if entered at `now`.
    fn deadline(&self, now: DateTime<Utc>, default: chrono::Duration) -> Result<DateTime<Utc>> {
        let timeout = match &self.base().timeout {
            Some(timeout) => duration::parse(timeout)?,
            None => default,
        };
        duration::add(now, timeout)
    }

    /// Children still running under this state.
    fn living_children(&self, _im: &InstanceMemory) -> Vec<ChildInfo> {
        Vec::new()
    }

    async fn run(
        &self,
        rt: &dyn StateRuntime,
        im: &mut InstanceMemory,
        wakedata: Option<Value>,
    ) -> Result<Option<Transition>>;
}

/// Instantiate the logic of a state.
pub fn build(state: &State) -> Arc<dyn StateLogic> {
    match state {
        State::Noop(s) => Arc::new(noop::NoopLogic::new(s.clone())),
        State::Delay(s) => Arc::new(delay::DelayLogic::new(s.clone())),
        State::Switch(s) => Arc::new(switch::SwitchLogic::new(s.clone())),
        State::Validate(s) => Arc::new(validate::ValidateLogic::new(s.clone())),
        State::Getter(s) => Arc::new(variables::GetterLogic::new(s.clone())),
        State::Setter(s) => Arc::new(variables::SetterLogic::new(s.clone())),
        State::Action(s) => Arc::new(action::ActionLogic::new(s.clone())),
        State::Foreach(s) => Arc::new(foreach::ForeachLogic::new(s.clone())),
        State::Parallel(s) => Arc::new(parallel::ParallelLogic::new(s.clone())),
        State::EventsAnd(s) => Arc::new(events::EventsAndLogic::new(s.clone())),
        State::EventsXor(s) => Arc::new(events::EventsXorLogic::new(s.clone())),
        State::ConsumeEvent(s) => Arc::new(events::ConsumeEventLogic::new(s.clone())),
        State::GenerateEvent(s) => Arc::new(generate::GenerateEventLogic::new(s.clone())),
        State::Error(s) => Arc::new(error::ErrorLogic::new(s.clone())),
    }
}

/// Reject save-data or wake data on what should be a first entry.
pub(crate) fn expect_fresh(im: &InstanceMemory, wakedata: &Option<Value>) -> Result<()> {
    if im.get_memory().is_some() || wakedata.is_some() {
        return Err(DirektivError::internal(format!(
            "state '{}' of instance {} entered with unexpected save-data",
            im.current_state().unwrap_or_default(),
            im.id()
        )));
    }
    Ok(())
}

/// Input of an action: its input expression, or `default` when it declares none.
pub(crate) fn action_input(
    action: &ActionDefinition,
    data: &Value,
    default: Value,
    extra: &[(&str, &Value)],
) -> Result<Value> {
    match &action.input {
        Some(input) => expr::evaluate_with(input, data, extra),
        None => Ok(default),
    }
}

/// Workflow error carried by a failed action result.
pub(crate) fn action_failure(results: &ActionResultPayload) -> DirektivError {
    let message = results
        .error_message
        .clone()
        .unwrap_or_else(|| "action failed".to_string());
    match &results.error_code {
        Some(code) if !code.is_empty() => DirektivError::catchable(code.clone(), message),
        _ => DirektivError::uncatchable(codes::ACTION_CRASHED, message),
    }
}

/// Decide whether a failed action is retried.
///
/// Returns the backoff when it is, `None` when the policy does not cover the
/// code, and a `retries exceeded` error once attempts are used up.
pub(crate) fn retry_delay(
    policy: Option<&RetryPolicy>,
    code: &str,
    attempts: u32,
    config: &EngineConfig,
) -> Result<Option<chrono::Duration>> {
    let Some(policy) = policy.filter(|p| p.retries_code(code)) else {
        return Ok(None);
    };

    if attempts >= policy.max_attempts {
        return Err(DirektivError::catchable(
            codes::RETRIES_EXCEEDED,
            format!(
                "maximum retries exceeded ({}) after error '{}'",
                policy.max_attempts, code
            ),
        ));
    }

    policy
        .backoff(attempts, &config.default_retry_delay)
        .map(Some)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use direktiv_core::model::CompiledWorkflow;

    /// Records every engine call a state makes.
    #[derive(Default)]
    pub(crate) struct MockRuntime {
        pub config: EngineConfig,
        pub dispatched: Mutex<Vec<(String, Value, DispatchOptions, String)>>,
        pub wakeups: Mutex<Vec<(String, DateTime<Utc>, Value)>>,
        pub listeners: Mutex<Vec<Vec<EventFilter>>>,
        pub listeners_deleted: Mutex<usize>,
        pub variables: Mutex<HashMap<String, (Value, String)>>,
        pub events: Mutex<Vec<(CloudEvent, Option<chrono::Duration>)>>,
        pub cancelled: Mutex<Vec<ChildInfo>>,
    }

    impl MockRuntime {
        pub fn dispatched_ids(&self) -> Vec<String> {
            self.dispatched
                .lock()
                .unwrap()
                .iter()
                .map(|(_, _, _, id)| id.clone())
                .collect()
        }

        pub fn last_dispatch(&self) -> (String, Value, DispatchOptions, String) {
            self.dispatched.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl StateRuntime for MockRuntime {
        fn engine_config(&self) -> &EngineConfig {
            &self.config
        }

        async fn dispatch_action(
            &self,
            _im: &mut InstanceMemory,
            action: &ActionDefinition,
            input: Value,
            opts: DispatchOptions,
        ) -> Result<ChildInfo> {
            let mut dispatched = self.dispatched.lock().unwrap();
            let id = format!("action-{}", dispatched.len());
            dispatched.push((action.function.clone(), input, opts, id.clone()));
            Ok(ChildInfo {
                id,
                kind: ChildKind::Function,
            })
        }

        async fn schedule_wakeup(
            &self,
            _im: &InstanceMemory,
            tag: &str,
            at: DateTime<Utc>,
            data: Value,
        ) -> Result<()> {
            self.wakeups
                .lock()
                .unwrap()
                .push((tag.to_string(), at, data));
            Ok(())
        }

        async fn listen_for_events(
            &self,
            _im: &InstanceMemory,
            filters: Vec<EventFilter>,
        ) -> Result<()> {
            self.listeners.lock().unwrap().push(filters);
            Ok(())
        }

        async fn delete_event_listeners(&self, _im: &InstanceMemory) -> Result<()> {
            *self.listeners_deleted.lock().unwrap() += 1;
            Ok(())
        }

        async fn get_variable(
            &self,
            _im: &InstanceMemory,
            scope: VarScope,
            key: &str,
        ) -> Result<Option<Value>> {
            Ok(self
                .variables
                .lock()
                .unwrap()
                .get(&format!("{}/{}", scope.as_str(), key))
                .map(|(v, _)| v.clone()))
        }

        async fn set_variable(
            &self,
            _im: &InstanceMemory,
            scope: VarScope,
            key: &str,
            value: &Value,
            mime_type: &str,
        ) -> Result<()> {
            let name = format!("{}/{}", scope.as_str(), key);
            let mut variables = self.variables.lock().unwrap();
            if direktiv_core::instance::is_delete_value(value) {
                variables.remove(&name);
            } else {
                variables.insert(name, (value.clone(), mime_type.to_string()));
            }
            Ok(())
        }

        async fn generate_event(
            &self,
            _im: &mut InstanceMemory,
            event: CloudEvent,
            delay: Option<chrono::Duration>,
        ) -> Result<()> {
            self.events.lock().unwrap().push((event, delay));
            Ok(())
        }

        async fn cancel_children(&self, _im: &mut InstanceMemory, children: Vec<ChildInfo>) {
            self.cancelled.lock().unwrap().extend(children);
        }
    }

    /// Logic and fresh memory for state `id` of a YAML workflow.
    pub(crate) fn setup(yaml: &str, id: &str, data: Value) -> (Arc<dyn StateLogic>, InstanceMemory) {
        let workflow = Arc::new(CompiledWorkflow::from_yaml(yaml).unwrap());
        let state = workflow.state(id).unwrap();
        let mut im = InstanceMemory::for_tests(workflow, data);
        im.runtime.flow = vec![id.to_string()];
        (build(&state), im)
    }

    /// An action result as delivered by an `action` message.
    pub(crate) fn result(id: &str, output: Value) -> Value {
        serde_json::to_value(ActionResultPayload {
            action_id: id.to_string(),
            output,
            ..Default::default()
        })
        .unwrap()
    }

    pub(crate) fn failure(id: &str, code: Option<&str>) -> Value {
        serde_json::to_value(ActionResultPayload {
            action_id: id.to_string(),
            error_code: code.map(str::to_string),
            error_message: Some("boom".to_string()),
            ..Default::default()
        })
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use direktiv_core::model::CompiledWorkflow;

    #[test]
    fn test_build_dispatches_on_type() {
        let yaml = r#"
states:
  - id: a
    type: noop
    transition: b
  - id: b
    type: delay
    duration: PT1S
    transition: c
  - id: c
    type: error
    error: bad
    message: nope
"#;
        let wf = CompiledWorkflow::from_yaml(yaml).unwrap();
        for (id, ty) in [("a", StateType::Noop), ("b", StateType::Delay), ("c", StateType::Error)] {
            let logic = build(&wf.state(id).unwrap());
            assert_eq!(logic.id(), id);
            assert_eq!(logic.state_type(), ty);
        }
    }

    #[test]
    fn test_action_failure_classification() {
        let catchable = action_failure(&ActionResultPayload {
            action_id: "a".into(),
            error_code: Some("io.timeout".into()),
            error_message: Some("slow".into()),
            output: Value::Null,
        });
        assert!(catchable.is_catchable());
        assert_eq!(catchable.code(), Some("io.timeout"));

        let crashed = action_failure(&ActionResultPayload {
            action_id: "a".into(),
            error_message: Some("segfault".into()),
            ..Default::default()
        });
        assert!(!crashed.is_catchable());
        assert_eq!(crashed.code(), Some(codes::ACTION_CRASHED));
    }

    #[test]
    fn test_retry_delay() {
        let config = EngineConfig::default();
        let policy = RetryPolicy {
            max_attempts: 2,
            delay: Some("PT2S".into()),
            multiplier: Some(2.0),
            codes: vec!["io\\..*".into()],
        };

        assert_eq!(
            retry_delay(Some(&policy), "io.timeout", 0, &config).unwrap(),
            Some(chrono::Duration::seconds(2))
        );
        assert_eq!(
            retry_delay(Some(&policy), "io.timeout", 1, &config).unwrap(),
            Some(chrono::Duration::seconds(4))
        );
        let exceeded = retry_delay(Some(&policy), "io.timeout", 2, &config).unwrap_err();
        assert_eq!(exceeded.code(), Some(codes::RETRIES_EXCEEDED));
        assert!(exceeded.is_catchable());

        assert_eq!(retry_delay(Some(&policy), "db.down", 0, &config).unwrap(), None);
        assert_eq!(retry_delay(None, "io.timeout", 0, &config).unwrap(), None);
    }

    #[test]
    fn test_default_deadline() {
        let wf = CompiledWorkflow::from_yaml(
            "states:\n  - id: a\n    type: noop\n  - id: b\n    type: noop\n    timeout: PT1M\n",
        )
        .unwrap();
        let now = Utc::now();
        let default = chrono::Duration::minutes(15);

        let a = build(&wf.state("a").unwrap());
        assert_eq!(a.deadline(now, default).unwrap(), now + default);
        let b = build(&wf.state("b").unwrap());
        assert_eq!(b.deadline(now, default).unwrap(), now + chrono::Duration::minutes(1));
    }
}
