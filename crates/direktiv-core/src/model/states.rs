use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{ErrorCatcher, RetryPolicy};
use crate::model::functions::FunctionFileDefinition;

/// Fields shared by every state type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateBase {
    /// Unique state identifier within the workflow.
    pub id: String,
    /// Expression logged when the state is entered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<Value>,
    /// Expression replacing instance data after the state succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Value>,
    /// Next state; none ends the instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
    /// Error catchers tried in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<ErrorCatcher>,
    /// Per-state soft deadline (ISO-8601).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// A workflow state, tagged by its `type` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum State {
    Noop(NoopState),
    Delay(DelayState),
    Switch(SwitchState),
    Validate(ValidateState),
    Getter(GetterState),
    Setter(SetterState),
    Action(ActionState),
    Foreach(ForeachState),
    Parallel(ParallelState),
    EventsAnd(EventsAndState),
    EventsXor(EventsXorState),
    ConsumeEvent(ConsumeEventState),
    GenerateEvent(GenerateEventState),
    Error(ErrorState),
}

impl State {
    /// Shared fields of the state.
    pub fn base(&self) -> &StateBase {
        match self {
            Self::Noop(s) => &s.base,
            Self::Delay(s) => &s.base,
            Self::Switch(s) => &s.base,
            Self::Validate(s) => &s.base,
            Self::Getter(s) => &s.base,
            Self::Setter(s) => &s.base,
            Self::Action(s) => &s.base,
            Self::Foreach(s) => &s.base,
            Self::Parallel(s) => &s.base,
            Self::EventsAnd(s) => &s.base,
            Self::EventsXor(s) => &s.base,
            Self::ConsumeEvent(s) => &s.base,
            Self::GenerateEvent(s) => &s.base,
            Self::Error(s) => &s.base,
        }
    }

    /// State identifier.
    pub fn id(&self) -> &str {
        &self.base().id
    }

    /// State type.
    pub fn state_type(&self) -> StateType {
        match self {
            Self::Noop(_) => StateType::Noop,
            Self::Delay(_) => StateType::Delay,
            Self::Switch(_) => StateType::Switch,
            Self::Validate(_) => StateType::Validate,
            Self::Getter(_) => StateType::Getter,
            Self::Setter(_) => StateType::Setter,
            Self::Action(_) => StateType::Action,
            Self::Foreach(_) => StateType::Foreach,
            Self::Parallel(_) => StateType::Parallel,
            Self::EventsAnd(_) => StateType::EventsAnd,
            Self::EventsXor(_) => StateType::EventsXor,
            Self::ConsumeEvent(_) => StateType::ConsumeEvent,
            Self::GenerateEvent(_) => StateType::GenerateEvent,
            Self::Error(_) => StateType::Error,
        }
    }

    /// Every state id this state may transition to.
    pub fn transitions(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        if let Some(t) = &self.base().transition {
            out.push(t);
        }
        for catcher in &self.base().catch {
            if let Some(t) = &catcher.transition {
                out.push(t);
            }
        }
        match self {
            Self::Switch(s) => {
                out.extend(s.conditions.iter().filter_map(|c| c.transition.as_deref()));
                if let Some(t) = &s.default_transition {
                    out.push(t);
                }
            }
            Self::EventsXor(s) => {
                out.extend(s.events.iter().filter_map(|c| c.transition.as_deref()));
            }
            _ => {}
        }
        out
    }

    /// Actions this state dispatches.
    pub fn actions(&self) -> Vec<&ActionDefinition> {
        match self {
            Self::Action(s) => vec![&s.action],
            Self::Foreach(s) => vec![&s.action],
            Self::Parallel(s) => s.actions.iter().collect(),
            _ => Vec::new(),
        }
    }
}

/// State type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StateType {
    Noop,
    Delay,
    Switch,
    Validate,
    Getter,
    Setter,
    Action,
    Foreach,
    Parallel,
    EventsAnd,
    EventsXor,
    ConsumeEvent,
    GenerateEvent,
    Error,
}

impl StateType {
    /// Convert to string for storage and logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Delay => "delay",
            Self::Switch => "switch",
            Self::Validate => "validate",
            Self::Getter => "getter",
            Self::Setter => "setter",
            Self::Action => "action",
            Self::Foreach => "foreach",
            Self::Parallel => "parallel",
            Self::EventsAnd => "eventsAnd",
            Self::EventsXor => "eventsXor",
            Self::ConsumeEvent => "consumeEvent",
            Self::GenerateEvent => "generateEvent",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for StateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoopState {
    #[serde(flatten)]
    pub base: StateBase,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelayState {
    #[serde(flatten)]
    pub base: StateBase,
    /// ISO-8601 duration to sleep.
    pub duration: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SwitchState {
    #[serde(flatten)]
    pub base: StateBase,
    pub conditions: Vec<SwitchCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_transform: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_transition: Option<String>,
}

/// One branch of a switch state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SwitchCondition {
    pub condition: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidateState {
    #[serde(flatten)]
    pub base: StateBase,
    /// Expression selecting the validated value; the whole data document when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Value>,
    pub schema: Value,
}

/// Variable scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarScope {
    #[default]
    Instance,
    Workflow,
    Namespace,
}

impl VarScope {
    /// Convert to string for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::Workflow => "workflow",
            Self::Namespace => "namespace",
        }
    }
}

impl std::str::FromStr for VarScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instance" => Ok(Self::Instance),
            "workflow" => Ok(Self::Workflow),
            "namespace" => Ok(Self::Namespace),
            _ => Err(format!("Unknown variable scope: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetterState {
    #[serde(flatten)]
    pub base: StateBase,
    pub variables: Vec<GetterDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetterDefinition {
    /// Variable key; may be an expression.
    pub key: Value,
    #[serde(default)]
    pub scope: VarScope,
    /// Name under `data.var`; the key when absent.
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub as_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SetterState {
    #[serde(flatten)]
    pub base: StateBase,
    pub variables: Vec<SetterDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SetterDefinition {
    /// Variable key; may be an expression.
    pub key: Value,
    #[serde(default)]
    pub scope: VarScope,
    /// Value expression; `null` or empty deletes the variable.
    #[serde(default)]
    pub value: Value,
    /// Content type; `application/json` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A function call made by action, foreach and parallel states.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionDefinition {
    /// Id of a declared function.
    pub function: String,
    /// Input expression; the whole data document when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FunctionFileDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionState {
    #[serde(flatten)]
    pub base: StateBase,
    pub action: ActionDefinition,
    /// Fire and forget; the state transitions immediately.
    #[serde(default, rename = "async")]
    pub is_async: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForeachState {
    #[serde(flatten)]
    pub base: StateBase,
    /// Expression producing the array to iterate.
    pub array: Value,
    /// Action run per element; the element is bound as `item`.
    pub action: ActionDefinition,
}

/// How a parallel state combines its branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchMode {
    /// Every branch must succeed.
    #[default]
    And,
    /// The first successful branch wins.
    Or,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParallelState {
    #[serde(flatten)]
    pub base: StateBase,
    pub actions: Vec<ActionDefinition>,
    #[serde(default)]
    pub mode: BranchMode,
}

/// Description of an awaited event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumeEventDefinition {
    /// CloudEvent type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Context attributes that must match; values may be expressions.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumeEventState {
    #[serde(flatten)]
    pub base: StateBase,
    pub event: ConsumeEventDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventsAndState {
    #[serde(flatten)]
    pub base: StateBase,
    pub events: Vec<ConsumeEventDefinition>,
}

/// One branch of an events-xor state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventCondition {
    pub event: ConsumeEventDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventsXorState {
    #[serde(flatten)]
    pub base: StateBase,
    pub events: Vec<EventCondition>,
}

/// Event emitted by a generate-event state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerateEventDefinition {
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    /// Payload expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_content_type: Option<String>,
    /// Extension attributes; values may be expressions.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerateEventState {
    #[serde(flatten)]
    pub base: StateBase,
    pub event: GenerateEventDefinition,
    /// ISO-8601 delivery delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorState {
    #[serde(flatten)]
    pub base: StateBase,
    /// Error code raised.
    pub error: String,
    /// Message template; `%v` placeholders are filled from `args`.
    pub message: String,
    /// Argument expressions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_switch_state() {
        let yaml = r#"
id: decide
type: switch
conditions:
  - condition: "{{ x > 1 }}"
    transition: big
  - condition: "{{ x == 1 }}"
    transition: one
defaultTransition: small
"#;
        let state: State = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(state.id(), "decide");
        assert_eq!(state.state_type(), StateType::Switch);
        assert_eq!(state.transitions(), vec!["big", "one", "small"]);
    }

    #[test]
    fn test_parse_action_with_retries_and_catch() {
        let yaml = r#"
id: call
type: action
action:
  function: greeter
  input:
    name: "{{ name }}"
  retries:
    max_attempts: 3
    delay: PT2S
    multiplier: 2
    codes: [".*"]
catch:
  - error: "*"
    transition: failed
transition: done
"#;
        let state: State = serde_yaml::from_str(yaml).unwrap();
        let State::Action(action) = &state else {
            panic!("expected action state");
        };
        let retries = action.action.retries.as_ref().unwrap();
        assert_eq!(retries.max_attempts, 3);
        assert_eq!(retries.multiplier, Some(2.0));
        assert_eq!(action.base.catch.len(), 1);
        assert!(!action.is_async);
        assert_eq!(state.actions().len(), 1);
    }

    #[test]
    fn test_parse_event_states() {
        let yaml = r#"
id: wait
type: eventsXor
events:
  - event:
      type: order.created
      context:
        region: eu
    transition: created
  - event:
      type: order.cancelled
    transition: cancelled
"#;
        let state: State = serde_yaml::from_str(yaml).unwrap();
        let State::EventsXor(xor) = &state else {
            panic!("expected eventsXor state");
        };
        assert_eq!(xor.events[0].event.event_type, "order.created");
        assert_eq!(xor.events[0].event.context["region"], "eu");
        assert!(xor.events[1].event.context.is_empty());
    }

    #[test]
    fn test_parallel_mode_defaults_to_and() {
        let yaml = r#"
id: fan
type: parallel
actions:
  - function: a
  - function: b
"#;
        let State::Parallel(p) = serde_yaml::from_str::<State>(yaml).unwrap() else {
            panic!("expected parallel state");
        };
        assert_eq!(p.mode, BranchMode::And);
        assert_eq!(p.actions.len(), 2);
    }

    #[test]
    fn test_unknown_state_type_is_rejected() {
        let yaml = "id: x\ntype: teleport\n";
        assert!(serde_yaml::from_str::<State>(yaml).is_err());
    }

    #[test]
    fn test_state_type_strings() {
        assert_eq!(StateType::EventsAnd.as_str(), "eventsAnd");
        assert_eq!(StateType::GenerateEvent.to_string(), "generateEvent");
    }
}
