//! Workflow definition model.

mod functions;
mod states;

pub use functions::{FunctionDefinition, FunctionFileDefinition, FunctionSize, FunctionType};
pub use states::{
    ActionDefinition, ActionState, BranchMode, ConsumeEventDefinition, ConsumeEventState,
    DelayState, ErrorState, EventCondition, EventsAndState, EventsXorState, ForeachState,
    GenerateEventDefinition, GenerateEventState, GetterDefinition, GetterState, NoopState,
    ParallelState, SetterDefinition, SetterState, State, StateBase, StateType, SwitchCondition,
    SwitchState, ValidateState, VarScope,
};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::duration;
use crate::error::{DirektivError, Result};

/// A workflow definition as written in YAML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<FunctionDefinition>,
    pub states: Vec<State>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<Timeouts>,
}

impl Workflow {
    /// Parse a YAML workflow definition.
    pub fn from_yaml(source: &str) -> Result<Self> {
        serde_yaml::from_str(source)
            .map_err(|e| DirektivError::InvalidArgument(format!("invalid workflow: {}", e)))
    }

    /// Look up a declared function.
    pub fn function(&self, id: &str) -> Option<&FunctionDefinition> {
        self.functions.iter().find(|f| f.id == id)
    }

    /// Check the definition for problems that would only surface at runtime.
    ///
    /// Returns every problem found; an empty list means the workflow is sound.
    pub fn lint(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let ids: HashSet<&str> = self.states.iter().map(|s| s.id()).collect();

        for state in &self.states {
            for target in state.transitions() {
                if !ids.contains(target) {
                    problems.push(format!(
                        "state '{}' transitions to unknown state '{}'",
                        state.id(),
                        target
                    ));
                }
            }
            for action in state.actions() {
                if self.function(&action.function).is_none() {
                    problems.push(format!(
                        "state '{}' calls undeclared function '{}'",
                        state.id(),
                        action.function
                    ));
                }
                if let Some(delay) = action.retries.as_ref().and_then(|r| r.delay.as_deref()) {
                    if duration::parse(delay).is_err() {
                        problems.push(format!(
                            "state '{}' has invalid retry delay '{}'",
                            state.id(),
                            delay
                        ));
                    }
                }
            }
            for catcher in &state.base().catch {
                if catcher.error != "*" && Regex::new(&catcher.error).is_err() {
                    problems.push(format!(
                        "state '{}' has invalid catch pattern '{}'",
                        state.id(),
                        catcher.error
                    ));
                }
            }
            if let Some(timeout) = &state.base().timeout {
                if duration::parse(timeout).is_err() {
                    problems.push(format!(
                        "state '{}' has invalid timeout '{}'",
                        state.id(),
                        timeout
                    ));
                }
            }
            if let State::Delay(delay) = state {
                if duration::parse(&delay.duration).is_err() {
                    problems.push(format!(
                        "state '{}' has invalid duration '{}'",
                        state.id(),
                        delay.duration
                    ));
                }
            }
        }

        for function in &self.functions {
            if function.is_subflow() && function.workflow.is_none() {
                problems.push(format!("subflow function '{}' has no workflow", function.id));
            }
        }

        if let Some(timeouts) = &self.timeouts {
            for value in [&timeouts.interrupt, &timeouts.kill].into_iter().flatten() {
                if duration::parse(value).is_err() {
                    problems.push(format!("invalid workflow timeout '{}'", value));
                }
            }
        }

        problems
    }
}

/// Whole-workflow deadlines (ISO-8601).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Timeouts {
    /// Soft deadline; the instance is cancelled with a catchable error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<String>,
    /// Hard deadline; the instance is killed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill: Option<String>,
}

/// Redirects a failing state when its error code matches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorCatcher {
    /// `*` or a regular expression matched against the whole error code.
    pub error: String,
    /// State to continue with; none ends the instance as failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
}

impl ErrorCatcher {
    /// Whether this catcher handles `code`.
    pub fn matches(&self, code: &str) -> bool {
        code_matches(&self.error, code)
    }
}

/// Retry policy of an action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    #[serde(alias = "maxAttempts")]
    pub max_attempts: u32,
    /// Delay before the first retry (ISO-8601).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
    /// Growth factor applied to the delay per retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
    /// Retryable error code patterns; every catchable code when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<String>,
}

impl RetryPolicy {
    /// Whether `code` may be retried.
    pub fn retries_code(&self, code: &str) -> bool {
        self.codes.is_empty() || self.codes.iter().any(|p| code_matches(p, code))
    }

    /// Delay before retry number `attempt` (zero based).
    pub fn backoff(&self, attempt: u32, default_delay: &str) -> Result<chrono::Duration> {
        let base = duration::parse_or(self.delay.as_deref(), default_delay)?;
        let multiplier = self.multiplier.unwrap_or(1.0).max(0.0);
        let factor = multiplier.powi(attempt as i32);
        let millis = (base.num_milliseconds() as f64 * factor).min(i64::MAX as f64 / 2.0);
        Ok(chrono::Duration::milliseconds(millis as i64))
    }
}

/// Match an error code against a catcher or retry pattern.
///
/// `*` matches everything; anything else is a regular expression that must
/// match the whole code. Invalid patterns match nothing.
pub fn code_matches(pattern: &str, code: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match Regex::new(&format!("^(?:{})$", pattern)) {
        Ok(re) => re.is_match(code),
        Err(e) => {
            tracing::warn!(pattern, error = %e, "Invalid error pattern");
            false
        }
    }
}

/// A parsed workflow with its state map.
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    workflow: Workflow,
    states: HashMap<String, Arc<State>>,
}

impl CompiledWorkflow {
    /// Compile a workflow, requiring at least one state and unique state ids.
    pub fn new(workflow: Workflow) -> Result<Self> {
        if workflow.states.is_empty() {
            return Err(DirektivError::InvalidArgument(
                "workflow declares no states".into(),
            ));
        }

        let mut states = HashMap::with_capacity(workflow.states.len());
        for state in &workflow.states {
            if state.id().is_empty() {
                return Err(DirektivError::InvalidArgument(
                    "state without an id".into(),
                ));
            }
            if states
                .insert(state.id().to_string(), Arc::new(state.clone()))
                .is_some()
            {
                return Err(DirektivError::InvalidArgument(format!(
                    "duplicate state id '{}'",
                    state.id()
                )));
            }
        }

        Ok(Self { workflow, states })
    }

    /// Parse and compile a YAML workflow definition.
    pub fn from_yaml(source: &str) -> Result<Self> {
        Self::new(Workflow::from_yaml(source)?)
    }

    /// The underlying definition.
    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// The first declared state.
    pub fn start_state(&self) -> &str {
        // `new` rejects workflows without states
        self.workflow.states.first().map(|s| s.id()).unwrap_or_default()
    }

    /// Look up a state by id.
    pub fn state(&self, id: &str) -> Option<Arc<State>> {
        self.states.get(id).cloned()
    }

    /// Look up a declared function.
    pub fn function(&self, id: &str) -> Option<&FunctionDefinition> {
        self.workflow.function(id)
    }

    /// Soft deadline of the whole workflow.
    pub fn interrupt_timeout(&self) -> Option<&str> {
        self.workflow.timeouts.as_ref().and_then(|t| t.interrupt.as_deref())
    }

    /// Hard deadline of the whole workflow.
    pub fn kill_timeout(&self) -> Option<&str> {
        self.workflow.timeouts.as_ref().and_then(|t| t.kill.as_deref())
    }
}
