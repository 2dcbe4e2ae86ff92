//! Bookkeeping shared by states that fan out into several actions.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use direktiv_core::duration;
use direktiv_core::error::{DirektivError, Result};
use direktiv_core::instance::ActionResultPayload;
use direktiv_core::model::{ActionDefinition, RetryPolicy};

use super::{action_failure, retry_delay, ChildInfo, ChildKind, DispatchOptions, StateRuntime};
use crate::engine::InstanceMemory;

/// Failure recorded against a branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct BranchError {
    pub code: String,
    pub message: String,
}

/// One dispatched branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct Branch {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ChildKind,
    pub attempts: u32,
    pub complete: bool,
    /// Waiting for a retry backoff.
    #[serde(default)]
    pub retrying: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BranchError>,
}

/// What resumed a fan-out state.
#[derive(Debug)]
pub(crate) enum Resume {
    /// Backoff of branch `n` elapsed.
    Retry(usize),
    Result(ActionResultPayload),
}

impl Resume {
    pub(crate) fn parse(wakedata: Value) -> Option<Self> {
        if let Some(index) = wakedata.get("retry").and_then(Value::as_u64) {
            return Some(Self::Retry(index as usize));
        }
        serde_json::from_value(wakedata).ok().map(Self::Result)
    }
}

/// Outcome of one branch result.
#[derive(Debug)]
pub(crate) enum Outcome {
    Succeeded,
    Retrying,
    Failed(DirektivError),
}

/// Save-data of a fan-out state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub(crate) struct BranchSet {
    pub branches: Vec<Branch>,
}

impl BranchSet {
    pub(crate) fn load(im: &InstanceMemory) -> Result<Option<Self>> {
        im.unmarshal_memory()
    }

    pub(crate) fn save(&self, im: &mut InstanceMemory) -> Result<()> {
        im.set_memory(self)
    }

    /// Dispatch branch `index` and record it, replacing any earlier attempt.
    pub(crate) async fn dispatch(
        &mut self,
        rt: &dyn StateRuntime,
        im: &mut InstanceMemory,
        index: usize,
        action: &ActionDefinition,
        input: Value,
        attempts: u32,
    ) -> Result<()> {
        let child = rt
            .dispatch_action(
                im,
                action,
                input,
                DispatchOptions {
                    iterator: Some(index),
                    attempt: attempts,
                    asynchronous: false,
                },
            )
            .await?;

        let branch = Branch {
            id: child.id,
            kind: child.kind,
            attempts,
            complete: false,
            retrying: false,
            output: Value::Null,
            error: None,
        };
        match self.branches.get_mut(index) {
            Some(slot) => *slot = branch,
            None => self.branches.push(branch),
        }
        Ok(())
    }

    /// Index of the running branch that owns `action_id`.
    pub(crate) fn locate(&self, action_id: &str) -> Option<usize> {
        self.branches
            .iter()
            .position(|b| b.id == action_id && !b.complete && !b.retrying)
    }

    /// Branch `index` waiting on a backoff, if it is.
    pub(crate) fn retrying(&self, index: usize) -> Option<&Branch> {
        self.branches.get(index).filter(|b| b.retrying && !b.complete)
    }

    /// Apply the result of branch `index`, scheduling a retry when the policy allows.
    pub(crate) async fn record(
        &mut self,
        rt: &dyn StateRuntime,
        im: &InstanceMemory,
        index: usize,
        results: ActionResultPayload,
        policy: Option<&RetryPolicy>,
    ) -> Result<Outcome> {
        let Some(branch) = self.branches.get_mut(index) else {
            return Err(DirektivError::internal(format!("no branch {}", index)));
        };

        if !results.is_error() {
            branch.complete = true;
            branch.output = results.output;
            return Ok(Outcome::Succeeded);
        }

        let err = action_failure(&results);
        let retry = match err.code().filter(|_| err.is_catchable()) {
            Some(code) => retry_delay(policy, code, branch.attempts, rt.engine_config()),
            None => Ok(None),
        };

        match retry {
            Ok(Some(delay)) => {
                branch.retrying = true;
                branch.attempts += 1;
                rt.schedule_wakeup(
                    im,
                    &format!("retry-{}", index),
                    duration::add(Utc::now(), delay)?,
                    json!({ "retry": index }),
                )
                .await?;
                Ok(Outcome::Retrying)
            }
            Ok(None) => Ok(Outcome::Failed(Self::fail(branch, err))),
            Err(exceeded) => Ok(Outcome::Failed(Self::fail(branch, exceeded))),
        }
    }

    fn fail(branch: &mut Branch, err: DirektivError) -> DirektivError {
        branch.complete = true;
        branch.error = Some(BranchError {
            code: err.code().unwrap_or_default().to_string(),
            message: err.public_message(),
        });
        err
    }

    /// Branches whose action may still report back.
    pub(crate) fn living(&self) -> Vec<ChildInfo> {
        self.branches
            .iter()
            .filter(|b| !b.complete && !b.retrying)
            .map(|b| ChildInfo {
                id: b.id.clone(),
                kind: b.kind,
            })
            .collect()
    }

    pub(crate) fn all_complete(&self) -> bool {
        self.branches.iter().all(|b| b.complete)
    }

    pub(crate) fn all_failed(&self) -> bool {
        self.branches.iter().all(|b| b.complete && b.error.is_some())
    }

    pub(crate) fn outputs(&self) -> Vec<Value> {
        self.branches.iter().map(|b| b.output.clone()).collect()
    }
}
