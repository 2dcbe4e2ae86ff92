use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use direktiv_core::duration;
use direktiv_core::error::{DirektivError, Result};
use direktiv_core::instance::ActionResultPayload;
use direktiv_core::model::{ActionState, StateBase, StateType};

use super::{
    action_failure, action_input, expect_fresh, retry_delay, ChildInfo, ChildKind,
    DispatchOptions, StateLogic, StateRuntime, Transition,
};
use crate::engine::InstanceMemory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Op {
    /// Waiting for the result of `id`.
    Do,
    /// Waiting for the retry backoff to elapse.
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActionSavedata {
    op: Op,
    id: String,
    #[serde(rename = "type")]
    kind: ChildKind,
    attempts: u32,
}

pub(crate) struct ActionLogic {
    state: ActionState,
}

impl ActionLogic {
    pub(crate) fn new(state: ActionState) -> Self {
        Self { state }
    }

    async fn dispatch(
        &self,
        rt: &dyn StateRuntime,
        im: &mut InstanceMemory,
        attempts: u32,
    ) -> Result<Option<Transition>> {
        let input = action_input(&self.state.action, im.data(), im.data().clone(), &[])?;
        let child = rt
            .dispatch_action(
                im,
                &self.state.action,
                input,
                DispatchOptions {
                    iterator: None,
                    attempt: attempts,
                    asynchronous: self.state.is_async,
                },
            )
            .await?;

        if self.state.is_async {
            tracing::debug!(instance = %im.id(), action = %child.id, "Dispatched asynchronous action");
            return Ok(Some(Transition::from_base(&self.state.base)));
        }

        im.set_memory(&ActionSavedata {
            op: Op::Do,
            id: child.id,
            kind: child.kind,
            attempts,
        })?;
        Ok(None)
    }
}

#[async_trait]
impl StateLogic for ActionLogic {
    fn base(&self) -> &StateBase {
        &self.state.base
    }

    fn state_type(&self) -> StateType {
        StateType::Action
    }

    fn living_children(&self, im: &InstanceMemory) -> Vec<ChildInfo> {
        match im.unmarshal_memory::<ActionSavedata>() {
            Ok(Some(sd)) if sd.op == Op::Do => vec![ChildInfo {
                id: sd.id,
                kind: sd.kind,
            }],
            _ => Vec::new(),
        }
    }

    async fn run(
        &self,
        rt: &dyn StateRuntime,
        im: &mut InstanceMemory,
        wakedata: Option<Value>,
    ) -> Result<Option<Transition>> {
        let Some(sd) = im.unmarshal_memory::<ActionSavedata>()? else {
            expect_fresh(im, &wakedata)?;
            return self.dispatch(rt, im, 0).await;
        };

        if sd.op == Op::Retry {
            tracing::info!(instance = %im.id(), state = %self.state.base.id, attempt = sd.attempts, "Retrying action");
            return self.dispatch(rt, im, sd.attempts).await;
        }

        let Some(wakedata) = wakedata else {
            return Err(DirektivError::internal(format!(
                "action state '{}' resumed without results",
                self.state.base.id
            )));
        };
        let results: ActionResultPayload = match serde_json::from_value(wakedata) {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(instance = %im.id(), error = %e, "Ignoring unreadable action results");
                return Ok(None);
            }
        };
        if results.action_id != sd.id {
            tracing::warn!(
                instance = %im.id(),
                expected = %sd.id,
                received = %results.action_id,
                "Ignoring results of a stale action"
            );
            return Ok(None);
        }

        if results.is_error() {
            let err = action_failure(&results);
            let Some(code) = err.code().filter(|_| err.is_catchable()).map(str::to_string) else {
                return Err(err);
            };
            let delay = retry_delay(
                self.state.action.retries.as_ref(),
                &code,
                sd.attempts,
                rt.engine_config(),
            )?;
            let Some(delay) = delay else {
                return Err(err);
            };

            let attempts = sd.attempts + 1;
            im.set_memory(&ActionSavedata {
                op: Op::Retry,
                attempts,
                ..sd
            })?;
            let wake_at = duration::add(Utc::now(), delay)?;
            rt.schedule_wakeup(im, "retry", wake_at, json!({ "retry": attempts }))
                .await?;
            tracing::info!(instance = %im.id(), code = %code, attempts, "Action failed; retry scheduled");
            return Ok(None);
        }

        im.store_data("return", results.output);
        Ok(Some(Transition::from_base(&self.state.base)))
    }
}
