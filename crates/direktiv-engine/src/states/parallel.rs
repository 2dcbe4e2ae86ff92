use async_trait::async_trait;
use serde_json::Value;

use direktiv_core::error::{codes, DirektivError, Result};
use direktiv_core::model::{BranchMode, ParallelState, StateBase, StateType};

use super::branches::{BranchSet, Outcome, Resume};
use super::{action_input, expect_fresh, ChildInfo, StateLogic, StateRuntime, Transition};
use crate::engine::InstanceMemory;

pub(crate) struct ParallelLogic {
    state: ParallelState,
}

impl ParallelLogic {
    pub(crate) fn new(state: ParallelState) -> Self {
        Self { state }
    }

    fn input(&self, index: usize, data: &Value) -> Result<Value> {
        let action = self.action(index)?;
        action_input(action, data, data.clone(), &[])
    }

    fn action(&self, index: usize) -> Result<&direktiv_core::model::ActionDefinition> {
        self.state
            .actions
            .get(index)
            .ok_or_else(|| DirektivError::internal(format!("parallel state has no action {}", index)))
    }

    fn finish(&self, im: &mut InstanceMemory, set: &BranchSet, winner: Option<usize>) -> Transition {
        let outputs = match winner {
            Some(winner) => set
                .outputs()
                .into_iter()
                .enumerate()
                .map(|(i, out)| if i == winner { out } else { Value::Null })
                .collect(),
            None => set.outputs(),
        };
        im.store_data("return", Value::Array(outputs));
        Transition::from_base(&self.state.base)
    }
}

#[async_trait]
impl StateLogic for ParallelLogic {
    fn base(&self) -> &StateBase {
        &self.state.base
    }

    fn state_type(&self) -> StateType {
        StateType::Parallel
    }

    fn living_children(&self, im: &InstanceMemory) -> Vec<ChildInfo> {
        match BranchSet::load(im) {
            Ok(Some(set)) => set.living(),
            _ => Vec::new(),
        }
    }

    async fn run(
        &self,
        rt: &dyn StateRuntime,
        im: &mut InstanceMemory,
        wakedata: Option<Value>,
    ) -> Result<Option<Transition>> {
        let Some(mut set) = BranchSet::load(im)? else {
            expect_fresh(im, &wakedata)?;

            if self.state.actions.is_empty() {
                im.store_data("return", Value::Array(Vec::new()));
                return Ok(Some(Transition::from_base(&self.state.base)));
            }

            let mut set = BranchSet::default();
            let mut dispatched = Ok(());
            for (i, action) in self.state.actions.iter().enumerate() {
                dispatched = match self.input(i, im.data()) {
                    Ok(input) => set.dispatch(rt, im, i, action, input, 0).await,
                    Err(e) => Err(e),
                };
                if dispatched.is_err() {
                    break;
                }
            }
            set.save(im)?;
            dispatched?;
            return Ok(None);
        };

        match wakedata.and_then(Resume::parse) {
            Some(Resume::Retry(index)) => {
                let Some(attempts) = set.retrying(index).map(|b| b.attempts) else {
                    tracing::warn!(instance = %im.id(), index, "Ignoring retry of a settled branch");
                    return Ok(None);
                };
                let input = self.input(index, im.data())?;
                set.dispatch(rt, im, index, self.action(index)?, input, attempts)
                    .await?;
                set.save(im)?;
                Ok(None)
            }
            Some(Resume::Result(results)) => {
                let Some(index) = set.locate(&results.action_id) else {
                    tracing::warn!(instance = %im.id(), action = %results.action_id, "Ignoring results of an unknown branch");
                    return Ok(None);
                };

                let policy = self.action(index)?.retries.as_ref();
                let outcome = set.record(rt, im, index, results, policy).await?;

                match (self.state.mode, outcome) {
                    (_, Outcome::Retrying) => {
                        set.save(im)?;
                        Ok(None)
                    }
                    (BranchMode::And, Outcome::Failed(err)) => {
                        set.save(im)?;
                        Err(err)
                    }
                    (BranchMode::And, Outcome::Succeeded) => {
                        set.save(im)?;
                        if set.all_complete() {
                            Ok(Some(self.finish(im, &set, None)))
                        } else {
                            Ok(None)
                        }
                    }
                    (BranchMode::Or, Outcome::Succeeded) => {
                        let losers = set.living();
                        set.save(im)?;
                        if !losers.is_empty() {
                            rt.cancel_children(im, losers).await;
                        }
                        Ok(Some(self.finish(im, &set, Some(index))))
                    }
                    (BranchMode::Or, Outcome::Failed(err)) => {
                        set.save(im)?;
                        if set.all_failed() {
                            return Err(DirektivError::catchable(
                                codes::ALL_BRANCHES_FAILED,
                                format!("all branches failed; last error: {}", err.public_message()),
                            ));
                        }
                        tracing::debug!(instance = %im.id(), index, code = ?err.code(), "Parallel branch failed");
                        Ok(None)
                    }
                }
            }
            None => {
                tracing::warn!(instance = %im.id(), "Ignoring unreadable parallel wake data");
                Ok(None)
            }
        }
    }
}
