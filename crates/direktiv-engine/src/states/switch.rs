use async_trait::async_trait;
use serde_json::Value;

use direktiv_core::error::Result;
use direktiv_core::expr;
use direktiv_core::model::{StateBase, StateType, SwitchState};

use super::{expect_fresh, StateLogic, StateRuntime, Transition};
use crate::engine::InstanceMemory;

pub(crate) struct SwitchLogic {
    state: SwitchState,
}

impl SwitchLogic {
    pub(crate) fn new(state: SwitchState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl StateLogic for SwitchLogic {
    fn base(&self) -> &StateBase {
        &self.state.base
    }

    fn state_type(&self) -> StateType {
        StateType::Switch
    }

    async fn run(
        &self,
        _rt: &dyn StateRuntime,
        im: &mut InstanceMemory,
        wakedata: Option<Value>,
    ) -> Result<Option<Transition>> {
        expect_fresh(im, &wakedata)?;

        for (i, condition) in self.state.conditions.iter().enumerate() {
            if expr::evaluate_condition(&condition.condition, im.data())? {
                tracing::debug!(instance = %im.id(), state = %self.state.base.id, branch = i, "Switch condition matched");
                return Ok(Some(Transition::new(
                    condition.transition.clone(),
                    condition.transform.clone(),
                )));
            }
        }

        Ok(Some(Transition::new(
            self.state.default_transition.clone(),
            self.state.default_transform.clone(),
        )))
    }
}
