use async_trait::async_trait;
use serde_json::Value;

use direktiv_core::error::Result;
use direktiv_core::model::{NoopState, StateBase, StateType};

use super::{expect_fresh, StateLogic, StateRuntime, Transition};
use crate::engine::InstanceMemory;

pub(crate) struct NoopLogic {
    state: NoopState,
}

impl NoopLogic {
    pub(crate) fn new(state: NoopState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl StateLogic for NoopLogic {
    fn base(&self) -> &StateBase {
        &self.state.base
    }

    fn state_type(&self) -> StateType {
        StateType::Noop
    }

    async fn run(
        &self,
        _rt: &dyn StateRuntime,
        im: &mut InstanceMemory,
        wakedata: Option<Value>,
    ) -> Result<Option<Transition>> {
        expect_fresh(im, &wakedata)?;
        Ok(Some(Transition::from_base(&self.state.base)))
    }
}
