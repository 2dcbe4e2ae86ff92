use async_trait::async_trait;
use serde_json::Value;

use direktiv_core::error::{codes, DirektivError, Result};
use direktiv_core::expr;
use direktiv_core::model::{StateBase, StateType, ValidateState};

use super::{expect_fresh, StateLogic, StateRuntime, Transition};
use crate::engine::InstanceMemory;

pub(crate) struct ValidateLogic {
    state: ValidateState,
}

impl ValidateLogic {
    pub(crate) fn new(state: ValidateState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl StateLogic for ValidateLogic {
    fn base(&self) -> &StateBase {
        &self.state.base
    }

    fn state_type(&self) -> StateType {
        StateType::Validate
    }

    async fn run(
        &self,
        _rt: &dyn StateRuntime,
        im: &mut InstanceMemory,
        wakedata: Option<Value>,
    ) -> Result<Option<Transition>> {
        expect_fresh(im, &wakedata)?;

        let subject = match &self.state.subject {
            Some(subject) => expr::evaluate(subject, im.data())?,
            None => im.data().clone(),
        };

        let validator = jsonschema::validator_for(&self.state.schema).map_err(|e| {
            DirektivError::catchable(codes::SCHEMA_FAILED, format!("invalid schema: {}", e))
        })?;

        let failures: Vec<String> = validator
            .iter_errors(&subject)
            .map(|e| e.to_string())
            .collect();
        if !failures.is_empty() {
            return Err(DirektivError::catchable(
                codes::SCHEMA_FAILED,
                failures.join("; "),
            ));
        }

        Ok(Some(Transition::from_base(&self.state.base)))
    }
}
