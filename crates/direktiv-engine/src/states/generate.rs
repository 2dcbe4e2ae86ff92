use async_trait::async_trait;
use serde_json::Value;

use direktiv_core::duration;
use direktiv_core::error::Result;
use direktiv_core::expr;
use direktiv_core::instance::CloudEvent;
use direktiv_core::model::{GenerateEventState, StateBase, StateType};

use super::{expect_fresh, StateLogic, StateRuntime, Transition};
use crate::engine::InstanceMemory;

pub(crate) struct GenerateEventLogic {
    state: GenerateEventState,
}

impl GenerateEventLogic {
    pub(crate) fn new(state: GenerateEventState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl StateLogic for GenerateEventLogic {
    fn base(&self) -> &StateBase {
        &self.state.base
    }

    fn state_type(&self) -> StateType {
        StateType::GenerateEvent
    }

    async fn run(
        &self,
        rt: &dyn StateRuntime,
        im: &mut InstanceMemory,
        wakedata: Option<Value>,
    ) -> Result<Option<Transition>> {
        expect_fresh(im, &wakedata)?;

        let def = &self.state.event;
        let data = match &def.data {
            Some(data) => expr::evaluate(data, im.data())?,
            None => im.data().clone(),
        };

        let mut event = CloudEvent::new(def.event_type.clone(), def.source.clone(), data);
        if let Some(content_type) = &def.data_content_type {
            event.datacontenttype = Some(content_type.clone());
        }
        for (name, value) in &def.context {
            event
                .extensions
                .insert(name.clone(), expr::evaluate(value, im.data())?);
        }

        let delay = self
            .state
            .delay
            .as_deref()
            .map(duration::parse)
            .transpose()?;

        tracing::debug!(instance = %im.id(), event_type = %event.event_type, "Generating event");
        rt.generate_event(im, event, delay).await?;

        Ok(Some(Transition::from_base(&self.state.base)))
    }
}
