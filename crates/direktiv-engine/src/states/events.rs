//! States that suspend until matching CloudEvents arrive.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use direktiv_core::error::{DirektivError, Result};
use direktiv_core::expr;
use direktiv_core::instance::{CloudEvent, EventFilter};
use direktiv_core::model::{
    ConsumeEventDefinition, ConsumeEventState, EventsAndState, EventsXorState, StateBase,
    StateType,
};

use super::{expect_fresh, StateLogic, StateRuntime, Transition};
use crate::engine::InstanceMemory;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventSavedata {
    filters: Vec<EventFilter>,
    received: Vec<Option<CloudEvent>>,
}

fn filter(def: &ConsumeEventDefinition, data: &Value) -> Result<EventFilter> {
    let context = match expr::evaluate(&Value::Object(def.context.clone()), data)? {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    Ok(EventFilter {
        event_type: def.event_type.clone(),
        context,
    })
}

/// Register listeners for `defs` and persist the waiting save-data.
async fn listen<'a>(
    rt: &dyn StateRuntime,
    im: &mut InstanceMemory,
    defs: impl Iterator<Item = &'a ConsumeEventDefinition>,
) -> Result<()> {
    let filters = defs
        .map(|def| filter(def, im.data()))
        .collect::<Result<Vec<_>>>()?;
    let received = vec![None; filters.len()];
    rt.listen_for_events(im, filters.clone()).await?;
    im.set_memory(&EventSavedata { filters, received })
}

/// Decode the save-data and the delivered event.
fn receive(im: &InstanceMemory, wakedata: Option<Value>) -> Result<(EventSavedata, Option<CloudEvent>)> {
    let sd = im
        .unmarshal_memory::<EventSavedata>()?
        .ok_or_else(|| DirektivError::internal("event state resumed without save-data"))?;
    let event = match wakedata {
        Some(value) => match serde_json::from_value(value) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(instance = %im.id(), error = %e, "Ignoring malformed event");
                None
            }
        },
        None => None,
    };
    Ok((sd, event))
}

/// Expose received events to the data document under their type.
async fn complete(
    rt: &dyn StateRuntime,
    im: &mut InstanceMemory,
    events: Vec<CloudEvent>,
) -> Result<()> {
    rt.delete_event_listeners(im).await?;
    for event in events {
        let key = event.event_type.clone();
        im.store_data(&key, serde_json::to_value(event)?);
    }
    Ok(())
}

pub(crate) struct ConsumeEventLogic {
    state: ConsumeEventState,
}

impl ConsumeEventLogic {
    pub(crate) fn new(state: ConsumeEventState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl StateLogic for ConsumeEventLogic {
    fn base(&self) -> &StateBase {
        &self.state.base
    }

    fn state_type(&self) -> StateType {
        StateType::ConsumeEvent
    }

    async fn run(
        &self,
        rt: &dyn StateRuntime,
        im: &mut InstanceMemory,
        wakedata: Option<Value>,
    ) -> Result<Option<Transition>> {
        if im.get_memory().is_none() {
            expect_fresh(im, &wakedata)?;
            listen(rt, im, std::iter::once(&self.state.event)).await?;
            return Ok(None);
        }

        let (sd, event) = receive(im, wakedata)?;
        let Some(event) = event.filter(|e| sd.filters.iter().any(|f| f.matches(e))) else {
            return Ok(None);
        };
        complete(rt, im, vec![event]).await?;
        Ok(Some(Transition::from_base(&self.state.base)))
    }
}

pub(crate) struct EventsXorLogic {
    state: EventsXorState,
}

impl EventsXorLogic {
    pub(crate) fn new(state: EventsXorState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl StateLogic for EventsXorLogic {
    fn base(&self) -> &StateBase {
        &self.state.base
    }

    fn state_type(&self) -> StateType {
        StateType::EventsXor
    }

    async fn run(
        &self,
        rt: &dyn StateRuntime,
        im: &mut InstanceMemory,
        wakedata: Option<Value>,
    ) -> Result<Option<Transition>> {
        if im.get_memory().is_none() {
            expect_fresh(im, &wakedata)?;
            listen(rt, im, self.state.events.iter().map(|c| &c.event)).await?;
            return Ok(None);
        }

        let (sd, event) = receive(im, wakedata)?;
        let Some(event) = event else {
            return Ok(None);
        };
        let Some(index) = sd.filters.iter().position(|f| f.matches(&event)) else {
            tracing::debug!(instance = %im.id(), event_type = %event.event_type, "Event matches no condition");
            return Ok(None);
        };
        let Some(condition) = self.state.events.get(index) else {
            return Err(DirektivError::internal(format!(
                "events-xor state has no condition {}",
                index
            )));
        };

        complete(rt, im, vec![event]).await?;
        Ok(Some(Transition::new(
            condition.transition.clone(),
            condition.transform.clone(),
        )))
    }
}

pub(crate) struct EventsAndLogic {
    state: EventsAndState,
}

impl EventsAndLogic {
    pub(crate) fn new(state: EventsAndState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl StateLogic for EventsAndLogic {
    fn base(&self) -> &StateBase {
        &self.state.base
    }

    fn state_type(&self) -> StateType {
        StateType::EventsAnd
    }

    async fn run(
        &self,
        rt: &dyn StateRuntime,
        im: &mut InstanceMemory,
        wakedata: Option<Value>,
    ) -> Result<Option<Transition>> {
        if im.get_memory().is_none() {
            expect_fresh(im, &wakedata)?;
            listen(rt, im, self.state.events.iter()).await?;
            return Ok(None);
        }

        let (mut sd, event) = receive(im, wakedata)?;
        let Some(event) = event else {
            return Ok(None);
        };
        let slot = sd
            .filters
            .iter()
            .zip(sd.received.iter())
            .position(|(f, r)| r.is_none() && f.matches(&event));
        let Some(slot) = slot else {
            tracing::debug!(instance = %im.id(), event_type = %event.event_type, "Event not awaited");
            return Ok(None);
        };
        sd.received[slot] = Some(event);

        if sd.received.iter().any(Option::is_none) {
            im.set_memory(&sd)?;
            return Ok(None);
        }

        let events = sd.received.into_iter().flatten().collect();
        complete(rt, im, events).await?;
        Ok(Some(Transition::from_base(&self.state.base)))
    }
}
