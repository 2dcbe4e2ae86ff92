use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use direktiv_core::duration;
use direktiv_core::error::{DirektivError, Result};
use direktiv_core::model::{DelayState, StateBase, StateType};

use super::{expect_fresh, StateLogic, StateRuntime, Transition};
use crate::engine::InstanceMemory;

const WAKE_SENTINEL: &str = "delay-elapsed";

pub(crate) struct DelayLogic {
    state: DelayState,
}

impl DelayLogic {
    pub(crate) fn new(state: DelayState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl StateLogic for DelayLogic {
    fn base(&self) -> &StateBase {
        &self.state.base
    }

    fn state_type(&self) -> StateType {
        StateType::Delay
    }

    /// The sleep itself plus the usual grace.
    fn deadline(&self, now: DateTime<Utc>, default: chrono::Duration) -> Result<DateTime<Utc>> {
        let grace = match &self.state.base.timeout {
            Some(timeout) => duration::parse(timeout)?,
            None => default,
        };
        let wake_at = duration::add(now, duration::parse(&self.state.duration)?)?;
        duration::add(wake_at, grace)
    }

    async fn run(
        &self,
        rt: &dyn StateRuntime,
        im: &mut InstanceMemory,
        wakedata: Option<Value>,
    ) -> Result<Option<Transition>> {
        if im.get_memory().is_none() {
            expect_fresh(im, &wakedata)?;
            let wake_at = duration::add(Utc::now(), duration::parse(&self.state.duration)?)?;
            rt.schedule_wakeup(im, "delay", wake_at, json!(WAKE_SENTINEL))
                .await?;
            im.set_memory(&json!({ "wakeAt": wake_at }))?;
            return Ok(None);
        }

        match wakedata {
            Some(Value::String(s)) if s == WAKE_SENTINEL => {
                Ok(Some(Transition::from_base(&self.state.base)))
            }
            other => Err(DirektivError::internal(format!(
                "delay state '{}' woken with unexpected data {:?}",
                self.state.base.id, other
            ))),
        }
    }
}
