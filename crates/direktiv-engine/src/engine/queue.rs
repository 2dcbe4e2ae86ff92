//! Instance Message Queue: every external stimulus reaches an instance as a
//! queued message, processed one at a time under the instance lock.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use direktiv_core::error::{DirektivError, Result};
use direktiv_core::instance::{
    ActionResultPayload, CancelPayload, EventPayload, InstanceMessage, MessageKind,
    TransitionPayload,
};
use direktiv_core::timer::WakePayload;

use super::{Engine, InstanceMemory, Step};
use crate::bus::handlers;

/// Key of an `instanceMessage` control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnershipAssertion {
    instance_id: Uuid,
    last_known_server: String,
    last_known_update_at: DateTime<Utc>,
}

impl Engine {
    /// Persist a message for an instance and make sure someone processes it.
    ///
    /// The controlling replica is told over the bus; this replica processes
    /// itself when it is the controller or the controller has gone quiet.
    pub(crate) async fn enqueue_instance_message(
        &self,
        id: Uuid,
        kind: MessageKind,
        payload: Value,
    ) -> Result<()> {
        let store = &self.inner.store;
        let seq = store.push_message(id, kind, &payload).await?;
        tracing::debug!(instance = %id, kind = kind.as_str(), seq, "Instance message queued");

        let runtime = store
            .get_runtime(id)
            .await?
            .ok_or_else(|| DirektivError::NotFound(format!("runtime of instance {}", id)))?;

        if runtime.controller == self.inner.hostname || self.is_stale(runtime.updated_at) {
            tokio::spawn(self.process_instance_messages(id));
        }

        if runtime.controller != self.inner.hostname {
            let assertion = OwnershipAssertion {
                instance_id: id,
                last_known_server: runtime.controller,
                last_known_update_at: runtime.updated_at,
            };
            let key = serde_json::to_string(&assertion)?;
            self.inner.bus.publish(handlers::INSTANCE_MESSAGE, &key);
        }
        Ok(())
    }

    /// Another replica queued a message; process it if we own the instance.
    pub(crate) async fn ownership_asserted(&self, key: &str) {
        let assertion: OwnershipAssertion = match serde_json::from_str(key) {
            Ok(assertion) => assertion,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid ownership assertion");
                return;
            }
        };
        if assertion.last_known_server == self.inner.hostname
            || self.is_stale(assertion.last_known_update_at)
        {
            self.process_instance_messages(assertion.instance_id).await;
        }
    }

    fn is_stale(&self, updated_at: DateTime<Utc>) -> bool {
        Utc::now() - updated_at > self.inner.config.ownership_timeout() / 2
    }

    /// Process queued messages until the queue is empty.
    pub(crate) fn process_instance_messages(&self, id: Uuid) -> BoxFuture<'static, ()> {
        let engine = self.clone();
        async move {
            loop {
                if engine.inner.shutdown.is_cancelled() {
                    break;
                }

                let lock = match engine.inner.locks.lock_instance(id).await {
                    Ok(lock) => lock,
                    Err(e) => {
                        tracing::debug!(instance = %id, error = %e, "Instance busy, leaving messages queued");
                        break;
                    }
                };

                let message = match engine.inner.store.pop_message(id).await {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        engine.unlock_quietly(id, lock).await;
                        break;
                    }
                    Err(e) => {
                        tracing::error!(instance = %id, error = %e, "Failed to pop instance message");
                        engine.unlock_quietly(id, lock).await;
                        break;
                    }
                };

                let mut im = match engine.load(id).await {
                    Ok(im) if !im.status().is_terminal() => im,
                    Ok(im) => {
                        tracing::debug!(instance = %id, status = %im.status(), kind = message.kind.as_str(), "Dropping message of finished instance");
                        engine.unlock_quietly(id, lock).await;
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(instance = %id, error = %e, "Dropping message of unloadable instance");
                        engine.unlock_quietly(id, lock).await;
                        continue;
                    }
                };
                im.lock = Some(lock);

                if im.runtime.controller != engine.inner.hostname {
                    tracing::info!(instance = %id, from = %im.runtime.controller, "Taking over instance");
                    im.runtime.controller = engine.inner.hostname.clone();
                    im.runtime.updated_at = Utc::now();
                    if let Err(e) = engine.inner.store.update_runtime(&im.runtime).await {
                        tracing::error!(instance = %id, error = %e, "Failed to claim instance");
                    }
                }

                engine.handle_message(&mut im, message).await;
                engine.release(&mut im).await;
            }
        }
        .boxed()
    }

    async fn unlock_quietly(&self, id: Uuid, lock: crate::lock::InstanceLock) {
        if let Err(e) = self.inner.locks.unlock_instance(lock).await {
            tracing::warn!(instance = %id, error = %e, "Failed to release instance lock");
        }
    }

    /// Pick up messages that arrived while this replica held the lock.
    pub(crate) async fn drain_if_pending(&self, id: Uuid) {
        match self.inner.store.count_messages(id).await {
            Ok(0) => {}
            Ok(_) => self.process_instance_messages(id).await,
            Err(e) => tracing::warn!(instance = %id, error = %e, "Failed to count instance messages"),
        }
    }

    async fn handle_message(&self, im: &mut InstanceMemory, message: InstanceMessage) {
        let id = im.id();
        let kind = message.kind;
        tracing::debug!(instance = %id, kind = kind.as_str(), step = im.step(), "Handling instance message");

        let step = match self.interpret(im, message) {
            Ok(Some(step)) => step,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(instance = %id, kind = kind.as_str(), error = %e, "Dropping malformed instance message");
                return;
            }
        };
        self.drive(im, step).await;
    }

    /// Turn a message into the next drive step, or `None` when it is stale.
    fn interpret(&self, im: &InstanceMemory, message: InstanceMessage) -> Result<Option<Step>> {
        let id = im.id();
        match message.kind {
            MessageKind::Cancel => {
                let cancel: CancelPayload = serde_json::from_value(message.payload)?;
                if cancel.step != 0 && cancel.step != im.step() {
                    tracing::debug!(instance = %id, step = cancel.step, current = im.step(), "Ignoring cancel of a past step");
                    return Ok(None);
                }
                let error = if cancel.soft {
                    DirektivError::catchable(cancel.code, cancel.message)
                } else {
                    DirektivError::uncatchable(cancel.code, cancel.message)
                };
                Ok(Some(Step::Run {
                    wakedata: None,
                    error: Some(error),
                }))
            }
            MessageKind::Wake => {
                let wake: WakePayload = serde_json::from_value(message.payload)?;
                if wake.step != im.step() {
                    tracing::error!(instance = %id, step = wake.step, current = im.step(), "Dropping wake-up of a past step");
                    return Ok(None);
                }
                Ok(Some(Step::Run {
                    wakedata: Some(wake.data),
                    error: None,
                }))
            }
            MessageKind::Event => {
                let delivery: EventPayload = serde_json::from_value(message.payload)?;
                if delivery.step != im.step() {
                    tracing::debug!(instance = %id, step = delivery.step, current = im.step(), "Dropping event for a past step");
                    return Ok(None);
                }
                Ok(Some(Step::Run {
                    wakedata: Some(serde_json::to_value(delivery.event)?),
                    error: None,
                }))
            }
            MessageKind::Action => {
                let results: ActionResultPayload = serde_json::from_value(message.payload.clone())?;
                let living = im
                    .logic
                    .as_ref()
                    .map(|logic| logic.living_children(im))
                    .unwrap_or_default();
                if !living.iter().any(|child| child.id == results.action_id) {
                    tracing::warn!(instance = %id, action = %results.action_id, "Ignoring results of an unknown action");
                    return Ok(None);
                }
                Ok(Some(Step::Run {
                    wakedata: Some(message.payload),
                    error: None,
                }))
            }
            MessageKind::Transition => {
                let transition: TransitionPayload = serde_json::from_value(message.payload)?;
                if !im.flow().is_empty() {
                    tracing::debug!(instance = %id, "Ignoring start request of a running instance");
                    return Ok(None);
                }
                let state = if transition.state.is_empty() {
                    im.workflow().start_state().to_string()
                } else {
                    transition.state
                };
                Ok(Some(Step::Transition {
                    state,
                    attempt: transition.attempt,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ownership_assertion_wire_format() {
        let assertion = OwnershipAssertion {
            instance_id: Uuid::nil(),
            last_known_server: "replica-a".into(),
            last_known_update_at: DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let key = serde_json::to_value(&assertion).unwrap();
        assert_eq!(key["lastKnownServer"], "replica-a");
        assert!(key.get("instanceId").is_some());
        assert!(key.get("lastKnownUpdateAt").is_some());
    }
}
