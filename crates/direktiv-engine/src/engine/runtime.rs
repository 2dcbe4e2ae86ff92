//! Engine services exposed to state logic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use direktiv_core::config::EngineConfig;
use direktiv_core::duration;
use direktiv_core::error::{codes, DirektivError, Result};
use direktiv_core::instance::{
    decode_variable, encode_variable, is_delete_value, CallerData, CancelPayload, CloudEvent,
    EventFilter, EventListenerRecord, MessageKind, VariableRecord,
};
use direktiv_core::model::{ActionDefinition, VarScope};
use direktiv_core::timer::{names, WakePayload, SEND_EVENT_FUNCTION, SLEEP_WAKEUP_FUNCTION};

use super::{Deferred, DelayedEvent, Engine, InstanceMemory, NewInstanceArgs};
use crate::functions::FunctionRequest;
use crate::states::{ChildInfo, ChildKind, DispatchOptions, StateRuntime};

impl Engine {
    fn variable_owner(im: &InstanceMemory, scope: VarScope) -> Uuid {
        let instance = im.instance();
        match scope {
            VarScope::Instance => instance.id,
            VarScope::Workflow => instance.workflow_id,
            VarScope::Namespace => instance.namespace_id,
        }
    }

    fn workflow_path(im: &InstanceMemory) -> &str {
        let as_path = &im.instance().as_path;
        direktiv_core::catalog::split_ref(as_path).0
    }
}

#[async_trait]
impl StateRuntime for Engine {
    fn engine_config(&self) -> &EngineConfig {
        &self.inner.config
    }

    async fn dispatch_action(
        &self,
        im: &mut InstanceMemory,
        action: &ActionDefinition,
        input: Value,
        opts: DispatchOptions,
    ) -> Result<ChildInfo> {
        let function = im.workflow().function(&action.function).cloned().ok_or_else(|| {
            DirektivError::internal(format!("action calls undeclared function '{}'", action.function))
        })?;

        if function.is_subflow() {
            let path = function.workflow.clone().ok_or_else(|| {
                DirektivError::internal(format!("subflow function '{}' names no workflow", function.id))
            })?;
            let caller = (!opts.asynchronous).then(|| CallerData {
                instance_id: im.id(),
                step: im.step(),
            });
            let args = NewInstanceArgs {
                namespace: im.namespace().to_string(),
                path: path.clone(),
                reference: None,
                input,
                invoker: format!("instance:{}", im.id()),
                caller,
            };
            let child = match self.new_instance(args).await {
                Ok(child) => child,
                Err(DirektivError::NotFound(what)) => {
                    return Err(DirektivError::catchable(
                        codes::SUBFLOW_NOT_FOUND,
                        format!("subflow '{}' not found: {}", path, what),
                    ))
                }
                Err(e) => return Err(e),
            };
            let id = child.id().to_string();
            tracing::debug!(instance = %im.id(), child = %id, subflow = %path, "Subflow dispatched");
            im.defer(Deferred::StartChild(Box::new(child)));
            return Ok(ChildInfo {
                id,
                kind: ChildKind::Subflow,
            });
        }

        let action_id = Uuid::new_v4().to_string();
        let deadline = match im.runtime().deadline {
            Some(deadline) => deadline,
            None => duration::add(Utc::now(), duration::parse(&self.inner.config.soft_timeout)?)?,
        };
        let mut files = function.files.clone();
        files.extend(action.files.iter().cloned());

        let request = FunctionRequest {
            action_id: action_id.clone(),
            instance_id: im.id(),
            namespace: im.namespace().to_string(),
            workflow_path: Self::workflow_path(im).to_string(),
            step: im.step(),
            state: im.current_state().unwrap_or_default().to_string(),
            function,
            input,
            files,
            secrets: action.secrets.clone(),
            deadline,
            iterator: opts.iterator,
            attempt: opts.attempt,
            asynchronous: opts.asynchronous,
        };
        tracing::debug!(
            instance = %im.id(),
            action = %action_id,
            function = %action.function,
            attempt = opts.attempt,
            "Function dispatched"
        );
        im.defer(Deferred::Invoke(request));
        Ok(ChildInfo {
            id: action_id,
            kind: ChildKind::Function,
        })
    }

    async fn schedule_wakeup(
        &self,
        im: &InstanceMemory,
        tag: &str,
        at: DateTime<Utc>,
        data: Value,
    ) -> Result<()> {
        let payload = serde_json::to_value(WakePayload {
            instance_id: im.id(),
            step: im.step(),
            data,
        })?;
        self.inner.timers.add_one_shot(
            &names::sleep(im.id(), im.step(), tag),
            SLEEP_WAKEUP_FUNCTION,
            at,
            payload,
        )
    }

    async fn listen_for_events(&self, im: &InstanceMemory, filters: Vec<EventFilter>) -> Result<()> {
        let store = &self.inner.store;
        store.delete_event_listeners(im.id()).await?;
        let listener = EventListenerRecord {
            id: Uuid::new_v4(),
            namespace: im.namespace().to_string(),
            instance_id: im.id(),
            step: im.step(),
            filters,
            created_at: Utc::now(),
        };
        store.add_event_listener(&listener).await?;
        tracing::debug!(instance = %im.id(), step = im.step(), "Listening for events");
        Ok(())
    }

    async fn delete_event_listeners(&self, im: &InstanceMemory) -> Result<()> {
        self.inner.store.delete_event_listeners(im.id()).await
    }

    async fn get_variable(
        &self,
        im: &InstanceMemory,
        scope: VarScope,
        key: &str,
    ) -> Result<Option<Value>> {
        let owner = Self::variable_owner(im, scope);
        match self.inner.store.get_variable(scope, owner, key).await? {
            Some(record) => Ok(Some(decode_variable(&record.data, &record.mime_type)?)),
            None => Ok(None),
        }
    }

    async fn set_variable(
        &self,
        im: &InstanceMemory,
        scope: VarScope,
        key: &str,
        value: &Value,
        mime_type: &str,
    ) -> Result<()> {
        let owner = Self::variable_owner(im, scope);
        if is_delete_value(value) {
            tracing::debug!(instance = %im.id(), scope = scope.as_str(), key, "Variable deleted");
            return self.inner.store.delete_variable(scope, owner, key).await;
        }
        let record = VariableRecord {
            scope,
            owner,
            key: key.to_string(),
            mime_type: mime_type.to_string(),
            data: encode_variable(value, mime_type)?,
            updated_at: Utc::now(),
        };
        self.inner.store.set_variable(&record).await
    }

    async fn generate_event(
        &self,
        im: &mut InstanceMemory,
        event: CloudEvent,
        delay: Option<chrono::Duration>,
    ) -> Result<()> {
        match delay.filter(|d| *d > chrono::Duration::zero()) {
            None => {
                im.stage_event(event);
                Ok(())
            }
            Some(delay) => {
                let name = names::send_event(im.id(), &event.id);
                let payload = serde_json::to_value(DelayedEvent {
                    namespace: im.namespace().to_string(),
                    event,
                })?;
                self.inner
                    .timers
                    .add_one_shot(
                        &name,
                        SEND_EVENT_FUNCTION,
                        duration::add(Utc::now(), delay)?,
                        payload,
                    )
            }
        }
    }

    async fn cancel_children(&self, im: &mut InstanceMemory, children: Vec<ChildInfo>) {
        for child in children {
            match child.kind {
                ChildKind::Function => im.defer(Deferred::CancelAction(child.id)),
                ChildKind::Subflow => {
                    let Ok(instance_id) = Uuid::parse_str(&child.id) else {
                        tracing::warn!(instance = %im.id(), child = %child.id, "Invalid subflow id");
                        continue;
                    };
                    let cancel = CancelPayload {
                        code: codes::CANCELLED_PARENT.to_string(),
                        message: "cancelled by parent workflow".to_string(),
                        soft: false,
                        step: 0,
                    };
                    match serde_json::to_value(&cancel) {
                        Ok(payload) => im.defer(Deferred::Message {
                            instance_id,
                            kind: MessageKind::Cancel,
                            payload,
                        }),
                        Err(e) => tracing::error!(error = %e, "Failed to encode cancel"),
                    }
                }
            }
        }
    }
}
