use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use direktiv_core::error::{DirektivError, Result};
use direktiv_core::instance::{
    CloudEvent, InstanceRecord, InstanceStatus, MessageKind, RuntimeRecord,
};
use direktiv_core::model::CompiledWorkflow;

use crate::functions::FunctionRequest;
use crate::lock::InstanceLock;
use crate::states::StateLogic;

/// Work that must wait until the instance lock is released.
pub(crate) enum Deferred {
    Invoke(FunctionRequest),
    StartChild(Box<InstanceMemory>),
    CancelAction(String),
    Message {
        instance_id: Uuid,
        kind: MessageKind,
        payload: Value,
    },
}

/// Working projection of one instance.
///
/// Holding an `InstanceMemory` with a lock is the only authorization to
/// mutate the instance's durable record.
pub struct InstanceMemory {
    pub(crate) instance: InstanceRecord,
    pub(crate) runtime: RuntimeRecord,
    workflow: Arc<CompiledWorkflow>,
    pub(crate) logic: Option<Arc<dyn StateLogic>>,
    pub(crate) lock: Option<InstanceLock>,
    /// Controller recorded before this replica claimed the instance.
    pub(crate) previous_controller: String,
    staged_events: Vec<CloudEvent>,
    deferred: Vec<Deferred>,
}

impl InstanceMemory {
    pub(crate) fn new(
        instance: InstanceRecord,
        runtime: RuntimeRecord,
        workflow: Arc<CompiledWorkflow>,
    ) -> Self {
        let previous_controller = runtime.controller.clone();
        Self {
            instance,
            runtime,
            workflow,
            logic: None,
            lock: None,
            previous_controller,
            staged_events: Vec::new(),
            deferred: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.instance.id
    }

    /// Number of states entered so far.
    pub fn step(&self) -> usize {
        self.runtime.step()
    }

    pub fn flow(&self) -> &[String] {
        &self.runtime.flow
    }

    pub fn status(&self) -> InstanceStatus {
        self.instance.status
    }

    pub fn namespace(&self) -> &str {
        &self.instance.namespace
    }

    pub fn instance(&self) -> &InstanceRecord {
        &self.instance
    }

    pub fn runtime(&self) -> &RuntimeRecord {
        &self.runtime
    }

    pub fn workflow(&self) -> &Arc<CompiledWorkflow> {
        &self.workflow
    }

    pub fn current_state(&self) -> Option<&str> {
        self.runtime.current_state()
    }

    /// Instance data visible to workflow expressions.
    pub fn data(&self) -> &Value {
        &self.runtime.data
    }

    pub fn set_data(&mut self, data: Value) {
        self.runtime.data = data;
    }

    /// Set one top-level key of the instance data.
    pub fn store_data(&mut self, key: &str, value: Value) {
        if !self.runtime.data.is_object() {
            self.runtime.data = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.runtime.data {
            map.insert(key.to_string(), value);
        }
    }

    /// Persist state save-data for the next resume.
    pub fn set_memory<T: Serialize>(&mut self, savedata: &T) -> Result<()> {
        let value = serde_json::to_value(savedata)
            .map_err(|e| DirektivError::Serialization(e.to_string()))?;
        self.runtime.memory = Some(value);
        Ok(())
    }

    pub fn get_memory(&self) -> Option<&Value> {
        self.runtime.memory.as_ref()
    }

    /// Decode the save-data, if any.
    pub fn unmarshal_memory<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.runtime.memory {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| DirektivError::internal(format!("corrupt state memory: {}", e))),
            None => Ok(None),
        }
    }

    pub(crate) fn clear_memory(&mut self) {
        self.runtime.memory = None;
    }

    /// Token of the held lock; cancelled by a hard cancel.
    pub fn cancel_token(&self) -> Option<CancellationToken> {
        self.lock.as_ref().map(|l| l.token().clone())
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Queue an event for delivery once the transition is persisted.
    pub fn stage_event(&mut self, event: CloudEvent) {
        self.staged_events.push(event);
    }

    pub(crate) fn take_staged_events(&mut self) -> Vec<CloudEvent> {
        std::mem::take(&mut self.staged_events)
    }

    pub(crate) fn defer(&mut self, work: Deferred) {
        self.deferred.push(work);
    }

    pub(crate) fn take_deferred(&mut self) -> Vec<Deferred> {
        std::mem::take(&mut self.deferred)
    }

    /// Unlocked memory over a fresh instance record.
    #[cfg(test)]
    pub(crate) fn for_tests(workflow: Arc<CompiledWorkflow>, data: Value) -> Self {
        let now = chrono::Utc::now();
        let id = Uuid::new_v4();
        let instance = InstanceRecord {
            id,
            namespace_id: Uuid::new_v4(),
            namespace: "test".to_string(),
            workflow_id: Uuid::new_v4(),
            revision_id: Uuid::new_v4(),
            as_path: "/test.yaml".to_string(),
            status: InstanceStatus::Pending,
            error_code: None,
            error_message: None,
            invoker: "test".to_string(),
            created_at: now,
            updated_at: now,
            ended_at: None,
            input: data.clone(),
            output: None,
        };
        let mut runtime = RuntimeRecord::new(id, "test", data, None);
        runtime.flow.push(workflow.start_state().to_string());
        Self::new(instance, runtime, workflow)
    }
}

impl std::fmt::Debug for InstanceMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceMemory")
            .field("id", &self.instance.id)
            .field("status", &self.instance.status)
            .field("flow", &self.runtime.flow)
            .field("locked", &self.lock.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Savedata {
        op: String,
        id: String,
        attempts: u32,
    }

    fn memory() -> InstanceMemory {
        let wf = CompiledWorkflow::from_yaml("states:\n  - id: a\n    type: noop\n").unwrap();
        InstanceMemory::for_tests(Arc::new(wf), serde_json::json!({"x": 1}))
    }

    #[test]
    fn test_memory_round_trip() {
        let mut im = memory();
        assert!(im.unmarshal_memory::<Savedata>().unwrap().is_none());

        let saved = Savedata {
            op: "retry".to_string(),
            id: "abc".to_string(),
            attempts: 3,
        };
        im.set_memory(&saved).unwrap();
        assert_eq!(im.unmarshal_memory::<Savedata>().unwrap(), Some(saved));

        im.clear_memory();
        assert!(im.get_memory().is_none());
    }

    #[test]
    fn test_corrupt_memory_is_internal() {
        let mut im = memory();
        im.set_memory(&serde_json::json!([1, 2])).unwrap();
        let err = im.unmarshal_memory::<Savedata>().unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn test_store_data() {
        let mut im = memory();
        im.store_data("return", serde_json::json!(5));
        assert_eq!(im.data()["x"], 1);
        assert_eq!(im.data()["return"], 5);
        assert_eq!(im.step(), 1);
        assert_eq!(im.current_state(), Some("a"));
    }
}
