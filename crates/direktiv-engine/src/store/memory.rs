//! In-memory Instance Store for tests and offline checks.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use direktiv_core::catalog::{
    NamespaceRecord, RefRecord, RevisionRecord, RouteRecord, WorkflowRecord, LATEST_REF,
};
use direktiv_core::error::{DirektivError, Result};
use direktiv_core::instance::{
    EventListenerRecord, InstanceLogEntry, InstanceMessage, InstanceRecord, InstanceStatus,
    MessageKind, RuntimeRecord, VariableRecord,
};
use direktiv_core::model::VarScope;

use super::{source_hash, InstanceStore};

#[derive(Default)]
struct MemoryState {
    namespaces: HashMap<String, NamespaceRecord>,
    workflows: HashMap<(Uuid, String), WorkflowRecord>,
    revisions: HashMap<Uuid, RevisionRecord>,
    refs: HashMap<(Uuid, String), RefRecord>,
    routes: HashMap<Uuid, Vec<RouteRecord>>,
    instances: HashMap<Uuid, InstanceRecord>,
    runtimes: HashMap<Uuid, RuntimeRecord>,
    messages: HashMap<Uuid, VecDeque<InstanceMessage>>,
    next_message_id: i64,
    listeners: BTreeMap<Uuid, EventListenerRecord>,
    variables: HashMap<(VarScope, Uuid, String), VariableRecord>,
    logs: HashMap<Uuid, Vec<InstanceLogEntry>>,
}

/// Instance Store kept entirely in process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| DirektivError::internal("memory store lock poisoned"))
    }

    fn pending_runtimes(
        state: &MemoryState,
        keep: impl Fn(&RuntimeRecord) -> bool,
    ) -> Vec<RuntimeRecord> {
        state
            .runtimes
            .values()
            .filter(|rt| {
                state
                    .instances
                    .get(&rt.instance_id)
                    .map(|i| i.status == InstanceStatus::Pending)
                    .unwrap_or(false)
            })
            .filter(|rt| keep(rt))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn create_namespace(&self, name: &str) -> Result<NamespaceRecord> {
        let mut state = self.state()?;
        if state.namespaces.contains_key(name) {
            return Err(DirektivError::InvalidArgument(format!(
                "namespace '{}' already exists",
                name
            )));
        }
        let record = NamespaceRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        state.namespaces.insert(name.to_string(), record.clone());
        Ok(record)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceRecord>> {
        Ok(self.state()?.namespaces.get(name).cloned())
    }

    async fn put_workflow(
        &self,
        namespace_id: Uuid,
        path: &str,
        source: &str,
    ) -> Result<RevisionRecord> {
        let mut state = self.state()?;
        let workflow_id = state
            .workflows
            .entry((namespace_id, path.to_string()))
            .or_insert_with(|| WorkflowRecord {
                id: Uuid::new_v4(),
                namespace_id,
                path: path.to_string(),
                created_at: Utc::now(),
            })
            .id;

        let revision = RevisionRecord {
            id: Uuid::new_v4(),
            workflow_id,
            source: source.to_string(),
            hash: source_hash(source),
            created_at: Utc::now(),
        };
        state.revisions.insert(revision.id, revision.clone());
        state.refs.insert(
            (workflow_id, LATEST_REF.to_string()),
            RefRecord {
                workflow_id,
                name: LATEST_REF.to_string(),
                revision_id: revision.id,
            },
        );
        Ok(revision)
    }

    async fn get_workflow(&self, namespace_id: Uuid, path: &str) -> Result<Option<WorkflowRecord>> {
        Ok(self
            .state()?
            .workflows
            .get(&(namespace_id, path.to_string()))
            .cloned())
    }

    async fn set_ref(&self, workflow_id: Uuid, name: &str, revision_id: Uuid) -> Result<()> {
        let mut state = self.state()?;
        if !state.revisions.contains_key(&revision_id) {
            return Err(DirektivError::NotFound(format!("revision {}", revision_id)));
        }
        state.refs.insert(
            (workflow_id, name.to_string()),
            RefRecord {
                workflow_id,
                name: name.to_string(),
                revision_id,
            },
        );
        Ok(())
    }

    async fn get_ref(&self, workflow_id: Uuid, name: &str) -> Result<Option<RefRecord>> {
        Ok(self
            .state()?
            .refs
            .get(&(workflow_id, name.to_string()))
            .cloned())
    }

    async fn get_revision(&self, id: Uuid) -> Result<Option<RevisionRecord>> {
        Ok(self.state()?.revisions.get(&id).cloned())
    }

    async fn set_routes(&self, workflow_id: Uuid, routes: &[RouteRecord]) -> Result<()> {
        self.state()?.routes.insert(workflow_id, routes.to_vec());
        Ok(())
    }

    async fn list_routes(&self, workflow_id: Uuid) -> Result<Vec<RouteRecord>> {
        Ok(self
            .state()?
            .routes
            .get(&workflow_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_instance(
        &self,
        instance: &InstanceRecord,
        runtime: &RuntimeRecord,
    ) -> Result<()> {
        let mut state = self.state()?;
        if state.instances.contains_key(&instance.id) {
            return Err(DirektivError::InvalidArgument(format!(
                "instance {} already exists",
                instance.id
            )));
        }
        state.instances.insert(instance.id, instance.clone());
        state.runtimes.insert(instance.id, runtime.clone());
        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<InstanceRecord>> {
        Ok(self.state()?.instances.get(&id).cloned())
    }

    async fn update_instance(&self, instance: &InstanceRecord) -> Result<()> {
        let mut state = self.state()?;
        match state.instances.get_mut(&instance.id) {
            Some(existing) => {
                *existing = instance.clone();
                Ok(())
            }
            None => Err(DirektivError::NotFound(format!("instance {}", instance.id))),
        }
    }

    async fn get_runtime(&self, id: Uuid) -> Result<Option<RuntimeRecord>> {
        Ok(self.state()?.runtimes.get(&id).cloned())
    }

    async fn update_runtime(&self, runtime: &RuntimeRecord) -> Result<()> {
        let mut state = self.state()?;
        match state.runtimes.get_mut(&runtime.instance_id) {
            Some(existing) => {
                *existing = runtime.clone();
                Ok(())
            }
            None => Err(DirektivError::NotFound(format!(
                "runtime of instance {}",
                runtime.instance_id
            ))),
        }
    }

    async fn list_stalled(&self, updated_before: DateTime<Utc>) -> Result<Vec<RuntimeRecord>> {
        let state = self.state()?;
        Ok(Self::pending_runtimes(&state, |rt| {
            rt.updated_at < updated_before
        }))
    }

    async fn list_controlled_by(&self, controller: &str) -> Result<Vec<RuntimeRecord>> {
        let state = self.state()?;
        Ok(Self::pending_runtimes(&state, |rt| rt.controller == controller))
    }

    async fn push_message(
        &self,
        instance_id: Uuid,
        kind: MessageKind,
        payload: &Value,
    ) -> Result<i64> {
        let mut state = self.state()?;
        if !state.instances.contains_key(&instance_id) {
            return Err(DirektivError::NotFound(format!("instance {}", instance_id)));
        }
        state.next_message_id += 1;
        let id = state.next_message_id;
        state
            .messages
            .entry(instance_id)
            .or_default()
            .push_back(InstanceMessage {
                id,
                instance_id,
                kind,
                payload: payload.clone(),
                created_at: Utc::now(),
            });
        Ok(id)
    }

    async fn pop_message(&self, instance_id: Uuid) -> Result<Option<InstanceMessage>> {
        Ok(self
            .state()?
            .messages
            .get_mut(&instance_id)
            .and_then(|queue| queue.pop_front()))
    }

    async fn count_messages(&self, instance_id: Uuid) -> Result<usize> {
        Ok(self
            .state()?
            .messages
            .get(&instance_id)
            .map(|q| q.len())
            .unwrap_or(0))
    }

    async fn add_event_listener(&self, listener: &EventListenerRecord) -> Result<()> {
        self.state()?.listeners.insert(listener.id, listener.clone());
        Ok(())
    }

    async fn delete_event_listeners(&self, instance_id: Uuid) -> Result<()> {
        self.state()?
            .listeners
            .retain(|_, l| l.instance_id != instance_id);
        Ok(())
    }

    async fn list_event_listeners(&self, namespace: &str) -> Result<Vec<EventListenerRecord>> {
        Ok(self
            .state()?
            .listeners
            .values()
            .filter(|l| l.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn get_variable(
        &self,
        scope: VarScope,
        owner: Uuid,
        key: &str,
    ) -> Result<Option<VariableRecord>> {
        Ok(self
            .state()?
            .variables
            .get(&(scope, owner, key.to_string()))
            .cloned())
    }

    async fn set_variable(&self, variable: &VariableRecord) -> Result<()> {
        self.state()?.variables.insert(
            (variable.scope, variable.owner, variable.key.clone()),
            variable.clone(),
        );
        Ok(())
    }

    async fn delete_variable(&self, scope: VarScope, owner: Uuid, key: &str) -> Result<()> {
        self.state()?
            .variables
            .remove(&(scope, owner, key.to_string()));
        Ok(())
    }

    async fn append_instance_log(&self, entry: &InstanceLogEntry) -> Result<()> {
        self.state()?
            .logs
            .entry(entry.instance_id)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn list_instance_logs(&self, instance_id: Uuid) -> Result<Vec<InstanceLogEntry>> {
        Ok(self
            .state()?
            .logs
            .get(&instance_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded() -> (MemoryStore, InstanceRecord) {
        let store = MemoryStore::new();
        let ns = store.create_namespace("test").await.unwrap();
        let rev = store
            .put_workflow(ns.id, "/wf.yaml", "states: []")
            .await
            .unwrap();
        let now = Utc::now();
        let instance = InstanceRecord {
            id: Uuid::new_v4(),
            namespace_id: ns.id,
            namespace: ns.name.clone(),
            workflow_id: rev.workflow_id,
            revision_id: rev.id,
            as_path: "/wf.yaml:latest".into(),
            status: InstanceStatus::Pending,
            error_code: None,
            error_message: None,
            invoker: "api".into(),
            created_at: now,
            updated_at: now,
            ended_at: None,
            input: json!({}),
            output: None,
        };
        let runtime = RuntimeRecord::new(instance.id, "node-a", json!({}), None);
        store.create_instance(&instance, &runtime).await.unwrap();
        (store, instance)
    }

    #[tokio::test]
    async fn test_put_workflow_moves_latest() {
        let store = MemoryStore::new();
        let ns = store.create_namespace("ns").await.unwrap();
        let first = store.put_workflow(ns.id, "/a.yaml", "v1").await.unwrap();
        let second = store.put_workflow(ns.id, "/a.yaml", "v2").await.unwrap();
        assert_eq!(first.workflow_id, second.workflow_id);

        let latest = store
            .get_ref(first.workflow_id, LATEST_REF)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.revision_id, second.id);
        assert!(store.create_namespace("ns").await.is_err());
    }

    #[tokio::test]
    async fn test_messages_are_fifo_and_consumed_once() {
        let (store, instance) = seeded().await;
        store
            .push_message(instance.id, MessageKind::Wake, &json!({"n": 1}))
            .await
            .unwrap();
        store
            .push_message(instance.id, MessageKind::Cancel, &json!({"n": 2}))
            .await
            .unwrap();
        assert_eq!(store.count_messages(instance.id).await.unwrap(), 2);

        let first = store.pop_message(instance.id).await.unwrap().unwrap();
        assert_eq!(first.kind, MessageKind::Wake);
        let second = store.pop_message(instance.id).await.unwrap().unwrap();
        assert_eq!(second.payload, json!({"n": 2}));
        assert!(store.pop_message(instance.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_push_to_unknown_instance_fails() {
        let store = MemoryStore::new();
        let err = store
            .push_message(Uuid::new_v4(), MessageKind::Wake, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DirektivError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stalled_only_lists_pending() {
        let (store, mut instance) = seeded().await;
        let later = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(store.list_stalled(later).await.unwrap().len(), 1);
        assert_eq!(store.list_controlled_by("node-a").await.unwrap().len(), 1);
        assert!(store.list_controlled_by("node-b").await.unwrap().is_empty());

        instance.status = InstanceStatus::Complete;
        store.update_instance(&instance).await.unwrap();
        assert!(store.list_stalled(later).await.unwrap().is_empty());
    }
}
