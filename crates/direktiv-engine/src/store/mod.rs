//! Instance Store: the persistence boundary of the engine.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use direktiv_core::catalog::{
    NamespaceRecord, RefRecord, RevisionRecord, RouteRecord, WorkflowRecord,
};
use direktiv_core::error::Result;
use direktiv_core::instance::{
    EventListenerRecord, InstanceLogEntry, InstanceMessage, InstanceRecord, MessageKind,
    RuntimeRecord, VariableRecord,
};
use direktiv_core::model::VarScope;

/// Durable storage of namespaces, workflows, instances and their mailboxes.
#[async_trait]
pub trait InstanceStore: Send + Sync + 'static {
    async fn create_namespace(&self, name: &str) -> Result<NamespaceRecord>;
    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceRecord>>;

    /// Store a new revision of a workflow, creating the workflow if needed,
    /// and point the `latest` ref at it.
    async fn put_workflow(
        &self,
        namespace_id: Uuid,
        path: &str,
        source: &str,
    ) -> Result<RevisionRecord>;
    async fn get_workflow(&self, namespace_id: Uuid, path: &str) -> Result<Option<WorkflowRecord>>;
    async fn set_ref(&self, workflow_id: Uuid, name: &str, revision_id: Uuid) -> Result<()>;
    async fn get_ref(&self, workflow_id: Uuid, name: &str) -> Result<Option<RefRecord>>;
    async fn get_revision(&self, id: Uuid) -> Result<Option<RevisionRecord>>;
    /// Replace the routes of a workflow.
    async fn set_routes(&self, workflow_id: Uuid, routes: &[RouteRecord]) -> Result<()>;
    async fn list_routes(&self, workflow_id: Uuid) -> Result<Vec<RouteRecord>>;

    async fn create_instance(&self, instance: &InstanceRecord, runtime: &RuntimeRecord)
        -> Result<()>;
    async fn get_instance(&self, id: Uuid) -> Result<Option<InstanceRecord>>;
    async fn update_instance(&self, instance: &InstanceRecord) -> Result<()>;
    async fn get_runtime(&self, id: Uuid) -> Result<Option<RuntimeRecord>>;
    async fn update_runtime(&self, runtime: &RuntimeRecord) -> Result<()>;
    /// Runtimes of pending instances not touched since `updated_before`.
    async fn list_stalled(&self, updated_before: DateTime<Utc>) -> Result<Vec<RuntimeRecord>>;
    /// Runtimes of pending instances owned by `controller`.
    async fn list_controlled_by(&self, controller: &str) -> Result<Vec<RuntimeRecord>>;

    /// Append a message to an instance mailbox.
    async fn push_message(&self, instance_id: Uuid, kind: MessageKind, payload: &Value)
        -> Result<i64>;
    /// Remove and return the oldest message, skipping messages claimed elsewhere.
    async fn pop_message(&self, instance_id: Uuid) -> Result<Option<InstanceMessage>>;
    async fn count_messages(&self, instance_id: Uuid) -> Result<usize>;

    async fn add_event_listener(&self, listener: &EventListenerRecord) -> Result<()>;
    async fn delete_event_listeners(&self, instance_id: Uuid) -> Result<()>;
    async fn list_event_listeners(&self, namespace: &str) -> Result<Vec<EventListenerRecord>>;

    async fn get_variable(
        &self,
        scope: VarScope,
        owner: Uuid,
        key: &str,
    ) -> Result<Option<VariableRecord>>;
    async fn set_variable(&self, variable: &VariableRecord) -> Result<()>;
    async fn delete_variable(&self, scope: VarScope, owner: Uuid, key: &str) -> Result<()>;

    async fn append_instance_log(&self, entry: &InstanceLogEntry) -> Result<()>;
    async fn list_instance_logs(&self, instance_id: Uuid) -> Result<Vec<InstanceLogEntry>>;
}

/// Hex sha256 of a workflow source.
pub fn source_hash(source: &str) -> String {
    format!("{:x}", Sha256::digest(source.as_bytes()))
}
