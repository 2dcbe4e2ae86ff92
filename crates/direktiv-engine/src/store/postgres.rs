//! PostgreSQL Instance Store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use direktiv_core::catalog::{
    NamespaceRecord, RefRecord, RevisionRecord, RouteRecord, WorkflowRecord, LATEST_REF,
};
use direktiv_core::error::{DirektivError, Result};
use direktiv_core::instance::{
    CallerData, EventFilter, EventListenerRecord, InstanceLogEntry, InstanceMessage,
    InstanceRecord, MessageKind, RuntimeRecord, VariableRecord,
};
use direktiv_core::model::VarScope;

use super::{source_hash, InstanceStore};

const INSTANCE_COLUMNS: &str = "id, namespace_id, namespace, workflow_id, revision_id, as_path, \
     status, error_code, error_message, invoker, created_at, updated_at, ended_at, input, output";

const RUNTIME_COLUMNS: &str = "instance_id, controller, flow, state_begin_time, attempts, \
     memory, data, deadline, caller, updated_at";

/// Instance Store backed by the `direktiv_*` tables.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn instance_from_row(row: &PgRow) -> Result<InstanceRecord> {
        let status: String = row.get("status");
        Ok(InstanceRecord {
            id: row.get("id"),
            namespace_id: row.get("namespace_id"),
            namespace: row.get("namespace"),
            workflow_id: row.get("workflow_id"),
            revision_id: row.get("revision_id"),
            as_path: row.get("as_path"),
            status: status.parse().map_err(DirektivError::Database)?,
            error_code: row.get("error_code"),
            error_message: row.get("error_message"),
            invoker: row.get("invoker"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            ended_at: row.get("ended_at"),
            input: row.get("input"),
            output: row.get("output"),
        })
    }

    fn runtime_from_row(row: &PgRow) -> Result<RuntimeRecord> {
        let flow: Value = row.get("flow");
        let caller: Option<Value> = row.get("caller");
        let attempts: i32 = row.get("attempts");
        Ok(RuntimeRecord {
            instance_id: row.get("instance_id"),
            controller: row.get("controller"),
            flow: serde_json::from_value(flow)?,
            state_begin_time: row.get("state_begin_time"),
            attempts: attempts.max(0) as u32,
            memory: row.get("memory"),
            data: row.get("data"),
            deadline: row.get("deadline"),
            caller: caller
                .map(serde_json::from_value::<CallerData>)
                .transpose()?,
            updated_at: row.get("updated_at"),
        })
    }

    fn listener_from_row(row: &PgRow) -> Result<EventListenerRecord> {
        let filters: Value = row.get("filters");
        let step: i32 = row.get("step");
        Ok(EventListenerRecord {
            id: row.get("id"),
            namespace: row.get("namespace"),
            instance_id: row.get("instance_id"),
            step: step.max(0) as usize,
            filters: serde_json::from_value::<Vec<EventFilter>>(filters)?,
            created_at: row.get("created_at"),
        })
    }

    async fn runtimes_where(&self, clause: &str, bind: RuntimeFilter<'_>) -> Result<Vec<RuntimeRecord>> {
        let sql = format!(
            "SELECT {} FROM direktiv_runtimes r \
             JOIN direktiv_instances i ON i.id = r.instance_id \
             WHERE i.status = 'pending' AND {}",
            RUNTIME_COLUMNS
                .split(", ")
                .map(|c| format!("r.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", "),
            clause
        );
        let query = sqlx::query(&sql);
        let query = match bind {
            RuntimeFilter::Before(t) => query.bind(t),
            RuntimeFilter::Controller(c) => query.bind(c),
        };
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::runtime_from_row).collect()
    }
}

enum RuntimeFilter<'a> {
    Before(DateTime<Utc>),
    Controller(&'a str),
}

#[async_trait]
impl InstanceStore for PgStore {
    async fn create_namespace(&self, name: &str) -> Result<NamespaceRecord> {
        let row = sqlx::query(
            "INSERT INTO direktiv_namespaces (id, name) VALUES ($1, $2) RETURNING id, name, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(NamespaceRecord {
            id: row.get("id"),
            name: row.get("name"),
            created_at: row.get("created_at"),
        })
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceRecord>> {
        let row = sqlx::query("SELECT id, name, created_at FROM direktiv_namespaces WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| NamespaceRecord {
            id: row.get("id"),
            name: row.get("name"),
            created_at: row.get("created_at"),
        }))
    }

    async fn put_workflow(
        &self,
        namespace_id: Uuid,
        path: &str,
        source: &str,
    ) -> Result<RevisionRecord> {
        let mut tx = self.pool.begin().await?;

        let workflow_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO direktiv_workflows (id, namespace_id, path)
            VALUES ($1, $2, $3)
            ON CONFLICT (namespace_id, path) DO UPDATE SET path = EXCLUDED.path
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(namespace_id)
        .bind(path)
        .fetch_one(&mut *tx)
        .await?;

        let row = sqlx::query(
            r#"
            INSERT INTO direktiv_revisions (id, workflow_id, source, hash)
            VALUES ($1, $2, $3, $4)
            RETURNING id, workflow_id, source, hash, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(workflow_id)
        .bind(source)
        .bind(source_hash(source))
        .fetch_one(&mut *tx)
        .await?;

        let revision = RevisionRecord {
            id: row.get("id"),
            workflow_id: row.get("workflow_id"),
            source: row.get("source"),
            hash: row.get("hash"),
            created_at: row.get("created_at"),
        };

        sqlx::query(
            r#"
            INSERT INTO direktiv_refs (workflow_id, name, revision_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (workflow_id, name) DO UPDATE SET revision_id = EXCLUDED.revision_id
            "#,
        )
        .bind(workflow_id)
        .bind(LATEST_REF)
        .bind(revision.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(revision)
    }

    async fn get_workflow(&self, namespace_id: Uuid, path: &str) -> Result<Option<WorkflowRecord>> {
        let row = sqlx::query(
            "SELECT id, namespace_id, path, created_at FROM direktiv_workflows \
             WHERE namespace_id = $1 AND path = $2",
        )
        .bind(namespace_id)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| WorkflowRecord {
            id: row.get("id"),
            namespace_id: row.get("namespace_id"),
            path: row.get("path"),
            created_at: row.get("created_at"),
        }))
    }

    async fn set_ref(&self, workflow_id: Uuid, name: &str, revision_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO direktiv_refs (workflow_id, name, revision_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (workflow_id, name) DO UPDATE SET revision_id = EXCLUDED.revision_id
            "#,
        )
        .bind(workflow_id)
        .bind(name)
        .bind(revision_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_ref(&self, workflow_id: Uuid, name: &str) -> Result<Option<RefRecord>> {
        let row = sqlx::query(
            "SELECT workflow_id, name, revision_id FROM direktiv_refs \
             WHERE workflow_id = $1 AND name = $2",
        )
        .bind(workflow_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| RefRecord {
            workflow_id: row.get("workflow_id"),
            name: row.get("name"),
            revision_id: row.get("revision_id"),
        }))
    }

    async fn get_revision(&self, id: Uuid) -> Result<Option<RevisionRecord>> {
        let row = sqlx::query(
            "SELECT id, workflow_id, source, hash, created_at FROM direktiv_revisions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| RevisionRecord {
            id: row.get("id"),
            workflow_id: row.get("workflow_id"),
            source: row.get("source"),
            hash: row.get("hash"),
            created_at: row.get("created_at"),
        }))
    }

    async fn set_routes(&self, workflow_id: Uuid, routes: &[RouteRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM direktiv_routes WHERE workflow_id = $1")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;
        for route in routes {
            sqlx::query(
                "INSERT INTO direktiv_routes (workflow_id, ref_name, weight) VALUES ($1, $2, $3)",
            )
            .bind(workflow_id)
            .bind(&route.ref_name)
            .bind(route.weight as i32)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_routes(&self, workflow_id: Uuid) -> Result<Vec<RouteRecord>> {
        let rows = sqlx::query(
            "SELECT workflow_id, ref_name, weight FROM direktiv_routes \
             WHERE workflow_id = $1 ORDER BY ref_name",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let weight: i32 = row.get("weight");
                RouteRecord {
                    workflow_id: row.get("workflow_id"),
                    ref_name: row.get("ref_name"),
                    weight: weight.max(0) as u32,
                }
            })
            .collect())
    }

    async fn create_instance(
        &self,
        instance: &InstanceRecord,
        runtime: &RuntimeRecord,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO direktiv_instances ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
            INSTANCE_COLUMNS
        ))
        .bind(instance.id)
        .bind(instance.namespace_id)
        .bind(&instance.namespace)
        .bind(instance.workflow_id)
        .bind(instance.revision_id)
        .bind(&instance.as_path)
        .bind(instance.status.as_str())
        .bind(&instance.error_code)
        .bind(&instance.error_message)
        .bind(&instance.invoker)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .bind(instance.ended_at)
        .bind(&instance.input)
        .bind(&instance.output)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "INSERT INTO direktiv_runtimes ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            RUNTIME_COLUMNS
        ))
        .bind(runtime.instance_id)
        .bind(&runtime.controller)
        .bind(serde_json::to_value(&runtime.flow)?)
        .bind(runtime.state_begin_time)
        .bind(runtime.attempts as i32)
        .bind(&runtime.memory)
        .bind(&runtime.data)
        .bind(runtime.deadline)
        .bind(runtime.caller.as_ref().map(serde_json::to_value).transpose()?)
        .bind(runtime.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<InstanceRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM direktiv_instances WHERE id = $1",
            INSTANCE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::instance_from_row).transpose()
    }

    async fn update_instance(&self, instance: &InstanceRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE direktiv_instances
            SET status = $2, error_code = $3, error_message = $4,
                updated_at = $5, ended_at = $6, output = $7
            WHERE id = $1
            "#,
        )
        .bind(instance.id)
        .bind(instance.status.as_str())
        .bind(&instance.error_code)
        .bind(&instance.error_message)
        .bind(instance.updated_at)
        .bind(instance.ended_at)
        .bind(&instance.output)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DirektivError::NotFound(format!("instance {}", instance.id)));
        }
        Ok(())
    }

    async fn get_runtime(&self, id: Uuid) -> Result<Option<RuntimeRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM direktiv_runtimes WHERE instance_id = $1",
            RUNTIME_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::runtime_from_row).transpose()
    }

    async fn update_runtime(&self, runtime: &RuntimeRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE direktiv_runtimes
            SET controller = $2, flow = $3, state_begin_time = $4, attempts = $5,
                memory = $6, data = $7, deadline = $8, caller = $9, updated_at = $10
            WHERE instance_id = $1
            "#,
        )
        .bind(runtime.instance_id)
        .bind(&runtime.controller)
        .bind(serde_json::to_value(&runtime.flow)?)
        .bind(runtime.state_begin_time)
        .bind(runtime.attempts as i32)
        .bind(&runtime.memory)
        .bind(&runtime.data)
        .bind(runtime.deadline)
        .bind(runtime.caller.as_ref().map(serde_json::to_value).transpose()?)
        .bind(runtime.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DirektivError::NotFound(format!(
                "runtime of instance {}",
                runtime.instance_id
            )));
        }
        Ok(())
    }

    async fn list_stalled(&self, updated_before: DateTime<Utc>) -> Result<Vec<RuntimeRecord>> {
        self.runtimes_where("r.updated_at < $1", RuntimeFilter::Before(updated_before))
            .await
    }

    async fn list_controlled_by(&self, controller: &str) -> Result<Vec<RuntimeRecord>> {
        self.runtimes_where("r.controller = $1", RuntimeFilter::Controller(controller))
            .await
    }

    async fn push_message(
        &self,
        instance_id: Uuid,
        kind: MessageKind,
        payload: &Value,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM direktiv_instances WHERE id = $1 FOR SHARE")
                .bind(instance_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(DirektivError::NotFound(format!("instance {}", instance_id)));
        }

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO direktiv_instance_messages (instance_id, kind, payload) \
             VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(instance_id)
        .bind(kind.as_str())
        .bind(payload)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(id)
    }

    async fn pop_message(&self, instance_id: Uuid) -> Result<Option<InstanceMessage>> {
        let row = sqlx::query(
            r#"
            DELETE FROM direktiv_instance_messages
            WHERE id = (
                SELECT id FROM direktiv_instance_messages
                WHERE instance_id = $1
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, instance_id, kind, payload, created_at
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let kind: String = row.get("kind");
                Ok(Some(InstanceMessage {
                    id: row.get("id"),
                    instance_id: row.get("instance_id"),
                    kind: kind.parse().map_err(DirektivError::Database)?,
                    payload: row.get("payload"),
                    created_at: row.get("created_at"),
                }))
            }
            None => Ok(None),
        }
    }

    async fn count_messages(&self, instance_id: Uuid) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM direktiv_instance_messages WHERE instance_id = $1",
        )
        .bind(instance_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }

    async fn add_event_listener(&self, listener: &EventListenerRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO direktiv_event_listeners (id, namespace, instance_id, step, filters, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(listener.id)
        .bind(&listener.namespace)
        .bind(listener.instance_id)
        .bind(listener.step as i32)
        .bind(serde_json::to_value(&listener.filters)?)
        .bind(listener.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_event_listeners(&self, instance_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM direktiv_event_listeners WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_event_listeners(&self, namespace: &str) -> Result<Vec<EventListenerRecord>> {
        let rows = sqlx::query(
            "SELECT id, namespace, instance_id, step, filters, created_at \
             FROM direktiv_event_listeners WHERE namespace = $1 ORDER BY created_at",
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::listener_from_row).collect()
    }

    async fn get_variable(
        &self,
        scope: VarScope,
        owner: Uuid,
        key: &str,
    ) -> Result<Option<VariableRecord>> {
        let row = sqlx::query(
            "SELECT mime_type, data, updated_at FROM direktiv_variables \
             WHERE scope = $1 AND owner = $2 AND key = $3",
        )
        .bind(scope.as_str())
        .bind(owner)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| VariableRecord {
            scope,
            owner,
            key: key.to_string(),
            mime_type: row.get("mime_type"),
            data: row.get("data"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn set_variable(&self, variable: &VariableRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO direktiv_variables (scope, owner, key, mime_type, data, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (scope, owner, key) DO UPDATE SET
                mime_type = EXCLUDED.mime_type,
                data = EXCLUDED.data,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(variable.scope.as_str())
        .bind(variable.owner)
        .bind(&variable.key)
        .bind(&variable.mime_type)
        .bind(&variable.data)
        .bind(variable.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_variable(&self, scope: VarScope, owner: Uuid, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM direktiv_variables WHERE scope = $1 AND owner = $2 AND key = $3")
            .bind(scope.as_str())
            .bind(owner)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_instance_log(&self, entry: &InstanceLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO direktiv_instance_logs (instance_id, time, level, message) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(entry.instance_id)
        .bind(entry.time)
        .bind(&entry.level)
        .bind(&entry.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_instance_logs(&self, instance_id: Uuid) -> Result<Vec<InstanceLogEntry>> {
        let rows = sqlx::query(
            "SELECT instance_id, time, level, message FROM direktiv_instance_logs \
             WHERE instance_id = $1 ORDER BY id",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| InstanceLogEntry {
                instance_id: row.get("instance_id"),
                time: row.get("time"),
                level: row.get("level"),
                message: row.get("message"),
            })
            .collect())
    }
}
