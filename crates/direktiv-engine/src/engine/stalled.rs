//! Recovery of instances whose controller stopped making progress.

use chrono::Utc;
use serde_json::Value;

use direktiv_core::error::{codes, Result};
use direktiv_core::instance::{CancelPayload, MessageKind, RuntimeRecord, TransitionPayload};
use direktiv_core::timer::{names, TimeoutPayload, TIMEOUT_FUNCTION};

use super::Engine;

impl Engine {
    /// Cron handler: requeue work for instances nobody touched lately.
    pub(crate) async fn sweep_stalled(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let cutoff = Utc::now() - self.inner.config.ownership_timeout();
        match self.inner.store.list_stalled(cutoff).await {
            Ok(stalled) => {
                if !stalled.is_empty() {
                    tracing::info!(count = stalled.len(), "Recovering stalled instances");
                }
                for runtime in stalled {
                    self.recover(runtime).await;
                }
            }
            Err(e) => tracing::warn!(error = %e, "Stalled instance scan failed"),
        }
    }

    /// Bus handler: a replica shut down, take over what it controlled.
    pub(crate) async fn adopt_orphans(&self, hostname: &str) {
        if hostname == self.inner.hostname || self.inner.shutdown.is_cancelled() {
            return;
        }
        match self.inner.store.list_controlled_by(hostname).await {
            Ok(orphans) => {
                tracing::info!(from = %hostname, count = orphans.len(), "Adopting instances of departed replica");
                for runtime in orphans {
                    if let Err(e) = self.claim(&runtime, hostname).await {
                        tracing::warn!(instance = %runtime.instance_id, error = %e, "Failed to claim orphaned instance");
                        continue;
                    }
                    self.recover(runtime).await;
                }
            }
            Err(e) => tracing::warn!(from = %hostname, error = %e, "Failed to list orphaned instances"),
        }
    }

    /// Take control of an instance left behind by `departed`, re-arming the
    /// deadline of its current step here.
    async fn claim(&self, runtime: &RuntimeRecord, departed: &str) -> Result<()> {
        let id = runtime.instance_id;
        let lock = self.inner.locks.lock_instance(id).await?;

        let claimed = self.take_control(id, departed).await;
        self.inner.locks.unlock_instance(lock).await?;
        claimed
    }

    async fn take_control(&self, id: uuid::Uuid, departed: &str) -> Result<()> {
        let Some(mut current) = self.inner.store.get_runtime(id).await? else {
            return Ok(());
        };
        if current.controller != departed {
            return Ok(());
        }
        current.controller = self.inner.hostname.clone();
        current.updated_at = Utc::now();
        self.inner.store.update_runtime(&current).await?;

        let step = current.step();
        if let (Some(deadline), true) = (current.deadline, step > 0) {
            let payload = serde_json::to_value(TimeoutPayload {
                instance_id: id,
                step,
                soft: true,
            })?;
            self.inner.timers.add_one_shot(
                &names::timeout(id, true, step),
                TIMEOUT_FUNCTION,
                deadline,
                payload,
            )?;
        }
        tracing::info!(instance = %id, from = %departed, "Claimed orphaned instance");
        Ok(())
    }

    async fn recover(&self, runtime: RuntimeRecord) {
        let id = runtime.instance_id;
        if let Err(e) = self.requeue(&runtime).await {
            tracing::warn!(instance = %id, error = %e, "Failed to requeue stalled instance");
            return;
        }
        tokio::spawn(self.process_instance_messages(id));
    }

    /// Queue whatever the instance needs to make progress again.
    async fn requeue(&self, runtime: &RuntimeRecord) -> Result<()> {
        let id = runtime.instance_id;
        let store = &self.inner.store;

        if runtime.flow.is_empty() {
            let payload = serde_json::to_value(TransitionPayload {
                state: String::new(),
                attempt: 0,
            })?;
            store.push_message(id, MessageKind::Transition, &payload).await?;
            tracing::debug!(instance = %id, "Queued start of never-started instance");
            return Ok(());
        }

        let overdue = runtime.deadline.map(|d| d < Utc::now()).unwrap_or(false);
        if overdue && store.count_messages(id).await? == 0 {
            let payload: Value = serde_json::to_value(CancelPayload {
                code: codes::SOFT_TIMEOUT.to_string(),
                message: "operation timed out".to_string(),
                soft: true,
                step: runtime.step(),
            })?;
            store.push_message(id, MessageKind::Cancel, &payload).await?;
            tracing::debug!(instance = %id, "Queued timeout of overdue instance");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use direktiv_core::config::EngineConfig;
    use direktiv_core::instance::{InstanceRecord, InstanceStatus};

    use crate::bus::{Bus, MemoryTransport};
    use crate::functions::{FunctionInvoker, FunctionRequest};
    use crate::lock::MemoryAdvisoryLocks;
    use crate::store::{InstanceStore, MemoryStore};

    struct NullInvoker;

    #[async_trait]
    impl FunctionInvoker for NullInvoker {
        async fn invoke(&self, _request: FunctionRequest) -> Result<()> {
            Ok(())
        }

        async fn cancel(&self, _action_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn engine(store: Arc<MemoryStore>) -> Engine {
        let transport = Arc::new(MemoryTransport::new(64));
        Engine::new(
            EngineConfig::default(),
            store,
            Arc::new(MemoryAdvisoryLocks::new()),
            Bus::new("replica-b", transport, 64),
            Arc::new(NullInvoker),
        )
    }

    async fn overdue_instance(store: &MemoryStore) -> RuntimeRecord {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let instance = InstanceRecord {
            id,
            namespace_id: Uuid::new_v4(),
            namespace: "ns".into(),
            workflow_id: Uuid::new_v4(),
            revision_id: Uuid::new_v4(),
            as_path: "/flows/a.yaml:latest".into(),
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
        let mut runtime = RuntimeRecord::new(id, "replica-a", json!({}), None);
        runtime.flow = vec!["call".into(), "handle".into()];
        runtime.deadline = Some(now - chrono::Duration::seconds(5));
        store.create_instance(&instance, &runtime).await.unwrap();
        runtime
    }

    #[tokio::test]
    async fn test_overdue_cancel_targets_current_step() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());
        let runtime = overdue_instance(&store).await;

        engine.requeue(&runtime).await.unwrap();

        let message = store.pop_message(runtime.instance_id).await.unwrap().unwrap();
        assert_eq!(message.kind, MessageKind::Cancel);
        let cancel: CancelPayload = serde_json::from_value(message.payload).unwrap();
        assert_eq!(cancel.step, 2);
        assert!(cancel.soft);
        assert_eq!(cancel.code, codes::SOFT_TIMEOUT);
    }

    #[tokio::test]
    async fn test_overdue_instance_with_queued_work_is_left_alone() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());
        let runtime = overdue_instance(&store).await;
        let id = runtime.instance_id;
        store
            .push_message(id, MessageKind::Wake, &json!({"step": 2}))
            .await
            .unwrap();

        engine.requeue(&runtime).await.unwrap();
        assert_eq!(store.count_messages(id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_never_started_instance_is_queued_for_start() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());
        let mut runtime = overdue_instance(&store).await;
        runtime.flow.clear();

        engine.requeue(&runtime).await.unwrap();

        let message = store.pop_message(runtime.instance_id).await.unwrap().unwrap();
        assert_eq!(message.kind, MessageKind::Transition);
        let start: TransitionPayload = serde_json::from_value(message.payload).unwrap();
        assert!(start.state.is_empty());
    }
}
