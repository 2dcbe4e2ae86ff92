//! In-process cluster for end-to-end engine tests.
//!
//! Replicas share one in-memory store, one lock table and one loopback bus
//! transport, the way production replicas share one Postgres database.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use direktiv_core::catalog::NamespaceRecord;
use direktiv_core::config::EngineConfig;
use direktiv_core::error::{DirektivError, Result};
use direktiv_core::instance::{ActionResultPayload, InstanceRecord};
use direktiv_engine::{
    Bus, Engine, FunctionInvoker, FunctionRequest, InstanceStore, MemoryAdvisoryLocks,
    MemoryStore, MemoryTransport, NewInstanceArgs,
};

/// How long any single wait in a test may take.
pub const WAIT: Duration = Duration::from_secs(10);

pub const NAMESPACE: &str = "tests";

/// Function invoker that records requests instead of running containers.
#[derive(Default)]
pub struct RecordingInvoker {
    requests: Mutex<Vec<FunctionRequest>>,
    cancelled: Mutex<Vec<String>>,
    refuse: AtomicBool,
}

impl RecordingInvoker {
    /// Make every following dispatch fail.
    pub fn refuse_dispatch(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<FunctionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    /// Wait until at least `count` requests were dispatched.
    pub async fn wait_for_requests(&self, count: usize) -> Vec<FunctionRequest> {
        eventually(&format!("{} function requests", count), || async {
            let requests = self.requests();
            (requests.len() >= count).then_some(requests)
        })
        .await
    }
}

#[async_trait]
impl FunctionInvoker for RecordingInvoker {
    async fn invoke(&self, request: FunctionRequest) -> Result<()> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(DirektivError::Cluster("function sidecar unavailable".into()));
        }
        self.requests.lock().unwrap().push(request);
        Ok(())
    }

    async fn cancel(&self, action_id: &str) -> Result<()> {
        self.cancelled.lock().unwrap().push(action_id.to_string());
        Ok(())
    }
}

/// Poll `check` until it yields a value, panicking after [`WAIT`].
pub async fn eventually<T, F, Fut>(what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        soft_timeout: "PT30S".into(),
        hard_timeout: "PT60S".into(),
        lock_timeout_secs: 5,
        default_retry_delay: "PT0.05S".into(),
        ..EngineConfig::default()
    }
}

/// Shared infrastructure of a simulated cluster.
#[derive(Clone)]
pub struct Cluster {
    pub store: Arc<MemoryStore>,
    pub locks: Arc<MemoryAdvisoryLocks>,
    pub transport: Arc<MemoryTransport>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            locks: Arc::new(MemoryAdvisoryLocks::new()),
            transport: Arc::new(MemoryTransport::new(1024)),
        }
    }

    /// Boot a replica named `hostname`.
    pub async fn replica(&self, hostname: &str, invoker: Arc<RecordingInvoker>) -> Engine {
        self.replica_with_config(hostname, invoker, test_config()).await
    }

    pub async fn replica_with_config(
        &self,
        hostname: &str,
        invoker: Arc<RecordingInvoker>,
        config: EngineConfig,
    ) -> Engine {
        let engine = Engine::new(
            config,
            self.store.clone(),
            self.locks.clone(),
            Bus::new(hostname, self.transport.clone(), 1024),
            invoker,
        );
        engine.boot().await.unwrap();
        engine
    }
}

/// One booted replica with a namespace to deploy workflows into.
pub struct Harness {
    pub cluster: Cluster,
    pub engine: Engine,
    pub invoker: Arc<RecordingInvoker>,
    pub namespace: NamespaceRecord,
}

impl Harness {
    pub async fn new() -> Self {
        let cluster = Cluster::new();
        let invoker = Arc::new(RecordingInvoker::default());
        let engine = cluster.replica("replica-a", invoker.clone()).await;
        let namespace = cluster.store.create_namespace(NAMESPACE).await.unwrap();
        Self {
            cluster,
            engine,
            invoker,
            namespace,
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.cluster.store
    }

    /// Store a workflow revision and point `latest` at it.
    pub async fn deploy(&self, path: &str, yaml: &str) -> Uuid {
        self.store()
            .put_workflow(self.namespace.id, path, yaml)
            .await
            .unwrap()
            .id
    }

    pub async fn start(&self, path: &str, input: Value) -> Uuid {
        self.engine
            .submit(NewInstanceArgs {
                namespace: NAMESPACE.into(),
                path: path.into(),
                input,
                invoker: "test".into(),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    pub async fn finish(&self, id: Uuid) -> InstanceRecord {
        self.engine.wait_for_instance(id, WAIT).await.unwrap()
    }

    /// Start an instance and wait for it to end.
    pub async fn run(&self, path: &str, input: Value) -> InstanceRecord {
        let id = self.start(path, input).await;
        self.finish(id).await
    }

    /// Report a successful result for a dispatched function.
    pub async fn respond(&self, request: &FunctionRequest, output: Value) {
        self.engine
            .report_action_result(
                request.instance_id,
                ActionResultPayload {
                    action_id: request.action_id.clone(),
                    output,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    /// Report a failed result for a dispatched function.
    pub async fn fail(&self, request: &FunctionRequest, code: Option<&str>, message: &str) {
        self.engine
            .report_action_result(
                request.instance_id,
                ActionResultPayload {
                    action_id: request.action_id.clone(),
                    error_code: code.map(str::to_string),
                    error_message: Some(message.to_string()),
                    output: Value::Null,
                },
            )
            .await
            .unwrap();
    }

    /// Wait until the instance listens for events.
    pub async fn wait_for_listener(&self, id: Uuid) {
        eventually("event listener", || async {
            let listeners = self.store().list_event_listeners(NAMESPACE).await.unwrap();
            listeners.iter().any(|l| l.instance_id == id).then_some(())
        })
        .await
    }

    /// Wait until the instance has entered `state`.
    pub async fn wait_for_state(&self, id: Uuid, state: &str) {
        eventually(&format!("state '{}'", state), || async {
            let runtime = self.store().get_runtime(id).await.unwrap()?;
            (runtime.current_state() == Some(state)).then_some(())
        })
        .await
    }
}
