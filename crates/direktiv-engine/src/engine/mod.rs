//! The Engine: loads and locks instances, runs their state logic and persists
//! the outcome.
//!
//! Every mutation happens inside one lock → load → run → persist → unlock
//! section. Work that talks to the outside world (function calls, child
//! instances, parent wake-ups, event delivery) is deferred on the
//! [`InstanceMemory`] and flushed after the lock is released.

mod memory;
mod queue;
mod routing;
mod runtime;
mod stalled;
mod transition;

pub use memory::InstanceMemory;
pub(crate) use memory::Deferred;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use direktiv_core::catalog::{normalize_path, split_ref, RouteRecord};
use direktiv_core::config::EngineConfig;
use direktiv_core::error::{codes, DirektivError, Result};
use direktiv_core::instance::{
    ActionResultPayload, CallerData, CancelPayload, CloudEvent, EventPayload, InstanceRecord,
    InstanceStatus, MessageKind, RuntimeRecord,
};
use direktiv_core::model::CompiledWorkflow;
use direktiv_core::timer::{
    TimeoutPayload, WakePayload, SEND_EVENT_FUNCTION, SLEEP_WAKEUP_FUNCTION,
    STALLED_INSTANCES_FUNCTION, TIMEOUT_FUNCTION,
};

use crate::bus::{handlers, Bus, Envelope};
use crate::functions::FunctionInvoker;
use crate::lock::{AdvisoryLocks, LockManager};
use crate::states;
use crate::store::InstanceStore;
use crate::timers::TimerService;

use transition::Step;

/// Name of the cron timer driving the stalled-instance sweep.
const STALLED_TIMER: &str = "stalled-instances";

/// Arguments of [`Engine::new_instance`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewInstanceArgs {
    pub namespace: String,
    /// Workflow path, optionally suffixed with `:ref`.
    pub path: String,
    /// Explicit ref; overrides a suffix on `path` and routing.
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default = "default_invoker")]
    pub invoker: String,
    #[serde(skip)]
    pub caller: Option<CallerData>,
}

fn default_invoker() -> String {
    "api".to_string()
}

/// Payload of delayed event timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DelayedEvent {
    namespace: String,
    event: CloudEvent,
}

/// Handle to the engine of this replica.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    config: EngineConfig,
    hostname: String,
    store: Arc<dyn InstanceStore>,
    locks: LockManager,
    timers: TimerService,
    bus: Bus,
    invoker: Arc<dyn FunctionInvoker>,
    routes: Mutex<HashMap<Uuid, Vec<RouteRecord>>>,
    workflows: Mutex<HashMap<Uuid, Arc<CompiledWorkflow>>>,
    shutdown: CancellationToken,
}

impl Engine {
    /// Wire an engine and register its timer functions and bus handlers.
    ///
    /// Call [`Engine::boot`] to start the bus and the background sweeps.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn InstanceStore>,
        locks: Arc<dyn AdvisoryLocks>,
        bus: Bus,
        invoker: Arc<dyn FunctionInvoker>,
    ) -> Self {
        let timers = TimerService::new(bus.clone());
        let engine = Self {
            inner: Arc::new(EngineInner {
                hostname: bus.hostname().to_string(),
                locks: LockManager::new(locks, config.lock_timeout()),
                config,
                store,
                timers,
                bus,
                invoker,
                routes: Mutex::new(HashMap::new()),
                workflows: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        };
        engine.register_timer_functions();
        engine.register_bus_handlers();
        engine
    }

    fn from_weak(weak: &Weak<EngineInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn register_timer_functions(&self) {
        let timers = &self.inner.timers;

        let weak = Arc::downgrade(&self.inner);
        timers.register_function(TIMEOUT_FUNCTION, move |payload: Value| {
            let engine = Self::from_weak(&weak);
            async move {
                if let Some(engine) = engine {
                    engine.timeout_fired(payload).await;
                }
            }
        });

        let weak = Arc::downgrade(&self.inner);
        timers.register_function(SLEEP_WAKEUP_FUNCTION, move |payload: Value| {
            let engine = Self::from_weak(&weak);
            async move {
                let Some(engine) = engine else { return };
                match serde_json::from_value::<WakePayload>(payload.clone()) {
                    Ok(wake) => {
                        if let Err(e) = engine
                            .enqueue_instance_message(wake.instance_id, MessageKind::Wake, payload)
                            .await
                        {
                            tracing::warn!(instance = %wake.instance_id, error = %e, "Failed to deliver wake-up");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Invalid wake-up payload"),
                }
            }
        });

        let weak = Arc::downgrade(&self.inner);
        timers.register_function(SEND_EVENT_FUNCTION, move |payload: Value| {
            let engine = Self::from_weak(&weak);
            async move {
                let Some(engine) = engine else { return };
                match serde_json::from_value::<DelayedEvent>(payload) {
                    Ok(delayed) => {
                        if let Err(e) = engine.broadcast_event(&delayed.namespace, delayed.event).await {
                            tracing::warn!(error = %e, "Failed to deliver delayed event");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Invalid delayed event payload"),
                }
            }
        });

        let weak = Arc::downgrade(&self.inner);
        timers.register_function(STALLED_INSTANCES_FUNCTION, move |_payload: Value| {
            let engine = Self::from_weak(&weak);
            async move {
                if let Some(engine) = engine {
                    engine.sweep_stalled().await;
                }
            }
        });
    }

    fn register_bus_handlers(&self) {
        let bus = &self.inner.bus;

        let weak = Arc::downgrade(&self.inner);
        bus.register(handlers::DISCONNECT, move |envelope: Envelope| {
            let engine = Self::from_weak(&weak);
            async move {
                if let Some(engine) = engine {
                    engine.adopt_orphans(&envelope.key).await;
                }
            }
        });

        let weak = Arc::downgrade(&self.inner);
        bus.register(handlers::CANCEL_WORKFLOW, move |envelope: Envelope| {
            let engine = Self::from_weak(&weak);
            async move {
                let Some(engine) = engine else { return };
                match Uuid::parse_str(&envelope.key) {
                    Ok(id) => {
                        if engine.inner.locks.cancel_instance(id) {
                            tracing::info!(instance = %id, sender = %envelope.sender, "Interrupted instance on request");
                        }
                    }
                    Err(_) => tracing::warn!(key = %envelope.key, "Invalid instance id"),
                }
            }
        });

        let weak = Arc::downgrade(&self.inner);
        bus.register(handlers::CONFIGURE_ROUTER, move |envelope: Envelope| {
            let engine = Self::from_weak(&weak);
            async move {
                let Some(engine) = engine else { return };
                match Uuid::parse_str(&envelope.key) {
                    Ok(id) => engine.invalidate_routes(id),
                    Err(_) => tracing::warn!(key = %envelope.key, "Invalid workflow id"),
                }
            }
        });

        let weak = Arc::downgrade(&self.inner);
        bus.register(handlers::INSTANCE_MESSAGE, move |envelope: Envelope| {
            let engine = Self::from_weak(&weak);
            async move {
                if let Some(engine) = engine {
                    engine.ownership_asserted(&envelope.key).await;
                }
            }
        });
    }

    /// Start the bus and schedule the stalled-instance sweep.
    pub async fn boot(&self) -> Result<()> {
        self.inner.bus.start().await?;
        self.inner.timers.add_cron(
            STALLED_TIMER,
            STALLED_INSTANCES_FUNCTION,
            &self.inner.config.stalled_scan_cron,
            Value::Null,
        )?;
        tracing::info!(hostname = %self.inner.hostname, "Engine started");
        Ok(())
    }

    /// Stop timers and the bus, telling other replicas to adopt our instances.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.bus.publish(handlers::DISCONNECT, &self.inner.hostname);
        // Give the outbound loop a moment to flush the disconnect.
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.inner.timers.stop();
        self.inner.bus.stop();
        tracing::info!(hostname = %self.inner.hostname, "Engine stopped");
    }

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.inner.store
    }

    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    pub fn timers(&self) -> &TimerService {
        &self.inner.timers
    }

    /// Resolve a workflow and create a new pending instance of it.
    pub async fn new_instance(&self, args: NewInstanceArgs) -> Result<InstanceMemory> {
        let store = &self.inner.store;

        let namespace = store
            .get_namespace(&args.namespace)
            .await?
            .ok_or_else(|| DirektivError::NotFound(format!("namespace '{}'", args.namespace)))?;

        let (path, suffix) = split_ref(&args.path);
        let path = normalize_path(path);
        let workflow = store
            .get_workflow(namespace.id, &path)
            .await?
            .ok_or_else(|| DirektivError::NotFound(format!("workflow '{}'", path)))?;

        let ref_name = match args.reference.as_deref().or(suffix) {
            Some(name) => name.to_string(),
            None => self.pick_route(workflow.id).await?,
        };
        let reference = store
            .get_ref(workflow.id, &ref_name)
            .await?
            .ok_or_else(|| DirektivError::NotFound(format!("ref '{}' of '{}'", ref_name, path)))?;
        let compiled = self.compiled_workflow(reference.revision_id).await?;

        let data = match args.input {
            Value::Object(map) => Value::Object(map),
            Value::Null => Value::Object(Map::new()),
            other => json!({ "input": other }),
        };

        let now = chrono::Utc::now();
        let id = Uuid::new_v4();
        let instance = InstanceRecord {
            id,
            namespace_id: namespace.id,
            namespace: namespace.name.clone(),
            workflow_id: workflow.id,
            revision_id: reference.revision_id,
            as_path: format!("{}:{}", path, ref_name),
            status: InstanceStatus::Pending,
            error_code: None,
            error_message: None,
            invoker: args.invoker,
            created_at: now,
            updated_at: now,
            ended_at: None,
            input: data.clone(),
            output: None,
        };
        let runtime = RuntimeRecord::new(id, &self.inner.hostname, data, args.caller);
        store.create_instance(&instance, &runtime).await?;

        tracing::info!(
            instance = %id,
            namespace = %instance.namespace,
            workflow = %instance.as_path,
            invoker = %instance.invoker,
            "Instance created"
        );
        Ok(InstanceMemory::new(instance, runtime, compiled))
    }

    /// Lock a fresh instance and run it from its start state.
    ///
    /// Lock failures leave the instance pending for a later takeover.
    pub fn start(&self, mut im: InstanceMemory) -> BoxFuture<'static, ()> {
        let engine = self.clone();
        async move {
            let id = im.id();
            match engine.inner.locks.lock_instance(id).await {
                Ok(lock) => im.lock = Some(lock),
                Err(e) => {
                    tracing::error!(instance = %id, error = %e, "Failed to lock new instance");
                    return;
                }
            }

            let start = im.workflow().start_state().to_string();
            engine
                .drive(&mut im, Step::Transition { state: start, attempt: 0 })
                .await;
            engine.release(&mut im).await;
            engine.drain_if_pending(id).await;
        }
        .boxed()
    }

    /// Create an instance and start it in the background.
    pub async fn submit(&self, args: NewInstanceArgs) -> Result<Uuid> {
        let im = self.new_instance(args).await?;
        let id = im.id();
        tokio::spawn(self.start(im));
        Ok(id)
    }

    /// Hard-cancel an instance on behalf of an API caller.
    pub async fn cancel_instance(&self, id: Uuid) -> Result<()> {
        let payload = CancelPayload {
            code: codes::CANCELLED_API.to_string(),
            message: "cancelled by api request".to_string(),
            soft: false,
            step: 0,
        };
        self.enqueue_instance_message(id, MessageKind::Cancel, serde_json::to_value(&payload)?)
            .await?;
        self.interrupt(id);
        Ok(())
    }

    /// Interrupt whoever holds the instance lock, here or elsewhere.
    fn interrupt(&self, id: Uuid) {
        self.inner.locks.cancel_instance(id);
        self.inner
            .bus
            .publish(handlers::CANCEL_WORKFLOW, &id.to_string());
    }

    /// Deliver the outcome of a function call.
    pub async fn report_action_result(&self, id: Uuid, results: ActionResultPayload) -> Result<()> {
        self.enqueue_instance_message(id, MessageKind::Action, serde_json::to_value(&results)?)
            .await
    }

    /// Hand an event to every instance of `namespace` listening for it.
    ///
    /// Returns the number of instances notified.
    pub async fn broadcast_event(&self, namespace: &str, event: CloudEvent) -> Result<usize> {
        let listeners = self.inner.store.list_event_listeners(namespace).await?;
        let mut delivered = 0;
        for listener in listeners.iter().filter(|l| l.matches(&event)) {
            let payload = serde_json::to_value(EventPayload {
                step: listener.step,
                event: event.clone(),
            })?;
            match self
                .enqueue_instance_message(listener.instance_id, MessageKind::Event, payload)
                .await
            {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(instance = %listener.instance_id, error = %e, "Failed to deliver event")
                }
            }
        }
        tracing::debug!(namespace, event_type = %event.event_type, delivered, "Event broadcast");
        Ok(delivered)
    }

    /// Wait until an instance is terminal, re-querying on every notification.
    pub async fn wait_for_instance(&self, id: Uuid, timeout: Duration) -> Result<InstanceRecord> {
        let subscription = self.inner.bus.subscribe([id.to_string()]);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let instance = self
                .inner
                .store
                .get_instance(id)
                .await?
                .ok_or_else(|| DirektivError::NotFound(format!("instance {}", id)))?;
            if instance.status.is_terminal() {
                return Ok(instance);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(DirektivError::Timeout(format!(
                    "instance {} still {} after {:?}",
                    id, instance.status, timeout
                )));
            }
            let poll = (deadline - now).min(Duration::from_secs(1));
            tokio::select! {
                _ = subscription.wait() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Workflow of a revision, compiled once per replica.
    async fn compiled_workflow(&self, revision_id: Uuid) -> Result<Arc<CompiledWorkflow>> {
        if let Some(compiled) = self
            .inner
            .workflows
            .lock()
            .map_err(|_| DirektivError::internal("workflow cache poisoned"))?
            .get(&revision_id)
        {
            return Ok(compiled.clone());
        }

        let revision = self
            .inner
            .store
            .get_revision(revision_id)
            .await?
            .ok_or_else(|| DirektivError::NotFound(format!("revision {}", revision_id)))?;
        let compiled = Arc::new(CompiledWorkflow::from_yaml(&revision.source)?);

        self.inner
            .workflows
            .lock()
            .map_err(|_| DirektivError::internal("workflow cache poisoned"))?
            .insert(revision_id, compiled.clone());
        Ok(compiled)
    }

    /// Load the memory of an instance, resolving the logic of its current state.
    async fn load(&self, id: Uuid) -> Result<InstanceMemory> {
        let store = &self.inner.store;
        let instance = store
            .get_instance(id)
            .await?
            .ok_or_else(|| DirektivError::NotFound(format!("instance {}", id)))?;
        let runtime = store
            .get_runtime(id)
            .await?
            .ok_or_else(|| DirektivError::NotFound(format!("runtime of instance {}", id)))?;
        let workflow = self.compiled_workflow(instance.revision_id).await?;

        let logic = runtime
            .current_state()
            .and_then(|state| workflow.state(state))
            .map(|state| states::build(&state));

        let mut im = InstanceMemory::new(instance, runtime, workflow);
        im.logic = logic;
        Ok(im)
    }

    async fn timeout_fired(&self, payload: Value) {
        let timeout: TimeoutPayload = match serde_json::from_value(payload) {
            Ok(timeout) => timeout,
            Err(e) => {
                tracing::error!(error = %e, "Invalid timeout payload");
                return;
            }
        };

        let (code, message) = if timeout.soft {
            (codes::SOFT_TIMEOUT, "operation timed out")
        } else {
            (codes::HARD_TIMEOUT, "workflow killed after exceeding its hard deadline")
        };
        tracing::info!(instance = %timeout.instance_id, step = timeout.step, soft = timeout.soft, "Deadline reached");

        let cancel = CancelPayload {
            code: code.to_string(),
            message: message.to_string(),
            soft: timeout.soft,
            step: timeout.step,
        };
        let payload = match serde_json::to_value(&cancel) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode cancel");
                return;
            }
        };
        if let Err(e) = self
            .enqueue_instance_message(timeout.instance_id, MessageKind::Cancel, payload)
            .await
        {
            tracing::warn!(instance = %timeout.instance_id, error = %e, "Failed to deliver timeout");
            return;
        }
        if !timeout.soft {
            self.interrupt(timeout.instance_id);
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("hostname", &self.inner.hostname)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_instance_args_defaults() {
        let args: NewInstanceArgs =
            serde_json::from_value(json!({"namespace": "ns", "path": "/a.yaml"})).unwrap();
        assert_eq!(args.invoker, "api");
        assert!(args.reference.is_none());
        assert!(args.input.is_null());
        assert!(args.caller.is_none());
    }

    #[test]
    fn test_delayed_event_payload() {
        let payload = serde_json::to_value(DelayedEvent {
            namespace: "ns".into(),
            event: CloudEvent::new("ping", "test", json!(1)),
        })
        .unwrap();
        let back: DelayedEvent = serde_json::from_value(payload).unwrap();
        assert_eq!(back.namespace, "ns");
        assert_eq!(back.event.event_type, "ping");
    }
}
