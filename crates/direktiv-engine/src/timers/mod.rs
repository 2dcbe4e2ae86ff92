//! Timer Service: replica-local cron and one-shot timers.
//!
//! Timers live only as long as this process, so every timer name carries
//! enough identity for any replica to re-create or cancel it. Deletions are
//! therefore sent over the bus as well as applied locally.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use direktiv_core::error::{DirektivError, Result};
use direktiv_core::timer::{names, CronSchedule, Timer, TimerKind, TimerSchedule};

use crate::bus::{handlers, Bus, Envelope};
use crate::registry::Registry;

/// Handle to the timer service of this replica.
#[derive(Clone)]
pub struct TimerService {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    functions: Registry<Value>,
    timers: Mutex<HashMap<String, TimerEntry>>,
    generation: AtomicU64,
    bus: Bus,
}

struct TimerEntry {
    timer: Timer,
    handle: JoinHandle<()>,
    generation: u64,
}

impl TimerService {
    /// Create the service and register its deletion handlers on the bus.
    pub fn new(bus: Bus) -> Self {
        let service = Self {
            inner: Arc::new(TimerInner {
                functions: Registry::new(),
                timers: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                bus: bus.clone(),
            }),
        };

        let weak = Arc::downgrade(&service.inner);
        bus.register(handlers::DELETE_TIMER, move |envelope: Envelope| {
            let weak = weak.clone();
            async move {
                if let Some(service) = upgrade(&weak) {
                    service.delete_timer(&envelope.key);
                }
            }
        });

        let weak = Arc::downgrade(&service.inner);
        bus.register(handlers::DELETE_INSTANCE_TIMERS, move |envelope: Envelope| {
            let weak = weak.clone();
            async move {
                let Some(service) = upgrade(&weak) else {
                    return;
                };
                match Uuid::parse_str(&envelope.key) {
                    Ok(id) => {
                        service.delete_instance_timers(id);
                    }
                    Err(_) => tracing::warn!(key = %envelope.key, "Invalid instance id"),
                }
            }
        });

        service
    }

    /// Register a function timers can invoke.
    pub fn register_function<F, Fut>(&self, name: &str, function: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner.functions.register(name, function);
    }

    /// Schedule a timer that fires once at `at`, replacing any timer of the
    /// same name. Times in the past fire immediately.
    pub fn add_one_shot(
        &self,
        name: &str,
        function: &str,
        at: DateTime<Utc>,
        payload: Value,
    ) -> Result<()> {
        let callback = self.function(function)?;
        let timer = Timer {
            name: name.to_string(),
            kind: TimerKind::OneShot,
            function: function.to_string(),
            schedule: TimerSchedule::At(at),
            payload: payload.clone(),
        };

        let mut timers = self.lock_timers()?;
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(&self.inner);
        let timer_name = name.to_string();

        let handle = tokio::spawn(async move {
            let wait = (at - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            // Unregister first so the callback may schedule a timer of the same name.
            if let Some(service) = upgrade(&weak) {
                service.inner.remove_if_generation(&timer_name, generation);
            }
            tracing::debug!(timer = %timer_name, "One-shot timer fired");
            callback(payload).await;
        });

        if let Some(old) = timers.insert(
            name.to_string(),
            TimerEntry {
                timer,
                handle,
                generation,
            },
        ) {
            old.handle.abort();
        }

        tracing::trace!(timer = %name, function, at = %at, "One-shot timer scheduled");
        Ok(())
    }

    /// Schedule a repeating timer on a cron pattern, replacing any timer of
    /// the same name.
    pub fn add_cron(&self, name: &str, function: &str, pattern: &str, payload: Value) -> Result<()> {
        let callback = self.function(function)?;
        let schedule = CronSchedule::new(pattern)
            .map_err(|e| DirektivError::InvalidArgument(e.to_string()))?;
        let timer = Timer {
            name: name.to_string(),
            kind: TimerKind::Cron,
            function: function.to_string(),
            schedule: TimerSchedule::Cron(schedule.expression().to_string()),
            payload: payload.clone(),
        };

        let mut timers = self.lock_timers()?;
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let timer_name = name.to_string();

        let handle = tokio::spawn(async move {
            while let Some(next) = schedule.next_after(Utc::now()) {
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                tracing::trace!(timer = %timer_name, "Cron timer fired");
                tokio::spawn(callback(payload.clone()));
            }
        });

        if let Some(old) = timers.insert(
            name.to_string(),
            TimerEntry {
                timer,
                handle,
                generation,
            },
        ) {
            old.handle.abort();
        }

        tracing::debug!(timer = %name, function, pattern, "Cron timer scheduled");
        Ok(())
    }

    /// Delete a local timer. Returns whether it existed.
    pub fn delete_timer(&self, name: &str) -> bool {
        self.inner.delete_timer(name)
    }

    /// Delete every local timer bound to an instance.
    pub fn delete_instance_timers(&self, instance_id: Uuid) -> usize {
        self.inner.delete_instance_timers(instance_id)
    }

    /// Delete a timer wherever it lives.
    ///
    /// When ownership moved from `old_controller`, the delete is sent to that
    /// replica only. Otherwise it is applied locally and broadcast so replicas
    /// holding stale copies drop theirs.
    pub fn delete_timer_by_name(&self, old_controller: &str, new_controller: &str, name: &str) {
        if !old_controller.is_empty() && old_controller != new_controller {
            self.inner
                .bus
                .send_to(old_controller, handlers::DELETE_TIMER, name);
        } else {
            self.delete_timer(name);
            self.inner.bus.publish(handlers::DELETE_TIMER, name);
        }
    }

    /// Delete every timer of an instance on all replicas.
    pub fn delete_instance_timers_everywhere(&self, instance_id: Uuid) {
        self.delete_instance_timers(instance_id);
        self.inner
            .bus
            .publish(handlers::DELETE_INSTANCE_TIMERS, &instance_id.to_string());
    }

    /// Registered timers.
    pub fn list(&self) -> Vec<Timer> {
        self.inner
            .timers
            .lock()
            .map(|timers| timers.values().map(|e| e.timer.clone()).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .timers
            .lock()
            .map(|timers| timers.contains_key(name))
            .unwrap_or(false)
    }

    /// Abort every timer.
    pub fn stop(&self) {
        if let Ok(mut timers) = self.inner.timers.lock() {
            for (_, entry) in timers.drain() {
                entry.handle.abort();
            }
        }
    }

    fn function(&self, name: &str) -> Result<crate::registry::Callback<Value>> {
        self.inner
            .functions
            .get(name)
            .ok_or_else(|| DirektivError::InvalidArgument(format!("unknown timer function '{}'", name)))
    }

    fn lock_timers(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, TimerEntry>>> {
        self.inner
            .timers
            .lock()
            .map_err(|_| DirektivError::internal("timer table poisoned"))
    }
}

fn upgrade(weak: &Weak<TimerInner>) -> Option<TimerService> {
    weak.upgrade().map(|inner| TimerService { inner })
}

impl TimerInner {
    fn delete_timer(&self, name: &str) -> bool {
        let removed = self.timers.lock().ok().and_then(|mut t| t.remove(name));
        match removed {
            Some(entry) => {
                entry.handle.abort();
                tracing::trace!(timer = %name, "Timer deleted");
                true
            }
            None => false,
        }
    }

    fn delete_instance_timers(&self, instance_id: Uuid) -> usize {
        let Ok(mut timers) = self.timers.lock() else {
            return 0;
        };
        let doomed: Vec<String> = timers
            .keys()
            .filter(|name| names::instance_of(name) == Some(instance_id))
            .cloned()
            .collect();
        for name in &doomed {
            if let Some(entry) = timers.remove(name) {
                entry.handle.abort();
            }
        }
        doomed.len()
    }

    fn remove_if_generation(&self, name: &str, generation: u64) {
        if let Ok(mut timers) = self.timers.lock() {
            if timers.get(name).map(|e| e.generation) == Some(generation) {
                timers.remove(name);
            }
        }
    }
}

impl Drop for TimerInner {
    fn drop(&mut self) {
        if let Ok(timers) = self.timers.get_mut() {
            for entry in timers.values() {
                entry.handle.abort();
            }
        }
    }
}
