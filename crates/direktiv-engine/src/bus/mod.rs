//! Notification Bus: local wake-ups plus cluster control messages over one
//! shared channel.
//!
//! Notifications are hints. Publishing is asynchronous and drops messages
//! when the outbound queue is full, so receivers always re-query the store.

mod subscription;
mod transport;

pub use subscription::Subscription;
pub use transport::{MemoryTransport, PgTransport, Transport};

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use direktiv_core::error::{DirektivError, Result};

use crate::registry::Registry;
use subscription::Subscriptions;

/// Control message handler names.
pub mod handlers {
    /// Wake local waiters of a key.
    pub const NOTIFY: &str = "notify";
    /// A replica is shutting down; the key is its hostname.
    pub const DISCONNECT: &str = "disconnect";
    pub const DELETE_TIMER: &str = "deleteTimer";
    /// Delete every timer of the instance in the key.
    pub const DELETE_INSTANCE_TIMERS: &str = "deleteInstanceTimers";
    /// Interrupt whoever holds the lock of the instance in the key.
    pub const CANCEL_WORKFLOW: &str = "cancelWorkflow";
    /// Drop cached routes of the workflow in the key.
    pub const CONFIGURE_ROUTER: &str = "configureRouter";
    /// Ownership assertion for a queued instance message.
    pub const INSTANCE_MESSAGE: &str = "instanceMessage";
}

/// Wire format of a control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    pub handler: String,
    /// Hostname of the publishing replica.
    pub sender: String,
    pub key: String,
    /// Target replica; empty for a cluster-wide broadcast.
    #[serde(default)]
    pub hostname: String,
}

impl Envelope {
    pub fn is_broadcast(&self) -> bool {
        self.hostname.is_empty()
    }
}

/// Handle to the notification bus of this replica.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

struct BusInner {
    hostname: String,
    transport: Arc<dyn Transport>,
    handlers: Registry<Envelope>,
    subscriptions: Subscriptions,
    outbound_tx: mpsc::Sender<String>,
    outbound_rx: Mutex<Option<mpsc::Receiver<String>>>,
    shutdown: CancellationToken,
}

impl Bus {
    /// Create a bus. Call [`Bus::start`] to begin exchanging messages.
    pub fn new(hostname: impl Into<String>, transport: Arc<dyn Transport>, buffer: usize) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer.max(1));
        let bus = Self {
            inner: Arc::new(BusInner {
                hostname: hostname.into(),
                transport,
                handlers: Registry::new(),
                subscriptions: Subscriptions::default(),
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                shutdown: CancellationToken::new(),
            }),
        };

        let weak = Arc::downgrade(&bus.inner);
        bus.register(handlers::NOTIFY, move |envelope: Envelope| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.subscriptions.wake(&envelope.key);
                }
            }
        });

        bus
    }

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    /// Register a control message handler.
    pub fn register<F, Fut>(&self, handler: &str, callback: F)
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner.handlers.register(handler, callback);
    }

    /// Subscribe to the channel and spawn the inbound and outbound loops.
    pub async fn start(&self) -> Result<()> {
        let mut outbound_rx = self
            .inner
            .outbound_rx
            .lock()
            .map_err(|_| DirektivError::internal("bus state poisoned"))?
            .take()
            .ok_or_else(|| DirektivError::InvalidState("bus already started".into()))?;

        let mut inbound = self.inner.transport.subscribe().await?;

        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    payload = inbound.next() => match payload {
                        Some(payload) => inner.dispatch(&payload),
                        None => {
                            tracing::warn!("Notification channel closed");
                            break;
                        }
                    },
                    _ = inner.shutdown.cancelled() => break,
                }
            }
            tracing::debug!("Bus inbound loop stopped");
        });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    payload = outbound_rx.recv() => match payload {
                        Some(payload) => {
                            if let Err(e) = inner.transport.publish(payload).await {
                                tracing::warn!(error = %e, "Failed to publish notification");
                            }
                        }
                        None => break,
                    },
                    _ = inner.shutdown.cancelled() => break,
                }
            }
            tracing::debug!("Bus outbound loop stopped");
        });

        tracing::info!(hostname = %self.inner.hostname, "Notification bus started");
        Ok(())
    }

    /// Stop both loops. Queued outbound messages are dropped.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
    }

    /// Wake local waiters of `key` and every other replica's.
    pub fn notify(&self, key: &str) {
        self.inner.subscriptions.wake(key);
        self.publish(handlers::NOTIFY, key);
    }

    /// Wake local waiters only.
    pub fn notify_local(&self, key: &str) {
        self.inner.subscriptions.wake(key);
    }

    /// Subscribe to local notifications on `keys`.
    pub fn subscribe<I, S>(&self, keys: I) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner
            .subscriptions
            .subscribe(keys.into_iter().map(Into::into).collect())
    }

    /// Broadcast a control message to every other replica.
    pub fn publish(&self, handler: &str, key: &str) {
        self.enqueue(Envelope {
            handler: handler.to_string(),
            sender: self.inner.hostname.clone(),
            key: key.to_string(),
            hostname: String::new(),
        });
    }

    /// Send a control message to one replica. Messages addressed to this
    /// replica are dispatched directly.
    pub fn send_to(&self, hostname: &str, handler: &str, key: &str) {
        let envelope = Envelope {
            handler: handler.to_string(),
            sender: self.inner.hostname.clone(),
            key: key.to_string(),
            hostname: hostname.to_string(),
        };

        if hostname == self.inner.hostname {
            self.inner.invoke(envelope);
        } else {
            self.enqueue(envelope);
        }
    }

    fn enqueue(&self, envelope: Envelope) {
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode envelope");
                return;
            }
        };

        if let Err(e) = self.inner.outbound_tx.try_send(payload) {
            tracing::warn!(
                handler = %envelope.handler,
                key = %envelope.key,
                error = %e,
                "Dropping cluster notification"
            );
        }
    }
}

impl BusInner {
    fn dispatch(&self, payload: &str) {
        let envelope: Envelope = match serde_json::from_str(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid notification payload");
                return;
            }
        };

        if envelope.sender == self.hostname {
            return;
        }
        if !envelope.is_broadcast() && envelope.hostname != self.hostname {
            return;
        }

        self.invoke(envelope);
    }

    fn invoke(&self, envelope: Envelope) {
        match self.handlers.get(&envelope.handler) {
            Some(callback) => {
                tracing::trace!(handler = %envelope.handler, key = %envelope.key, "Dispatching");
                tokio::spawn(callback(envelope));
            }
            None => {
                tracing::warn!(handler = %envelope.handler, "No handler registered");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn started(hostname: &str, transport: &MemoryTransport) -> Bus {
        let bus = Bus::new(hostname, Arc::new(transport.clone()), 16);
        bus.start().await.unwrap();
        bus
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope {
            handler: handlers::DELETE_TIMER.to_string(),
            sender: "a".to_string(),
            key: "timeout:x".to_string(),
            hostname: String::new(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["Handler"], "deleteTimer");
        assert_eq!(json["Sender"], "a");
        assert_eq!(json["Key"], "timeout:x");
        assert_eq!(json["Hostname"], "");
    }

    #[tokio::test]
    async fn test_notify_reaches_other_replica() {
        let transport = MemoryTransport::new(16);
        let a = started("a", &transport).await;
        let b = started("b", &transport).await;

        let sub = b.subscribe(["instance-1"]);
        a.notify("instance-1");

        tokio::time::timeout(Duration::from_secs(1), sub.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_point_to_point_reaches_only_target() {
        let transport = MemoryTransport::new(16);
        let a = started("a", &transport).await;
        let b = started("b", &transport).await;
        let c = started("c", &transport).await;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        for bus in [&b, &c] {
            let tx = tx.clone();
            let me = bus.hostname().to_string();
            bus.register("ping", move |_envelope: Envelope| {
                let tx = tx.clone();
                let me = me.clone();
                async move {
                    let _ = tx.send(me);
                }
            });
        }

        a.send_to("c", "ping", "k");
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some("c"));
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let transport = MemoryTransport::new(16);
        let a = started("a", &transport).await;

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        a.register("ping", move |_| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(());
            }
        });

        a.publish("ping", "k");
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err());

        a.send_to("a", "ping", "k");
        assert!(tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .is_ok());
    }
}
