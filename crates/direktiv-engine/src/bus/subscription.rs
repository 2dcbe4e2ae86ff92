use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

type Waiters = HashMap<String, Vec<(u64, Arc<Notify>)>>;

/// Local waiters keyed by opaque strings.
#[derive(Default)]
pub(crate) struct Subscriptions {
    waiters: Arc<Mutex<Waiters>>,
    next_id: AtomicU64,
}

impl Subscriptions {
    pub(crate) fn subscribe(&self, keys: Vec<String>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let notify = Arc::new(Notify::new());

        if let Ok(mut waiters) = self.waiters.lock() {
            for key in &keys {
                waiters
                    .entry(key.clone())
                    .or_default()
                    .push((id, notify.clone()));
            }
        }

        Subscription {
            id,
            keys,
            notify,
            waiters: self.waiters.clone(),
        }
    }

    /// Wake every waiter subscribed to `key`.
    pub(crate) fn wake(&self, key: &str) -> usize {
        let Ok(waiters) = self.waiters.lock() else {
            return 0;
        };
        match waiters.get(key) {
            Some(list) => {
                for (_, notify) in list {
                    notify.notify_one();
                }
                list.len()
            }
            None => 0,
        }
    }
}

/// A waitable handle on one or more keys, good until closed or dropped.
pub struct Subscription {
    id: u64,
    keys: Vec<String>,
    notify: Arc<Notify>,
    waiters: Arc<Mutex<Waiters>>,
}

impl Subscription {
    /// Wait for the next notification on any subscribed key.
    ///
    /// A notification that arrived since the last wait completes immediately.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn close(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut waiters) = self.waiters.lock() {
            for key in &self.keys {
                if let Some(list) = waiters.get_mut(key) {
                    list.retain(|(id, _)| *id != self.id);
                    if list.is_empty() {
                        waiters.remove(key);
                    }
                }
            }
        }
    }
}
