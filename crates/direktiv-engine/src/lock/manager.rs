use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use direktiv_core::error::{DirektivError, Result};

use super::{lock_key, AdvisoryLocks, HeldLock};

/// Authorization to mutate one instance's durable record.
pub struct InstanceLock {
    instance_id: Uuid,
    key: i64,
    held: Box<dyn HeldLock>,
    token: CancellationToken,
}

impl InstanceLock {
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    /// Cancelled when the instance is hard-cancelled or the lock is released.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl std::fmt::Debug for InstanceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLock")
            .field("instance_id", &self.instance_id)
            .field("key", &self.key)
            .finish()
    }
}

/// Hands out instance locks and keeps the cancellers of the ones held here.
pub struct LockManager {
    locks: Arc<dyn AdvisoryLocks>,
    cancellers: Mutex<HashMap<Uuid, CancellationToken>>,
    timeout: Duration,
}

impl LockManager {
    pub fn new(locks: Arc<dyn AdvisoryLocks>, timeout: Duration) -> Self {
        Self {
            locks,
            cancellers: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Acquire the lock of an instance, waiting at most the configured timeout.
    pub async fn lock_instance(&self, instance_id: Uuid) -> Result<InstanceLock> {
        let key = lock_key(instance_id);
        let held = self.locks.acquire(key, self.timeout).await?;
        let token = CancellationToken::new();

        self.cancellers
            .lock()
            .map_err(|_| DirektivError::internal("canceller table poisoned"))?
            .insert(instance_id, token.clone());

        tracing::trace!(instance = %instance_id, key, "Instance locked");
        Ok(InstanceLock {
            instance_id,
            key,
            held,
            token,
        })
    }

    /// Invoke the canceller of a lock and release it.
    pub async fn unlock_instance(&self, mut lock: InstanceLock) -> Result<()> {
        // Holders are exclusive, so the registered canceller is this lock's.
        if let Ok(mut cancellers) = self.cancellers.lock() {
            cancellers.remove(&lock.instance_id);
        }
        lock.token.cancel();
        lock.held.release().await?;

        tracing::trace!(instance = %lock.instance_id, key = lock.key, "Instance unlocked");
        Ok(())
    }

    /// Interrupt the holder of an instance lock on this replica.
    ///
    /// Returns whether a holder was found.
    pub fn cancel_instance(&self, instance_id: Uuid) -> bool {
        let token = self
            .cancellers
            .lock()
            .ok()
            .and_then(|c| c.get(&instance_id).cloned());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}
