use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use direktiv_core::error::{DirektivError, Result};

use super::{AdvisoryLocks, HeldLock};

/// In-process advisory locks. Engines sharing one instance behave like
/// replicas sharing one database.
#[derive(Default)]
pub struct MemoryAdvisoryLocks {
    keys: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemoryAdvisoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: i64) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut keys = self
            .keys
            .lock()
            .map_err(|_| DirektivError::internal("lock table poisoned"))?;
        Ok(keys.entry(key).or_default().clone())
    }
}

#[async_trait]
impl AdvisoryLocks for MemoryAdvisoryLocks {
    async fn acquire(&self, key: i64, timeout: Duration) -> Result<Box<dyn HeldLock>> {
        let slot = self.slot(key)?;
        match tokio::time::timeout(timeout, slot.lock_owned()).await {
            Ok(guard) => Ok(Box::new(MemoryHeldLock { guard: Some(guard) })),
            Err(_) => Err(DirektivError::Timeout(format!(
                "advisory lock {} still held after {:?}",
                key, timeout
            ))),
        }
    }
}

struct MemoryHeldLock {
    guard: Option<OwnedMutexGuard<()>>,
}

#[async_trait]
impl HeldLock for MemoryHeldLock {
    async fn release(&mut self) -> Result<()> {
        self.guard.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_times_out() {
        let locks = MemoryAdvisoryLocks::new();
        let mut held = locks.acquire(7, Duration::from_millis(50)).await.unwrap();

        let err = locks
            .acquire(7, Duration::from_millis(20))
            .await
            .err()
            .unwrap();
        assert!(err.is_retryable());

        held.release().await.unwrap();
        let mut again = locks.acquire(7, Duration::from_millis(20)).await.unwrap();
        again.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_contend() {
        let locks = MemoryAdvisoryLocks::new();
        let _a = locks.acquire(1, Duration::from_millis(20)).await.unwrap();
        let _b = locks.acquire(2, Duration::from_millis(20)).await.unwrap();
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let locks = Arc::new(MemoryAdvisoryLocks::new());
        let inside = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut tasks = Vec::new();

        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            tasks.push(tokio::spawn(async move {
                let mut held = locks.acquire(42, Duration::from_secs(5)).await.unwrap();
                let now = inside.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                assert_eq!(now, 0);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                held.release().await.unwrap();
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
    }
}
