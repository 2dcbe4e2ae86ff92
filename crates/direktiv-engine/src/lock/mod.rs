//! Lock Manager: per-instance mutual exclusion.
//!
//! The instance id is hashed to a 64-bit advisory lock key. Every acquired
//! lock carries a cancellation token registered under the instance id so a
//! hard cancel can interrupt whatever the holder is doing.

mod manager;
mod memory;
mod postgres;

pub use manager::{InstanceLock, LockManager};
pub use memory::MemoryAdvisoryLocks;
pub use postgres::PgAdvisoryLocks;

use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use direktiv_core::error::Result;

/// Session-scoped advisory locks keyed by integers.
#[async_trait]
pub trait AdvisoryLocks: Send + Sync + 'static {
    /// Block until `key` is acquired or `timeout` elapses.
    ///
    /// A timeout yields a retryable [`DirektivError::Timeout`](direktiv_core::DirektivError::Timeout).
    async fn acquire(&self, key: i64, timeout: Duration) -> Result<Box<dyn HeldLock>>;
}

/// An acquired advisory lock.
#[async_trait]
pub trait HeldLock: Send + Sync {
    /// Release the lock. Releasing twice is a no-op.
    async fn release(&mut self) -> Result<()>;
}

/// Advisory lock key of an instance.
pub fn lock_key(instance_id: Uuid) -> i64 {
    let digest = Sha256::digest(instance_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}
