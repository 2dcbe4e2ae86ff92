use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio::sync::Mutex;
use tokio::time::Instant;

use direktiv_core::error::{DirektivError, Result};

use super::{AdvisoryLocks, HeldLock};

/// Advisory locks backed by `pg_try_advisory_lock`.
///
/// Each held lock pins one pooled connection, since Postgres advisory locks
/// belong to the session that took them.
#[derive(Clone)]
pub struct PgAdvisoryLocks {
    pool: PgPool,
    poll_interval: Duration,
}

impl PgAdvisoryLocks {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: Duration::from_millis(50),
        }
    }

    /// Set how often a contended lock is retried.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl AdvisoryLocks for PgAdvisoryLocks {
    async fn acquire(&self, key: i64, timeout: Duration) -> Result<Box<dyn HeldLock>> {
        let deadline = Instant::now() + timeout;
        let mut conn = tokio::time::timeout(timeout, self.pool.acquire())
            .await
            .map_err(|_| DirektivError::Timeout(format!("no connection for lock {}", key)))??;

        loop {
            let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
                .bind(key)
                .fetch_one(&mut *conn)
                .await?;

            if acquired {
                return Ok(Box::new(PgHeldLock {
                    key,
                    conn: Mutex::new(Some(conn)),
                }));
            }

            if Instant::now() >= deadline {
                return Err(DirektivError::Timeout(format!(
                    "advisory lock {} still held after {:?}",
                    key, timeout
                )));
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

struct PgHeldLock {
    key: i64,
    conn: Mutex<Option<PoolConnection<Postgres>>>,
}

#[async_trait]
impl HeldLock for PgHeldLock {
    async fn release(&mut self) -> Result<()> {
        let Some(mut conn) = self.conn.get_mut().take() else {
            return Ok(());
        };

        let unlocked: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await?;
        if !unlocked {
            tracing::warn!(key = self.key, "Advisory lock was not held at release");
        }

        conn.close().await?;
        Ok(())
    }
}

impl Drop for PgHeldLock {
    fn drop(&mut self) {
        // Closing the session is the only way to drop a lock without a query.
        if let Some(conn) = self.conn.get_mut().take() {
            tracing::warn!(key = self.key, "Advisory lock dropped without release");
            drop(conn.detach());
        }
    }
}
