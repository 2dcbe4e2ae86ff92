use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::broadcast;

use direktiv_core::error::{DirektivError, Result};

/// The shared channel replicas publish envelopes on.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publish one payload to every subscribed replica, including this one.
    async fn publish(&self, payload: String) -> Result<()>;

    /// Start receiving payloads. Delivery begins before this returns.
    async fn subscribe(&self) -> Result<BoxStream<'static, String>>;
}

/// Loopback transport connecting engines in one process.
#[derive(Clone)]
pub struct MemoryTransport {
    tx: broadcast::Sender<String>,
}

impl MemoryTransport {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, payload: String) -> Result<()> {
        // No receivers is not an error for a notification channel.
        let _ = self.tx.send(payload);
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, String>> {
        let rx = self.tx.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Notification receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Transport over Postgres `LISTEN`/`NOTIFY`.
#[derive(Clone)]
pub struct PgTransport {
    pool: sqlx::PgPool,
    channel: String,
}

impl PgTransport {
    pub fn new(pool: sqlx::PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl Transport for PgTransport {
    async fn publish(&self, payload: String) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, String>> {
        let mut listener = sqlx::postgres::PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| DirektivError::Cluster(e.to_string()))?;
        listener
            .listen(&self.channel)
            .await
            .map_err(|e| DirektivError::Cluster(e.to_string()))?;

        tracing::info!(channel = %self.channel, "Listening for cluster notifications");

        // PgListener reconnects on its own; errors are reported and skipped.
        let stream = listener.into_stream().filter_map(|notification| async move {
            match notification {
                Ok(notification) => Some(notification.payload().to_string()),
                Err(e) => {
                    tracing::warn!(error = %e, "Error receiving notification");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_transport_fans_out() {
        let transport = MemoryTransport::new(16);
        let mut a = transport.subscribe().await.unwrap();
        let mut b = transport.subscribe().await.unwrap();

        transport.publish("hello".to_string()).await.unwrap();

        assert_eq!(a.next().await.as_deref(), Some("hello"));
        assert_eq!(b.next().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let transport = MemoryTransport::default();
        assert!(transport.publish("dropped".to_string()).await.is_ok());
    }
}
