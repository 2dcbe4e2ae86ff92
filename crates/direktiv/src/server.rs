//! Wiring of one production replica: Postgres-backed store, locks and bus,
//! the HTTP function invoker, and the ingress router.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use direktiv_core::DirektivConfig;
use direktiv_engine::{
    ingress, Bus, Database, Engine, HttpFunctionInvoker, MigrationRunner, PgAdvisoryLocks,
    PgStore, PgTransport,
};

pub struct Server {
    config: DirektivConfig,
}

impl Server {
    pub fn new(config: DirektivConfig) -> Self {
        Self { config }
    }

    /// Replica name: configured, else the machine hostname.
    fn hostname(&self) -> String {
        self.config.node.hostname.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }

    /// Run until ctrl-c, then hand our instances over to the other replicas.
    pub async fn run(self) -> Result<()> {
        let hostname = self.hostname();

        let db = Database::from_config(&self.config.database).await?;
        let pool = db.pool().clone();
        tracing::info!("Connected to database");

        let applied = MigrationRunner::new(pool.clone()).run().await?;
        tracing::info!(count = applied.len(), "Migrations completed");

        let transport = Arc::new(PgTransport::new(pool.clone(), &self.config.cluster.channel));
        let bus = Bus::new(
            hostname.as_str(),
            transport,
            self.config.cluster.outbound_buffer,
        );
        let engine = Engine::new(
            self.config.engine.clone(),
            Arc::new(PgStore::new(pool.clone())),
            Arc::new(PgAdvisoryLocks::new(pool)),
            bus,
            Arc::new(HttpFunctionInvoker::new(&self.config.functions)?),
        );
        engine.boot().await?;

        let shutdown = CancellationToken::new();
        let ingress_handle = if self.config.ingress.enabled {
            let addr: SocketAddr = self
                .config
                .ingress
                .bind
                .parse()
                .with_context(|| format!("invalid ingress bind '{}'", self.config.ingress.bind))?;
            let token = shutdown.clone();
            let engine = engine.clone();
            Some(tokio::spawn(async move {
                ingress::serve(engine, addr, async move { token.cancelled().await }).await
            }))
        } else {
            None
        };

        tracing::info!(%hostname, "Replica ready");
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        tracing::info!("Received shutdown signal");

        shutdown.cancel();
        if let Some(handle) = ingress_handle {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Ingress stopped with error"),
                Err(e) => tracing::warn!(error = %e, "Ingress task panicked"),
            }
        }
        engine.shutdown().await;
        db.close().await;

        tracing::info!("Shutdown complete");
        Ok(())
    }
}
