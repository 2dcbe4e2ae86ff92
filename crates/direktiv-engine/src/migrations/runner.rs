//! Migration runner safe to start on many replicas at once.

use std::collections::HashSet;

use sqlx::PgPool;
use tracing::{debug, info, warn};

use direktiv_core::error::{DirektivError, Result};

/// Advisory lock held while migrating ("DKTV" in ascii).
const MIGRATION_LOCK_ID: i64 = 0x444B5456;

/// A single migration.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Unique name, e.g. `0000_direktiv_engine`.
    pub name: String,
    pub sql: String,
}

impl Migration {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// Applies the built-in schema migrations.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply every pending migration under an exclusive advisory lock.
    ///
    /// Returns the names of the migrations applied by this call.
    pub async fn run(&self) -> Result<Vec<String>> {
        self.acquire_lock().await?;

        let result = self.run_pending().await;

        if let Err(e) = self.release_lock().await {
            warn!("Failed to release migration lock: {}", e);
        }

        result
    }

    /// Names of the migrations already applied.
    pub async fn applied(&self) -> Result<HashSet<String>> {
        self.ensure_migrations_table().await?;
        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM direktiv_migrations")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                DirektivError::Database(format!("Failed to get applied migrations: {}", e))
            })?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn run_pending(&self) -> Result<Vec<String>> {
        let applied = self.applied().await?;
        debug!(?applied, "Already applied migrations");

        let mut newly_applied = Vec::new();
        for migration in super::builtin::builtin_migrations() {
            if !applied.contains(&migration.name) {
                self.apply(&migration).await?;
                newly_applied.push(migration.name);
            }
        }
        Ok(newly_applied)
    }

    async fn acquire_lock(&self) -> Result<()> {
        debug!("Acquiring migration lock");
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                DirektivError::Database(format!("Failed to acquire migration lock: {}", e))
            })?;
        Ok(())
    }

    async fn release_lock(&self) -> Result<()> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                DirektivError::Database(format!("Failed to release migration lock: {}", e))
            })?;
        Ok(())
    }

    async fn ensure_migrations_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS direktiv_migrations (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) UNIQUE NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            DirektivError::Database(format!("Failed to create migrations table: {}", e))
        })?;
        Ok(())
    }

    async fn apply(&self, migration: &Migration) -> Result<()> {
        info!(migration = %migration.name, "Applying migration");

        let mut tx = self.pool.begin().await?;
        for statement in split_statements(&migration.sql) {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    DirektivError::Database(format!(
                        "Failed to apply migration '{}': {}",
                        migration.name, e
                    ))
                })?;
        }

        sqlx::query("INSERT INTO direktiv_migrations (name) VALUES ($1)")
            .bind(&migration.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(migration = %migration.name, "Migration applied");
        Ok(())
    }
}

/// Split a script into statements on `;` outside of quotes and comments.
fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_quote = !in_quote;
                current.push(c);
            }
            '-' if !in_quote && chars.peek() == Some(&'-') => {
                // skip line comment
                for next in chars.by_ref() {
                    if next == '\n' {
                        current.push('\n');
                        break;
                    }
                }
            }
            ';' if !in_quote => {
                let statement = current.trim();
                if !statement.is_empty() {
                    statements.push(statement.to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }

    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
    statements
}
