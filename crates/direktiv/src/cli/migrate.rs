use anyhow::Result;
use clap::Parser;
use console::style;

use direktiv_engine::{builtin_migrations, Database, MigrationRunner};

/// Apply pending database migrations.
#[derive(Parser)]
pub struct MigrateCommand {
    /// Configuration file path.
    #[arg(short, long, default_value = "direktiv.toml")]
    pub config: String,

    /// Only list pending migrations.
    #[arg(long)]
    pub status: bool,
}

impl MigrateCommand {
    pub async fn execute(self) -> Result<()> {
        let config = super::load_config(&self.config)?;
        let db = Database::from_config(&config.database).await?;
        let runner = MigrationRunner::new(db.pool().clone());

        println!();
        if self.status {
            let applied = runner.applied().await?;
            for migration in builtin_migrations() {
                if applied.contains(&migration.name) {
                    println!("  {} {}", style("✓").green(), migration.name);
                } else {
                    println!("  {} {}", style("○").yellow(), style(&migration.name).yellow());
                }
            }
        } else {
            let applied = runner.run().await?;
            if applied.is_empty() {
                println!("  {} Schema is up to date", style("ℹ").blue());
            }
            for name in &applied {
                println!("  {} Applied {}", style("✓").green(), name);
            }
        }
        println!();

        db.close().await;
        Ok(())
    }
}
