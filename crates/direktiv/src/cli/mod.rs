mod check;
mod migrate;
mod run;

pub use check::CheckCommand;
pub use migrate::MigrateCommand;
pub use run::RunCommand;

use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};

use direktiv_core::DirektivConfig;

/// direktiv - durable workflow engine
#[derive(Parser)]
#[command(name = "direktiv")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run an engine replica.
    Run(RunCommand),

    /// Apply pending database migrations.
    Migrate(MigrateCommand),

    /// Validate a workflow definition without running it.
    Check(CheckCommand),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run(cmd) => cmd.execute().await,
            Commands::Migrate(cmd) => cmd.execute().await,
            Commands::Check(cmd) => cmd.execute(),
        }
    }
}

/// Load `.env` and the TOML configuration at `path`.
pub(crate) fn load_config(path: &str) -> Result<DirektivConfig> {
    dotenvy::dotenv().ok();

    if !Path::new(path).exists() {
        anyhow::bail!("Configuration file not found: {}", path);
    }
    Ok(DirektivConfig::from_file(path)?)
}
