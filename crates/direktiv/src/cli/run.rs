use anyhow::Result;
use clap::Parser;
use console::style;
use tracing_subscriber::EnvFilter;

use direktiv_core::config::ObservabilityConfig;

use crate::server::Server;

/// Run an engine replica.
#[derive(Parser)]
pub struct RunCommand {
    /// Configuration file path.
    #[arg(short, long, default_value = "direktiv.toml")]
    pub config: String,

    /// Replica name (overrides config and the machine hostname).
    #[arg(long)]
    pub hostname: Option<String>,

    /// Ingress bind address (overrides config).
    #[arg(long)]
    pub bind: Option<String>,
}

impl RunCommand {
    pub async fn execute(self) -> Result<()> {
        let mut config = super::load_config(&self.config)?;
        init_tracing(&config.observability);

        if let Some(hostname) = self.hostname {
            config.node.hostname = Some(hostname);
        }
        if let Some(bind) = self.bind {
            config.ingress.bind = bind;
        }

        println!();
        println!(
            "  {} v{}",
            style("direktiv").bold().cyan(),
            env!("CARGO_PKG_VERSION")
        );
        if config.ingress.enabled {
            println!(
                "  {} Ingress on {}",
                style("→").dim(),
                style(format!("http://{}", config.ingress.bind)).cyan()
            );
        }
        println!();

        Server::new(config).run().await
    }
}

/// Install the global subscriber; `RUST_LOG` wins over the configured level.
fn init_tracing(config: &ObservabilityConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_defaults() {
        let cmd = RunCommand::try_parse_from(["run"]).unwrap();
        assert_eq!(cmd.config, "direktiv.toml");
        assert!(cmd.hostname.is_none());
        assert!(cmd.bind.is_none());
    }

    #[test]
    fn test_run_command_overrides() {
        let cmd = RunCommand::try_parse_from([
            "run",
            "--config",
            "custom.toml",
            "--hostname",
            "replica-b",
            "--bind",
            "127.0.0.1:7000",
        ])
        .unwrap();
        assert_eq!(cmd.config, "custom.toml");
        assert_eq!(cmd.hostname.as_deref(), Some("replica-b"));
        assert_eq!(cmd.bind.as_deref(), Some("127.0.0.1:7000"));
    }
}
