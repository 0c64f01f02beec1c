//! Converge command-line entry point.
//!
//! Loads configuration, inventory and playbook, runs the playbook and
//! exits with the report's exit code: 0 on success, 2 when a host failed,
//! 4 when hosts were only unreachable, 1 when something could not be
//! loaded.

mod cli;

use anyhow::{Context, Result};
use colored::Colorize;
use std::sync::Arc;
use tracing::warn;

use cli::Cli;
use converge::config::{Config, LoggingConfig};
use converge::connection::TransportFactory;
use converge::executor::Executor;
use converge::inventory::{Host, Inventory};
use converge::playbook::Playbook;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let config = match Config::load(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            cli::init_logging(cli.verbosity(), &LoggingConfig::default());
            eprintln!("{} {:#}", "ERROR:".red().bold(), e);
            std::process::exit(1);
        }
    };
    cli::init_logging(cli.verbosity(), &config.logging);

    let exit_code = match run(&cli, config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "ERROR:".red().bold(), e);
            1
        }
    };

    std::process::exit(exit_code);
}

async fn run(cli: &Cli, config: Config) -> Result<i32> {
    let playbook = Playbook::from_file(&cli.playbook)
        .await
        .with_context(|| format!("Failed to load playbook {}", cli.playbook.display()))?;

    let inventory = match cli.inventory.as_ref().or(config.defaults.inventory.as_ref()) {
        Some(path) => Inventory::load(path)
            .with_context(|| format!("Failed to load inventory {}", path.display()))?,
        None => {
            let mut inventory = Inventory::new();
            inventory.add_host(Host::local("localhost"));
            inventory
        }
    };

    let mut executor_config = config.executor_config();
    cli.apply(&mut executor_config)?;

    let factory = Arc::new(TransportFactory::new(config.ssh.clone()));
    let executor = Executor::new(executor_config, inventory, factory);

    let token = executor.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling the run");
            token.cancel();
        }
    });

    let report = executor.run_playbook(&playbook).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        cli::print_report(&report);
    }
    Ok(report.exit_code())
}
