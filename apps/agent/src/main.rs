//! # consolenet-agent
//!
//! Daemon that announces this console node and keeps the fleet directory
//! current.
//!
//! ## Commands
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  consolenet-agent [-v] [--config <path>] <command>                      │
//! │                                                                         │
//! │  run           (default) start the agent until SIGINT/SIGTERM          │
//! │  remotes       print the persisted directory                            │
//! │  init-config   write the effective configuration as TOML                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use consolenet_core::RegistryDirectory;
use consolenet_sync::{AgentConfig, ConsoleAgent, RegistryStore, SyncError};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "consolenet-agent")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent until interrupted
    Run,

    /// List known remote nodes
    Remotes {
        /// Print the raw directory as JSON
        #[arg(long)]
        json: bool,

        /// Only nodes with a known reachable address
        #[arg(long)]
        reachable: bool,
    },

    /// Write the effective configuration to the config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "info,consolenet=debug",
        _ => "debug",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(cli.config).await,
        Commands::Remotes { json, reachable } => remotes(cli.config, json, reachable).await,
        Commands::InitConfig { force } => init_config(cli.config, force),
    }
}

async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config = AgentConfig::load(config_path).map_err(|e| explain(e, "loading agent config"))?;
    info!(
        node_id = %config.node_id(),
        registry = ?config.registry.path,
        cloud = config.cloud.enabled,
        "Configuration loaded"
    );

    let mut agent = ConsoleAgent::from_config(config).map_err(|e| explain(e, "building agent"))?;
    let handle = agent.start().await.map_err(|e| explain(e, "starting agent"))?;

    shutdown_signal().await;

    let status = handle.status().await;
    info!(known_nodes = status.known_nodes, "Stopping");
    agent.shutdown().await?;

    info!("Agent shutdown complete");
    Ok(())
}

async fn remotes(config_path: Option<PathBuf>, json: bool, reachable: bool) -> Result<()> {
    let config = AgentConfig::load(config_path).map_err(|e| explain(e, "loading agent config"))?;
    let directory = RegistryStore::from_settings(&config.registry).load().await;

    if json {
        let bytes = directory.to_json_pretty()?;
        print!("{}", String::from_utf8_lossy(&bytes));
        return Ok(());
    }

    print_table(&directory, reachable);
    Ok(())
}

fn print_table(directory: &RegistryDirectory, reachable_only: bool) {
    println!(
        "{:<24} {:<16} {:<7} {:>8} {:>5}",
        "NODE", "ADDRESS", "SOURCE", "ADAPTERS", "FAIL"
    );
    let records: Vec<_> = if reachable_only {
        directory.reachable()
    } else {
        directory.records().collect()
    };
    for record in records {
        println!(
            "{:<24} {:<16} {:<7} {:>8} {:>5}",
            record.node_id,
            record.remote_ip.as_deref().unwrap_or("-"),
            record.source.to_string(),
            record.adapters.len(),
            record.fail_count
        );
    }
}

fn init_config(config_path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match config_path.or_else(AgentConfig::default_config_path) {
        Some(path) => path,
        None => bail!("no config path available on this platform"),
    };
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    let config = AgentConfig::load_or_default(Some(path.clone()));
    config.save(Some(path.clone()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

/// Points configuration failures at `init-config`; other errors keep `step` as context.
fn explain(err: SyncError, step: &'static str) -> anyhow::Error {
    if err.is_config_error() {
        anyhow!("configuration rejected: {} (see `consolenet-agent init-config`)", err)
    } else {
        anyhow::Error::new(err).context(step)
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
