//! SafeStore quarantine service and operator tool.

mod version;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use safestore_quarantine::config::layered_source;
use safestore_quarantine::{Backoff, QuarantineConfig, QuarantineManager, StateMonitor};
use safestore_storage::{ObjectStore, SledObjectStore};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "safestore")]
#[command(about = "SafeStore quarantine engine")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Keep the database initialised until interrupted
    Run,
    /// Print database health as JSON
    Status,
    /// List quarantined files as JSON
    List,
    /// Restore a quarantined file to its original location
    Restore {
        /// Object id as printed by `list`
        object_id: String,
    },
    /// Delete and recreate the database
    DeleteDatabase,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct LogConfig {
    log_level: String,
    log_format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

fn init_logging(config: &LogConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn ensure_initialised(manager: &QuarantineManager) -> Result<()> {
    if !manager.initialise() {
        let state = manager.state();
        bail!("SafeStore database unavailable ({state}); is another instance running?");
    }
    Ok(())
}

async fn run(manager: Arc<QuarantineManager>) -> Result<()> {
    let backoff = Backoff::new(
        manager.config().initial_backoff(),
        manager.config().max_backoff(),
    );
    let monitor = StateMonitor::start(Arc::clone(&manager), backoff)
        .context("Failed to start SafeStore state monitor")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    tokio::task::spawn_blocking(move || {
        let mut monitor = monitor;
        monitor.stop();
        manager.close();
    })
    .await
    .context("SafeStore shutdown task failed")?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let source = layered_source(cli.config.as_deref()).context("Failed to load configuration")?;
    let log_config: LogConfig = source
        .clone()
        .try_deserialize()
        .context("Invalid logging configuration")?;
    init_logging(&log_config)?;

    let config =
        QuarantineConfig::from_source(&source).context("Invalid quarantine configuration")?;
    info!(
        version = version::SAFESTORE_VERSION,
        commit = version::git_commit_hash(),
        database = %config.database_dir.join(&config.database_name).display(),
        "SafeStore starting"
    );

    let store: Arc<dyn ObjectStore> = Arc::new(SledObjectStore::new());
    let manager = Arc::new(QuarantineManager::new(config, store));

    match cli.command {
        Commands::Run => run(manager).await?,
        Commands::Status => print_json(&manager.health())?,
        Commands::List => {
            ensure_initialised(&manager)?;
            print_json(&manager.list_quarantined())?;
            manager.close();
        }
        Commands::Restore { object_id } => {
            ensure_initialised(&manager)?;
            let report = manager.restore_file(&object_id);
            manager.close();
            match report {
                Some(report) => {
                    if !report.was_successful {
                        warn!(path = %report.path.display(), "Restore did not complete");
                    }
                    print_json(&report)?;
                }
                None => bail!("Object {object_id} could not be restored"),
            }
        }
        Commands::DeleteDatabase => {
            if !manager.delete_database() {
                bail!("SafeStore database could not be deleted");
            }
            println!("SafeStore database deleted");
        }
    }

    Ok(())
}
