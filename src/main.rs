//! Pingscope - latency QoE engine
//!
//! Usage:
//!   pingscope batch                 rebuild every processed collection
//!   pingscope online                process the pending backlog
//!   pingscope --database qoe.db --config qoe.toml online

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pingscope_backend::{EngineSettings, QoeConfig, QoeRunner, SqliteQoeStore};

#[derive(Parser, Debug)]
#[command(name = "pingscope")]
#[command(about = "Segment OCR latency readings into QoE periods")]
struct Cli {
    /// SQLite database holding raw and processed data
    #[arg(long, env = "PINGSCOPE_DATABASE_PATH")]
    database: Option<String>,

    /// Per-game TOML configuration
    #[arg(long, env = "PINGSCOPE_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Worker pool size, overrides the mode default
    #[arg(long)]
    workers: Option<usize>,

    /// Tracing filter, e.g. `debug` or `pingscope_backend=trace`
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Wipe processed state and reprocess every pair from history start
    Batch,
    /// Drain the backlog and reprocess the affected pairs
    Online,
}

fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let mut settings = EngineSettings::from_env();
    if let Some(database) = cli.database {
        settings.database_path = database;
    }
    if cli.config.is_some() {
        settings.config_path = cli.config;
    }
    if let Some(workers) = cli.workers {
        settings.batch_workers = workers;
        settings.online_workers = workers;
    }

    let config = QoeConfig::load_or_default(settings.config_path.as_deref())
        .context("Configuration failure")?;
    let store = Arc::new(SqliteQoeStore::new(&settings.database_path)?);
    let runner = QoeRunner::new(store, config, settings);

    let summary = match cli.command {
        Command::Batch => runner.run_batch()?,
        Command::Online => runner.run_online()?,
    };

    info!("📊 {}", serde_json::to_string(&summary)?);
    if matches!(cli.command, Command::Batch) {
        runner.store().optimize()?;
    }
    Ok(())
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "pingscope_backend=info,pingscope=info".into()),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
