//! AlarmSrv main program
//!
//! Runs the alert engine, or performs one-off maintenance commands against
//! the alert database.

use alarmsrv::config::AlarmConfig;
use alarmsrv::service;
use alarmsrv::store::{AlertStore, SqliteStore};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "AlarmSrv - water-quality alerting service")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", default_value = "config/alarmsrv.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the alert engine (default)
    Run,
    /// Validate configuration and database access
    Check,
    /// Acknowledge a triggered alert, stopping its escalation
    Ack {
        history_id: i64,
        /// Acknowledging user id
        #[arg(short, long)]
        user: i64,
    },
    /// Exclude a rule from evaluation for a while
    Snooze {
        rule_id: i64,
        #[arg(short, long, default_value_t = 60)]
        minutes: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = AlarmConfig::load(Some(args.config.as_path()))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let _log_guard = common::init_logging(&config.logging).context("failed to initialize logging")?;

    info!("AlarmSrv v{}", env!("CARGO_PKG_VERSION"));

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let cancel = CancellationToken::new();
            common::shutdown::cancel_on_shutdown(cancel.clone());
            service::run(config, cancel).await?;
        },
        Commands::Check => check(&config).await?,
        Commands::Ack { history_id, user } => {
            let store = open_store(&config).await?;
            if store.acknowledge_alert(history_id, user).await? {
                info!("Alert {} acknowledged by user {}", history_id, user);
            } else {
                warn!("Alert {} is not in the triggered state, nothing changed", history_id);
            }
        },
        Commands::Snooze { rule_id, minutes } => {
            let store = open_store(&config).await?;
            if store.snooze_rule(rule_id, minutes).await? {
                info!("Rule {} snoozed for {} minute(s)", rule_id, minutes);
            } else {
                warn!("Rule {} not found", rule_id);
            }
        },
    }
    Ok(())
}

async fn open_store(config: &AlarmConfig) -> Result<SqliteStore> {
    let store = SqliteStore::connect(&config.database.path, config.database.max_connections)
        .await
        .with_context(|| format!("failed to open database {}", config.database.path))?;
    store.migrate().await?;
    Ok(store)
}

async fn check(config: &AlarmConfig) -> Result<()> {
    info!("Configuration OK");
    let store = open_store(config).await?;
    let rules = store.active_rules(alarmsrv::store::local_now()).await?;
    info!("Database OK, {} active rule(s)", rules.len());
    match store.latest_measurement().await? {
        Some(m) => info!(
            "Latest measurement #{} has {} parameter(s)",
            m.id,
            m.readings.len()
        ),
        None => warn!("No measurements recorded yet"),
    }
    Ok(())
}
