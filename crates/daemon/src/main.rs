//! restfed daemon entry point.
//!
//! Loads configuration, opens the identity store, wires the directory client,
//! notifier and sync engine together, then either performs a single run or
//! drives periodic runs until shutdown.

mod scheduler;
mod signals;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use restfed_core::config::AppConfig;
use restfed_core::notify::{EmailActionNotifier, ProvisionNotifier};
use restfed_core::store::{Database, SqliteIdentityStore};
use restfed_core::{RestDirectoryClient, SyncEngine};

use scheduler::Scheduler;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OnceMode {
    /// Reconcile the whole remote collection.
    Full,
    /// Reconcile records changed since the last recorded run.
    Changed,
}

/// restfed federation daemon.
#[derive(Parser, Debug)]
#[command(
    name = "restfed-daemon",
    version,
    about = "One-way REST user directory to local identity store federation"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Perform a single run and exit.
    #[arg(long, value_enum, conflicts_with = "since")]
    once: Option<OnceMode>,

    /// Perform a single run over records changed since this RFC 3339 instant and exit.
    #[arg(long, value_parser = parse_since)]
    since: Option<DateTime<Utc>>,
}

fn parse_since(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 timestamp: {}", e))
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config =
        AppConfig::load_and_resolve(&args.config).context("failed to load configuration")?;

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .init();

    info!("========================================");
    info!("  restfed daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file     : {}", args.config.display());
    info!("Directory URL   : {}", config.remote.url);
    info!("Source          : {} ({})", config.remote.source_name, config.remote.source_id);
    info!("Full period     : {}s", config.daemon.full_sync_period_secs);
    info!("Changed period  : {}s", config.daemon.changed_sync_period_secs);
    info!("Data dir        : {}", config.daemon.data_dir.display());
    info!("Log level       : {}", log_level);
    info!("========================================");

    std::fs::create_dir_all(&config.daemon.data_dir).context("failed to create data directory")?;

    let db_path = config.daemon.data_dir.join("restfed.db");
    let db = Arc::new(Database::new(&db_path).context("failed to open database")?);
    db.initialize()
        .context("failed to initialize database schema")?;
    info!("Database initialized at {}", db_path.display());

    let store = Arc::new(SqliteIdentityStore::new(db.clone()));
    if let Some(ref client) = config.roles.client {
        store
            .register_client(client)
            .context("failed to register role client")?;
    }

    let directory = Arc::new(
        RestDirectoryClient::new(&config.remote).context("failed to build directory client")?,
    );

    let mut engine = SyncEngine::new(config.clone(), directory, store, db);
    if let Some(notifier) = build_notifier(&config) {
        engine = engine.with_notifier(notifier);
    }
    let engine = Arc::new(engine);

    let scheduler = Scheduler::new(
        engine.clone(),
        config.daemon.full_sync_period_secs,
        config.daemon.changed_sync_period_secs,
    );

    // One-shot modes.
    let one_shot = match (args.once, args.since) {
        (_, Some(since)) => Some(engine.sync_since(since).await),
        (Some(OnceMode::Full), None) => Some(engine.sync_full().await),
        (Some(OnceMode::Changed), None) => Some(engine.sync_changed().await),
        (None, None) if !scheduler.has_timers() => {
            warn!("no sync period configured, running a single full sync");
            Some(engine.sync_full().await)
        }
        (None, None) => None,
    };
    if let Some(outcome) = one_shot {
        let result = outcome.context("sync run failed")?;
        info!(%result, "sync run finished");
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let scheduler_shutdown = shutdown.clone();
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(scheduler_shutdown).await;
        scheduler
    });

    signals::wait_for_shutdown().await;
    info!("Shutdown signal received, stopping...");

    // notify_one keeps the permit if the scheduler is mid-run.
    shutdown.notify_one();

    match tokio::time::timeout(Duration::from_secs(30), scheduler_handle).await {
        Ok(Ok(scheduler)) => {
            let stats = scheduler.stats();
            info!(
                runs = stats.total_runs.load(Ordering::SeqCst),
                errors = stats.total_errors.load(Ordering::SeqCst),
                "scheduler stopped gracefully"
            );
        }
        Ok(Err(e)) => warn!("scheduler task error: {}", e),
        Err(_) => warn!("scheduler did not stop within 30s, forcing shutdown"),
    }

    info!("restfed daemon stopped.");
    Ok(())
}

/// Email notifier for post-creation actions, when any are configured.
fn build_notifier(config: &AppConfig) -> Option<Arc<dyn ProvisionNotifier>> {
    let actions = config.provisioning.reset_actions();
    if actions.is_empty() {
        return None;
    }
    match EmailActionNotifier::new(&config.notifications, &config.provisioning) {
        Ok(notifier) => {
            info!(
                actions = actions.len(),
                "post-creation action emails enabled"
            );
            Some(Arc::new(notifier))
        }
        Err(e) => {
            warn!(error = %e, "post-creation actions configured but email notifier unavailable");
            None
        }
    }
}
