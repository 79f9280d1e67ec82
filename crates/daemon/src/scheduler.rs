//! Periodic federation runs.
//!
//! Two independent timers drive the engine: a full reconciliation and an
//! updated-since pass. A period of zero disables its timer. A tick that lands
//! while a run is still in progress is skipped rather than queued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{error, info, warn};

use restfed_core::errors::SyncError;
use restfed_core::models::SyncResult;
use restfed_core::SyncEngine;

/// Which kind of run a timer triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Full,
    Changed,
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Changed => write!(f, "changed"),
        }
    }
}

/// Tracks aggregate statistics across runs.
#[derive(Default)]
pub struct SchedulerStats {
    pub total_runs: AtomicU64,
    pub total_failed_records: AtomicU64,
    pub total_errors: AtomicU64,
    pub consecutive_errors: AtomicU64,
}

/// The sync scheduler.
pub struct Scheduler {
    sync_engine: Arc<SyncEngine>,
    full_period: Option<Duration>,
    changed_period: Option<Duration>,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    /// Periods are in seconds; zero disables the timer.
    pub fn new(sync_engine: Arc<SyncEngine>, full_secs: u64, changed_secs: u64) -> Self {
        let period = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        Self {
            sync_engine,
            full_period: period(full_secs),
            changed_period: period(changed_secs),
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Whether at least one timer is enabled.
    pub fn has_timers(&self) -> bool {
        self.full_period.is_some() || self.changed_period.is_some()
    }

    /// Main scheduler loop; returns once `shutdown` is notified.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        info!(
            full_period_secs = self.full_period.map(|d| d.as_secs()).unwrap_or(0),
            changed_period_secs = self.changed_period.map(|d| d.as_secs()).unwrap_or(0),
            "scheduler started"
        );

        let mut full = self.full_period.map(start_interval);
        let mut changed = self.changed_period.map(start_interval);

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("scheduler stopping");
                    return;
                }
                _ = next_tick(&mut full) => {
                    self.run_once(RunKind::Full).await;
                }
                _ = next_tick(&mut changed) => {
                    self.run_once(RunKind::Changed).await;
                }
            }
        }
    }

    /// Run one sync of `kind` and fold its outcome into the stats.
    pub async fn run_once(&self, kind: RunKind) -> Option<SyncResult> {
        let run = self.stats.total_runs.fetch_add(1, Ordering::SeqCst) + 1;
        info!(run, %kind, "starting sync run");

        let outcome = match kind {
            RunKind::Full => self.sync_engine.sync_full().await,
            RunKind::Changed => self.sync_engine.sync_changed().await,
        };

        match outcome {
            Ok(result) => {
                self.stats.consecutive_errors.store(0, Ordering::SeqCst);
                self.stats
                    .total_failed_records
                    .fetch_add(result.failed as u64, Ordering::SeqCst);
                info!(
                    run,
                    %kind,
                    added = result.added,
                    updated = result.updated,
                    failed = result.failed,
                    ignored = result.ignored,
                    "sync run completed"
                );
                Some(result)
            }
            Err(SyncError::AlreadyRunning { started_at }) => {
                warn!(run, %kind, %started_at, "skipping sync run: previous run still in progress");
                None
            }
            Err(e) => {
                let errors = self.stats.total_errors.fetch_add(1, Ordering::SeqCst) + 1;
                let consecutive = self.stats.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                error!(
                    run,
                    %kind,
                    error = %e,
                    total_errors = errors,
                    consecutive_errors = consecutive,
                    "sync run failed"
                );
                None
            }
        }
    }
}

fn start_interval(period: Duration) -> Interval {
    // First tick is one full period away.
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Resolves on the next tick, or never when the timer is disabled.
async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
