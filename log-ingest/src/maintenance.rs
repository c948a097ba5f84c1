//! Periodic index rebuild and retention purge for the log store.
//!
//! One background task runs a maintenance pass on a fixed delay. The pass
//! itself is blocking file work and runs on the blocking pool; a failed or
//! panicking pass is counted and the schedule carries on.

use crate::config::MaintenanceConfig;
use crate::metrics_defs::{
    INDEX_REBUILD_DURATION, INDEX_REBUILD_FAILURES, INDEX_REBUILD_FILES, RETENTION_PURGED,
};
use crate::store::{LogStore, StoreError};
use serde::Serialize;
use shared::{counter, histogram};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

/// Snapshot of the maintenance counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceMetrics {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub rebuilt_file_count: u64,
    pub purged_file_count: u64,
    pub average_duration_ms: f64,
    pub last_run_epoch_ms: Option<u64>,
}

/// Outcome of a single pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub success: bool,
    pub rebuilt_files: usize,
    pub purged_files: usize,
    pub duration_ms: u64,
}

#[derive(Default)]
struct Counters {
    runs: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rebuilt_files: AtomicU64,
    purged_files: AtomicU64,
    total_duration_ms: AtomicU64,
    last_run_epoch_ms: AtomicU64,
}

struct MaintenanceInner {
    store: Arc<LogStore>,
    config: MaintenanceConfig,
    counters: Counters,
}

enum Command {
    Shutdown(oneshot::Sender<()>),
}

pub struct IndexMaintenance {
    inner: Arc<MaintenanceInner>,
    cmd_tx: Option<mpsc::Sender<Command>>,
}

impl IndexMaintenance {
    /// Starts the scheduled worker when maintenance is enabled. On-demand
    /// runs are available either way.
    pub fn start(store: Arc<LogStore>, config: MaintenanceConfig) -> Self {
        let interval = config.interval();
        let enabled = config.enabled;
        let inner = Arc::new(MaintenanceInner {
            store,
            config,
            counters: Counters::default(),
        });

        let cmd_tx = enabled.then(|| spawn_worker(inner.clone(), interval));
        if enabled {
            tracing::info!(interval_secs = interval.as_secs(), "Index maintenance scheduled");
        } else {
            tracing::info!("Index maintenance disabled");
        }

        IndexMaintenance { inner, cmd_tx }
    }

    /// Runs one pass now and waits for it. Counts towards the same metrics
    /// as scheduled runs.
    pub async fn rebuild_once(&self) -> RunReport {
        self.inner.clone().run().await
    }

    pub fn metrics(&self) -> MaintenanceMetrics {
        let c = &self.inner.counters;
        let runs = c.runs.load(Ordering::Relaxed);
        let total = c.total_duration_ms.load(Ordering::Relaxed);
        let last_run = c.last_run_epoch_ms.load(Ordering::Relaxed);

        MaintenanceMetrics {
            enabled: self.inner.config.enabled,
            interval_seconds: self.inner.config.interval().as_secs(),
            run_count: runs,
            success_count: c.successes.load(Ordering::Relaxed),
            failure_count: c.failures.load(Ordering::Relaxed),
            rebuilt_file_count: c.rebuilt_files.load(Ordering::Relaxed),
            purged_file_count: c.purged_files.load(Ordering::Relaxed),
            average_duration_ms: if runs == 0 {
                0.0
            } else {
                total as f64 / runs as f64
            },
            last_run_epoch_ms: (last_run > 0).then_some(last_run),
        }
    }

    /// Stops the scheduled worker after any pass in progress. Idempotent.
    pub async fn shutdown(&self) {
        let Some(cmd_tx) = &self.cmd_tx else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        if cmd_tx.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

impl MaintenanceInner {
    async fn run(self: Arc<Self>) -> RunReport {
        let started = Instant::now();
        let this = self.clone();
        let result = tokio::task::spawn_blocking(move || this.run_blocking()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let c = &self.counters;
        c.runs.fetch_add(1, Ordering::Relaxed);
        c.total_duration_ms.fetch_add(duration_ms, Ordering::Relaxed);
        c.last_run_epoch_ms
            .store(call_log::now_epoch_ms(), Ordering::Relaxed);
        histogram!(INDEX_REBUILD_DURATION).record(started.elapsed().as_secs_f64());

        let (rebuilt, purged) = match result {
            Ok(Ok(counts)) => counts,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Index maintenance failed");
                return self.failed(duration_ms);
            }
            Err(e) => {
                tracing::error!(error = %e, "Index maintenance task panicked");
                return self.failed(duration_ms);
            }
        };

        c.successes.fetch_add(1, Ordering::Relaxed);
        c.rebuilt_files.fetch_add(rebuilt as u64, Ordering::Relaxed);
        c.purged_files.fetch_add(purged as u64, Ordering::Relaxed);
        counter!(INDEX_REBUILD_FILES).increment(rebuilt as u64);
        counter!(RETENTION_PURGED).increment(purged as u64);
        tracing::debug!(rebuilt, purged, duration_ms, "Index maintenance finished");

        RunReport {
            success: true,
            rebuilt_files: rebuilt,
            purged_files: purged,
            duration_ms,
        }
    }

    fn run_blocking(&self) -> Result<(usize, usize), StoreError> {
        // Purge first so no time is spent indexing files about to be deleted.
        let purged = if self.config.purge_enabled {
            self.store.purge_expired()
        } else {
            0
        };
        let rebuilt = self.store.try_rebuild_indexes()?;
        Ok((rebuilt, purged))
    }

    fn failed(&self, duration_ms: u64) -> RunReport {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        counter!(INDEX_REBUILD_FAILURES).increment(1);
        RunReport {
            success: false,
            rebuilt_files: 0,
            purged_files: 0,
            duration_ms,
        }
    }
}

fn spawn_worker(inner: Arc<MaintenanceInner>, interval: Duration) -> mpsc::Sender<Command> {
    let (cmd_tx, mut cmd_rx) = mpsc::channel(1);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    inner.clone().run().await;
                }
                cmd = cmd_rx.recv() => {
                    if let Some(Command::Shutdown(reply)) = cmd {
                        let _ = reply.send(());
                    }
                    break;
                }
            }
        }
        tracing::info!("Index maintenance stopped");
    });

    cmd_tx
}
