//! Periodic governance sync against the config center.
//!
//! Each tick runs only while this instance holds the lease:
//! 1. fetch a snapshot newer than the one in the registry and swap it in;
//! 2. apply the contract allowlist it carries and report the result back;
//! 3. page through the finalize feed and acknowledge newly finalized releases;
//! 4. persist the sync state.
//!
//! A tick works on a copy of the sync state and only commits it once every
//! step succeeded, so a failed tick is retried from the same cursor. The lease
//! is confirmed again right before acknowledging and before persisting; a tick
//! that lost it aborts with [`SyncError::LeaseLost`].

use crate::config::{Config, FinalizeConfig, FinalizeRecovery, GovernanceConfig, StartupConfig};
use crate::lease::{LeaseManager, LeaseMode};
use crate::metrics_defs::{
    SYNC_FEEDBACK_FAILURES, SYNC_FINALIZE_ACKED, SYNC_GOVERNANCE_RESULT,
    SYNC_INVALID_CURSOR, SYNC_INVALID_CURSOR_FAIL_FAST, SYNC_SNAPSHOT_APPLIED,
    SYNC_SNAPSHOT_VERSION, SYNC_TICK_DURATION, SYNC_TICKS,
};
use crate::registry::ConfigRegistry;
use crate::remote_config::{ConfigCenter, RemoteConfigError};
use crate::sync_state::{SyncState, SyncStateError, SyncStateStore};
use crate::types::{FinalizeAck, GovernanceFeedback, IngestionGovernance};
use call_log::contract::{AllowlistValidation, ContractAllowlist};
use serde::Serialize;
use shared::{counter, gauge, histogram};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

/// Receiver of the ingestion governance carried by snapshots.
pub trait GovernanceSyncApplier: Send + Sync {
    fn validate(&self, proposed: &[String]) -> AllowlistValidation;

    /// Applies `proposed` if it is valid. The error carries the violations.
    fn apply(&self, proposed: &[String]) -> Result<AllowlistValidation, AllowlistValidation>;
}

impl GovernanceSyncApplier for ContractAllowlist {
    fn validate(&self, proposed: &[String]) -> AllowlistValidation {
        ContractAllowlist::validate(self, proposed)
    }

    fn apply(&self, proposed: &[String]) -> Result<AllowlistValidation, AllowlistValidation> {
        ContractAllowlist::apply(self, proposed)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("config center error: {0}")]
    Remote(#[from] RemoteConfigError),

    #[error("sync state error: {0}")]
    State(#[from] SyncStateError),

    #[error("snapshot version {version} rejected: {reason}")]
    InvalidSnapshot { version: u64, reason: String },

    #[error("finalize cursor rejected by the config center")]
    InvalidCursor,

    #[error("governance lease lost during the tick")]
    LeaseLost,

    #[error("startup check failed after {attempts} attempts: {last_error}")]
    StartupCheckFailed { attempts: u32, last_error: String },

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("sync service is shut down")]
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another instance holds the lease.
    NotLeader,
    Synced(TickReport),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Version of the snapshot applied by this tick, if any
    pub applied_version: Option<u64>,
    /// Whether the snapshot's contract allowlist was applied
    pub governance_applied: Option<bool>,
    pub finalized_releases: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub tick_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub not_leader_count: u64,
    pub snapshots_applied: u64,
    pub current_version: Option<u64>,
    pub governance_applied_count: u64,
    pub governance_rejected_count: u64,
    pub feedback_failure_count: u64,
    pub finalize_acked_count: u64,
    pub invalid_cursor_count: u64,
    pub invalid_cursor_fail_fast_count: u64,
    pub lease_mode: LeaseMode,
    pub last_success_epoch_ms: Option<u64>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    not_leader: AtomicU64,
    snapshots_applied: AtomicU64,
    governance_applied: AtomicU64,
    governance_rejected: AtomicU64,
    feedback_failures: AtomicU64,
    finalize_acked: AtomicU64,
    invalid_cursors: AtomicU64,
    invalid_cursor_fail_fast: AtomicU64,
    last_success_epoch_ms: AtomicU64,
}

/// Collaborators of the sync service, resolved by the caller.
pub struct SyncComponents {
    pub center: Arc<dyn ConfigCenter>,
    pub lease: Arc<LeaseManager>,
    pub registry: Arc<ConfigRegistry>,
    pub applier: Option<Arc<dyn GovernanceSyncApplier>>,
    pub state_store: Arc<SyncStateStore>,
}

struct SyncInner {
    center: Arc<dyn ConfigCenter>,
    lease: Arc<LeaseManager>,
    registry: Arc<ConfigRegistry>,
    applier: Option<Arc<dyn GovernanceSyncApplier>>,
    state_store: Arc<SyncStateStore>,
    /// Committed state. Held for the whole tick so ticks never overlap.
    state: tokio::sync::Mutex<SyncState>,
    governance: GovernanceConfig,
    finalize: FinalizeConfig,
    counters: Counters,
    last_error: parking_lot::Mutex<Option<String>>,
}

enum Command {
    Refresh(oneshot::Sender<Result<TickOutcome, SyncError>>),
    Shutdown(oneshot::Sender<()>),
}

pub struct RemoteConfigSyncService {
    inner: Arc<SyncInner>,
    cmd_tx: mpsc::Sender<Command>,
}

impl RemoteConfigSyncService {
    /// Loads the persisted state, runs the startup check if enabled and
    /// schedules the periodic sync. Fails if every startup attempt fails.
    pub async fn start(components: SyncComponents, config: &Config) -> Result<Self, SyncError> {
        let store = components.state_store.clone();
        let state = tokio::task::spawn_blocking(move || store.load())
            .await??
            .unwrap_or_default();
        tracing::info!(
            finalized = state.finalized_states.len(),
            pending = state.pending_states.len(),
            cursor = ?state.finalize_cursor,
            "Loaded governance sync state"
        );

        let inner = Arc::new(SyncInner {
            center: components.center,
            lease: components.lease,
            registry: components.registry,
            applier: components.applier,
            state_store: components.state_store,
            state: tokio::sync::Mutex::new(state),
            governance: config.governance.clone(),
            finalize: config.finalize.clone(),
            counters: Counters::default(),
            last_error: parking_lot::Mutex::new(None),
        });

        if config.startup.check_enabled {
            inner.startup_check(&config.startup).await?;
        }

        let interval = config.interval();
        let cmd_tx = spawn_worker(inner.clone(), interval);
        tracing::info!(interval_secs = interval.as_secs(), "Governance sync scheduled");

        Ok(RemoteConfigSyncService { inner, cmd_tx })
    }

    /// Runs a tick now and waits for its outcome.
    pub async fn refresh(&self) -> Result<TickOutcome, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Refresh(tx))
            .await
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    pub fn stats(&self) -> SyncStats {
        let c = &self.inner.counters;
        let last_success = c.last_success_epoch_ms.load(Ordering::Relaxed);

        SyncStats {
            tick_count: c.ticks.load(Ordering::Relaxed),
            success_count: c.successes.load(Ordering::Relaxed),
            failure_count: c.failures.load(Ordering::Relaxed),
            not_leader_count: c.not_leader.load(Ordering::Relaxed),
            snapshots_applied: c.snapshots_applied.load(Ordering::Relaxed),
            current_version: self.inner.registry.version(),
            governance_applied_count: c.governance_applied.load(Ordering::Relaxed),
            governance_rejected_count: c.governance_rejected.load(Ordering::Relaxed),
            feedback_failure_count: c.feedback_failures.load(Ordering::Relaxed),
            finalize_acked_count: c.finalize_acked.load(Ordering::Relaxed),
            invalid_cursor_count: c.invalid_cursors.load(Ordering::Relaxed),
            invalid_cursor_fail_fast_count: c.invalid_cursor_fail_fast.load(Ordering::Relaxed),
            lease_mode: self.inner.lease.last_acquire_mode(),
            last_success_epoch_ms: (last_success > 0).then_some(last_success),
            last_error: self.inner.last_error.lock().clone(),
        }
    }

    /// Stops the worker after the tick in progress and gives up the lease.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
        self.inner.lease.release().await;
    }
}

impl SyncInner {
    async fn startup_check(&self, startup: &StartupConfig) -> Result<(), SyncError> {
        let delay = Duration::from_millis(startup.retry_delay_ms);
        let mut last_error = String::new();

        for attempt in 1..=startup.max_attempts {
            match self.run_tick().await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, max_attempts = startup.max_attempts, error = %e, "Startup sync failed");
                    last_error = e.to_string();
                }
            }
            if attempt < startup.max_attempts {
                sleep(delay).await;
            }
        }

        Err(SyncError::StartupCheckFailed {
            attempts: startup.max_attempts,
            last_error,
        })
    }

    /// One tick with its bookkeeping.
    async fn run_tick(&self) -> Result<TickOutcome, SyncError> {
        let started = Instant::now();
        let result = self.tick().await;
        histogram!(SYNC_TICK_DURATION).record(started.elapsed().as_secs_f64());

        let c = &self.counters;
        c.ticks.fetch_add(1, Ordering::Relaxed);
        match &result {
            Ok(TickOutcome::NotLeader) => {
                c.not_leader.fetch_add(1, Ordering::Relaxed);
                counter!(SYNC_TICKS, "outcome" => "not_leader").increment(1);
            }
            Ok(TickOutcome::Synced(report)) => {
                c.successes.fetch_add(1, Ordering::Relaxed);
                c.last_success_epoch_ms
                    .store(call_log::now_epoch_ms(), Ordering::Relaxed);
                *self.last_error.lock() = None;
                counter!(SYNC_TICKS, "outcome" => "success").increment(1);
                tracing::debug!(
                    applied_version = ?report.applied_version,
                    finalized = report.finalized_releases,
                    "Governance sync tick finished"
                );
            }
            Err(e) => {
                c.failures.fetch_add(1, Ordering::Relaxed);
                *self.last_error.lock() = Some(e.to_string());
                counter!(SYNC_TICKS, "outcome" => "failure").increment(1);
                tracing::error!(error = %e, "Governance sync tick failed");
            }
        }
        result
    }

    async fn tick(&self) -> Result<TickOutcome, SyncError> {
        let mut committed = self.state.lock().await;
        if !self.lease.try_acquire().await {
            return Ok(TickOutcome::NotLeader);
        }

        let mut state = committed.clone();
        let mut report = TickReport::default();

        if let Some(snapshot) = self
            .center
            .fetch_snapshot(self.registry.version())
            .await?
        {
            let version = snapshot.version;
            snapshot
                .validate()
                .map_err(|reason| SyncError::InvalidSnapshot { version, reason })?;

            let governance = snapshot.ingestion_governance.clone();
            self.registry.replace(snapshot);
            state.last_applied_version = Some(version);
            report.applied_version = Some(version);
            self.counters.snapshots_applied.fetch_add(1, Ordering::Relaxed);
            counter!(SYNC_SNAPSHOT_APPLIED).increment(1);
            gauge!(SYNC_SNAPSHOT_VERSION).set(version as f64);
            tracing::info!(version, "Applied governance snapshot");

            if self.governance.enabled
                && let Some(governance) = governance
            {
                report.governance_applied = self.apply_governance(version, &governance).await;
            }
        }

        if self.finalize.enabled {
            report.finalized_releases = self.reconcile_finalize(&mut state).await?;
        }

        if !self.lease.confirm().await {
            return Err(SyncError::LeaseLost);
        }
        let store = self.state_store.clone();
        let to_save = state.clone();
        tokio::task::spawn_blocking(move || store.save(&to_save)).await??;
        *committed = state;

        Ok(TickOutcome::Synced(report))
    }

    /// Returns whether the allowlist was applied, or `None` without an applier.
    async fn apply_governance(&self, version: u64, governance: &IngestionGovernance) -> Option<bool> {
        let applier = self.applier.as_ref()?;

        let validation = applier.validate(&governance.contract_allowlist);
        let (applied, validation) = if validation.valid {
            match applier.apply(&governance.contract_allowlist) {
                Ok(report) => (true, report),
                Err(report) => (false, report),
            }
        } else {
            (false, validation)
        };

        if applied {
            self.counters.governance_applied.fetch_add(1, Ordering::Relaxed);
            counter!(SYNC_GOVERNANCE_RESULT, "result" => "applied").increment(1);
            tracing::info!(
                release_id = %governance.release_id,
                versions = ?validation.proposed_versions,
                "Applied contract allowlist"
            );
        } else {
            self.counters.governance_rejected.fetch_add(1, Ordering::Relaxed);
            counter!(SYNC_GOVERNANCE_RESULT, "result" => "rejected").increment(1);
            tracing::warn!(
                release_id = %governance.release_id,
                errors = ?validation.errors,
                "Rejected contract allowlist"
            );
        }

        if self.governance.feedback_enabled {
            let feedback = GovernanceFeedback {
                release_id: governance.release_id.clone(),
                snapshot_version: version,
                applied,
                current_versions: validation.current_versions,
                errors: validation.errors,
                reported_at_epoch_ms: call_log::now_epoch_ms(),
            };
            if let Err(e) = self.center.send_feedback(&feedback).await {
                self.counters.feedback_failures.fetch_add(1, Ordering::Relaxed);
                counter!(SYNC_FEEDBACK_FAILURES).increment(1);
                tracing::warn!(release_id = %governance.release_id, error = %e, "Failed to send governance feedback");
            }
        }

        Some(applied)
    }

    /// Pulls up to `max_pages_per_tick` pages of the finalize feed into
    /// `state` and acknowledges the releases that became finalized.
    async fn reconcile_finalize(&self, state: &mut SyncState) -> Result<usize, SyncError> {
        let max_finalized = self.state_store.max_finalized();
        let max_pending = self.state_store.max_pending();
        let mut newly_finalized = Vec::new();
        let mut reset = false;
        let mut pages = 0;

        while pages < self.finalize.max_pages_per_tick {
            let page = match self
                .center
                .pull_finalize(state.finalize_cursor.as_deref(), self.finalize.page_size)
                .await
            {
                Ok(page) => page,
                Err(RemoteConfigError::InvalidCursor) => {
                    self.invalid_cursor(state.finalize_cursor.as_deref());
                    match self.finalize.recovery {
                        FinalizeRecovery::ResetToStart if !reset && state.finalize_cursor.is_some() => {
                            reset = true;
                            state.finalize_cursor = None;
                            continue;
                        }
                        FinalizeRecovery::ResetToStart => return Err(SyncError::InvalidCursor),
                        FinalizeRecovery::FailFast => {
                            self.counters
                                .invalid_cursor_fail_fast
                                .fetch_add(1, Ordering::Relaxed);
                            counter!(SYNC_INVALID_CURSOR_FAIL_FAST).increment(1);
                            return Err(SyncError::InvalidCursor);
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            };
            pages += 1;

            for record in page.items {
                let release_id = record.release_id.clone();
                if state.record(record, max_finalized, max_pending) {
                    newly_finalized.push(release_id);
                }
            }
            if page.next_cursor.is_some() {
                state.finalize_cursor = page.next_cursor;
            }
            if !page.has_more {
                break;
            }
        }

        if newly_finalized.is_empty() {
            return Ok(0);
        }

        if !self.lease.confirm().await {
            return Err(SyncError::LeaseLost);
        }
        let count = newly_finalized.len();
        self.center
            .ack_finalize(&FinalizeAck {
                release_ids: newly_finalized,
                holder_id: self.lease.holder_id().to_string(),
            })
            .await?;
        self.counters
            .finalize_acked
            .fetch_add(count as u64, Ordering::Relaxed);
        counter!(SYNC_FINALIZE_ACKED).increment(count as u64);
        tracing::info!(count, "Acknowledged finalized releases");
        Ok(count)
    }

    fn invalid_cursor(&self, cursor: Option<&str>) {
        let count = self.counters.invalid_cursors.fetch_add(1, Ordering::Relaxed) + 1;
        counter!(SYNC_INVALID_CURSOR).increment(1);

        if count % self.finalize.invalid_cursor_warn_every.max(1) == 0 {
            tracing::warn!(cursor = ?cursor, count, recovery = ?self.finalize.recovery, "Invalid finalize cursor");
        } else {
            tracing::debug!(cursor = ?cursor, count, "Invalid finalize cursor");
        }
    }
}

fn spawn_worker(inner: Arc<SyncInner>, interval: Duration) -> mpsc::Sender<Command> {
    let (cmd_tx, mut cmd_rx) = mpsc::channel(8);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    // Failures are counted and logged; the schedule carries on.
                    let _ = inner.run_tick().await;
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Refresh(reply)) => {
                        let _ = reply.send(inner.run_tick().await);
                    }
                    Some(Command::Shutdown(reply)) => {
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                }
            }
        }
        tracing::info!("Governance sync stopped");
    });

    cmd_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteLeaseConfig;
    use crate::lease::{LeaseError, RemoteLeaseClient};
    use crate::types::{
        FinalizePage, FinalizeRecord, FinalizeStatus, GovernanceSnapshot, ModelConfig,
    };
    use async_trait::async_trait;
    use call_log::config::ContractPolicy;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tempfile::TempDir;

    /// Remote lease that is granted until `lost` is set.
    #[derive(Default)]
    struct FakeLease {
        lost: AtomicBool,
    }

    #[async_trait]
    impl RemoteLeaseClient for FakeLease {
        async fn acquire(&self, _key: &str, _holder: &str, _ttl: u64) -> Result<bool, LeaseError> {
            Ok(!self.lost.load(Ordering::SeqCst))
        }

        async fn renew(&self, _key: &str, _holder: &str, _ttl: u64) -> Result<bool, LeaseError> {
            Ok(!self.lost.load(Ordering::SeqCst))
        }

        async fn release(&self, _key: &str, _holder: &str) -> Result<(), LeaseError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeCenter {
        snapshot: Mutex<Option<GovernanceSnapshot>>,
        failing_fetches: AtomicUsize,
        fetch_calls: AtomicUsize,
        pages: Mutex<HashMap<Option<String>, FinalizePage>>,
        invalid_cursors: Mutex<HashSet<String>>,
        feedback: Mutex<Vec<GovernanceFeedback>>,
        acks: Mutex<Vec<FinalizeAck>>,
        /// Taken over by another holder while the snapshot is fetched.
        lose_lease_on_fetch: Mutex<Option<Arc<FakeLease>>>,
    }

    #[async_trait]
    impl ConfigCenter for FakeCenter {
        async fn fetch_snapshot(
            &self,
            known_version: Option<u64>,
        ) -> Result<Option<GovernanceSnapshot>, RemoteConfigError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(lease) = self.lose_lease_on_fetch.lock().as_ref() {
                lease.lost.store(true, Ordering::SeqCst);
            }
            if self
                .failing_fetches
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RemoteConfigError::UnexpectedStatus(503));
            }
            Ok(self
                .snapshot
                .lock()
                .clone()
                .filter(|s| known_version.is_none_or(|known| s.version > known)))
        }

        async fn send_feedback(&self, feedback: &GovernanceFeedback) -> Result<(), RemoteConfigError> {
            self.feedback.lock().push(feedback.clone());
            Ok(())
        }

        async fn pull_finalize(
            &self,
            cursor: Option<&str>,
            _limit: usize,
        ) -> Result<FinalizePage, RemoteConfigError> {
            if cursor.is_some_and(|c| self.invalid_cursors.lock().contains(c)) {
                return Err(RemoteConfigError::InvalidCursor);
            }
            Ok(self
                .pages
                .lock()
                .get(&cursor.map(String::from))
                .cloned()
                .unwrap_or_default())
        }

        async fn ack_finalize(&self, ack: &FinalizeAck) -> Result<(), RemoteConfigError> {
            self.acks.lock().push(ack.clone());
            Ok(())
        }
    }

    struct Harness {
        _dir: TempDir,
        config: Config,
        center: Arc<FakeCenter>,
        registry: Arc<ConfigRegistry>,
        allowlist: Arc<ContractAllowlist>,
        store: Arc<SyncStateStore>,
        remote_lease: Option<Arc<FakeLease>>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let yaml = format!(
                r#"
remote:
    base_url: "http://localhost"
    api_key: key
lease:
    lock_path: "{}"
state:
    path: "{}"
interval_secs: 3600
startup:
    max_attempts: 3
    retry_delay_ms: 1
"#,
                dir.path().join("sync.lock").display(),
                dir.path().join("state.json").display()
            );
            let config: Config = serde_yaml::from_str(&yaml).unwrap();

            Harness {
                center: Arc::new(FakeCenter::default()),
                registry: Arc::new(ConfigRegistry::new()),
                allowlist: Arc::new(ContractAllowlist::new(&ContractPolicy::default())),
                store: Arc::new(SyncStateStore::new(&config.state)),
                remote_lease: None,
                config,
                _dir: dir,
            }
        }

        fn with_remote_lease(mut self) -> Self {
            self.config.lease.remote = Some(RemoteLeaseConfig {
                key: "sync".into(),
                ttl_seconds: 30,
            });
            self.remote_lease = Some(Arc::new(FakeLease::default()));
            self
        }

        async fn start(&self) -> Result<RemoteConfigSyncService, SyncError> {
            RemoteConfigSyncService::start(
                SyncComponents {
                    center: self.center.clone(),
                    lease: Arc::new(LeaseManager::new(
                        &self.config.lease,
                        self.remote_lease
                            .clone()
                            .map(|lease| lease as Arc<dyn RemoteLeaseClient>),
                    )),
                    registry: self.registry.clone(),
                    applier: Some(self.allowlist.clone()),
                    state_store: self.store.clone(),
                },
                &self.config,
            )
            .await
        }

        fn lock_path(&self) -> &Path {
            &self.config.lease.lock_path
        }
    }

    fn snapshot(version: u64, allowlist: &[&str]) -> GovernanceSnapshot {
        GovernanceSnapshot {
            version,
            models: vec![ModelConfig {
                name: "gpt".into(),
                provider: "openai".into(),
                base_url: None,
                enabled: true,
            }],
            operation_model_mapping: BTreeMap::from([("chat".into(), "gpt".into())]),
            ingestion_governance: Some(IngestionGovernance {
                release_id: format!("release-{version}"),
                contract_allowlist: allowlist.iter().map(|v| v.to_string()).collect(),
            }),
            ..GovernanceSnapshot::default()
        }
    }

    fn finalize_record(release_id: &str, status: FinalizeStatus) -> FinalizeRecord {
        FinalizeRecord {
            release_id: release_id.into(),
            status,
            updated_at_epoch_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_applies_snapshot_and_governance() {
        let harness = Harness::new();
        *harness.center.snapshot.lock() = Some(snapshot(3, &["v1", "v2"]));

        let service = harness.start().await.unwrap();
        assert_eq!(harness.registry.version(), Some(3));
        assert_eq!(harness.allowlist.current_versions(), vec!["v1", "v2"]);

        let feedback = harness.center.feedback.lock().clone();
        assert_eq!(feedback.len(), 1);
        assert!(feedback[0].applied);
        assert_eq!(feedback[0].release_id, "release-3");
        assert_eq!(feedback[0].snapshot_version, 3);

        // Nothing newer: the registry keeps version 3.
        let outcome = service.refresh().await.unwrap();
        assert_eq!(outcome, TickOutcome::Synced(TickReport::default()));

        let stats = service.stats();
        assert_eq!(stats.tick_count, 2);
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.snapshots_applied, 1);
        assert_eq!(stats.current_version, Some(3));
        assert_eq!(stats.governance_applied_count, 1);
        assert_eq!(stats.lease_mode, LeaseMode::Local);

        let persisted = harness.store.load().unwrap().unwrap();
        assert_eq!(persisted.last_applied_version, Some(3));

        service.shutdown().await;
        service.shutdown().await;
        assert!(matches!(service.refresh().await, Err(SyncError::Closed)));
    }

    #[tokio::test]
    async fn test_invalid_allowlist_is_reported_not_applied() {
        let harness = Harness::new();
        *harness.center.snapshot.lock() = Some(snapshot(1, &["v7", "v8"]));

        let service = harness.start().await.unwrap();
        // The snapshot itself still applies.
        assert_eq!(harness.registry.version(), Some(1));
        assert_eq!(harness.allowlist.current_versions(), vec!["v1"]);

        let feedback = harness.center.feedback.lock().clone();
        assert_eq!(feedback.len(), 1);
        assert!(!feedback[0].applied);
        assert_eq!(feedback[0].current_versions, vec!["v1"]);
        assert!(!feedback[0].errors.is_empty());
        assert_eq!(service.stats().governance_rejected_count, 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_startup_check_fails_on_invalid_snapshot() {
        let harness = Harness::new();
        let mut bad = snapshot(2, &["v1"]);
        bad.models.clear();
        *harness.center.snapshot.lock() = Some(bad);

        let err = harness.start().await.err().unwrap();
        assert!(matches!(err, SyncError::StartupCheckFailed { attempts: 3, .. }));
        assert_eq!(harness.center.fetch_calls.load(Ordering::SeqCst), 3);
        assert_eq!(harness.registry.version(), None);
    }

    #[tokio::test]
    async fn test_startup_check_retries() {
        let harness = Harness::new();
        harness.center.failing_fetches.store(2, Ordering::SeqCst);
        *harness.center.snapshot.lock() = Some(snapshot(1, &["v1"]));

        let service = harness.start().await.unwrap();
        let stats = service.stats();
        assert_eq!(stats.failure_count, 2);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.last_error, None);
        assert!(stats.last_success_epoch_ms.is_some());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_skips_tick_without_lease() {
        let harness = Harness::new();
        let holder = LeaseManager::new(&harness.config.lease, None);
        assert!(holder.try_acquire().await);
        assert!(harness.lock_path().exists());

        let service = harness.start().await.unwrap();
        let stats = service.stats();
        assert_eq!(stats.not_leader_count, 1);
        assert_eq!(stats.lease_mode, LeaseMode::None);
        assert_eq!(harness.center.fetch_calls.load(Ordering::SeqCst), 0);

        holder.release().await;
        assert!(matches!(
            service.refresh().await.unwrap(),
            TickOutcome::Synced(_)
        ));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_finalize_acks_only_new_releases() {
        let mut harness = Harness::new();
        harness.config.finalize.enabled = true;
        {
            let mut pages = harness.center.pages.lock();
            pages.insert(
                None,
                FinalizePage {
                    items: vec![
                        finalize_record("r1", FinalizeStatus::Succeeded),
                        finalize_record("r2", FinalizeStatus::Pending),
                    ],
                    next_cursor: Some("c1".into()),
                    has_more: true,
                },
            );
            pages.insert(
                Some("c1".into()),
                FinalizePage {
                    items: vec![finalize_record("r2", FinalizeStatus::Failed)],
                    next_cursor: Some("c2".into()),
                    has_more: false,
                },
            );
        }

        let service = harness.start().await.unwrap();
        {
            let acks = harness.center.acks.lock();
            assert_eq!(acks.len(), 1);
            assert_eq!(acks[0].release_ids, vec!["r1", "r2"]);
        }
        let persisted = harness.store.load().unwrap().unwrap();
        assert_eq!(persisted.finalize_cursor.as_deref(), Some("c2"));
        assert!(persisted.pending_states.is_empty());

        // Redelivered release: recorded but not acknowledged again.
        harness.center.pages.lock().insert(
            Some("c2".into()),
            FinalizePage {
                items: vec![finalize_record("r1", FinalizeStatus::Succeeded)],
                next_cursor: Some("c3".into()),
                has_more: false,
            },
        );
        let outcome = service.refresh().await.unwrap();
        assert_eq!(outcome, TickOutcome::Synced(TickReport::default()));
        assert_eq!(harness.center.acks.lock().len(), 1);
        assert_eq!(service.stats().finalize_acked_count, 2);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_cursor_resets_to_start() {
        let mut harness = Harness::new();
        harness.config.finalize.enabled = true;
        harness
            .store
            .save(&SyncState {
                finalize_cursor: Some("stale".into()),
                ..SyncState::default()
            })
            .unwrap();
        harness.center.invalid_cursors.lock().insert("stale".into());
        harness.center.pages.lock().insert(
            None,
            FinalizePage {
                items: vec![finalize_record("r1", FinalizeStatus::Succeeded)],
                next_cursor: Some("c1".into()),
                has_more: false,
            },
        );

        let service = harness.start().await.unwrap();
        let stats = service.stats();
        assert_eq!(stats.invalid_cursor_count, 1);
        assert_eq!(stats.invalid_cursor_fail_fast_count, 0);
        assert_eq!(stats.finalize_acked_count, 1);
        let persisted = harness.store.load().unwrap().unwrap();
        assert_eq!(persisted.finalize_cursor.as_deref(), Some("c1"));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_cursor_fail_fast_keeps_state() {
        let mut harness = Harness::new();
        harness.config.finalize.enabled = true;
        harness.config.finalize.recovery = FinalizeRecovery::FailFast;
        harness.config.startup.check_enabled = false;
        harness
            .store
            .save(&SyncState {
                finalize_cursor: Some("stale".into()),
                ..SyncState::default()
            })
            .unwrap();
        harness.center.invalid_cursors.lock().insert("stale".into());

        let service = harness.start().await.unwrap();
        assert_eq!(service.stats().tick_count, 0);
        assert!(matches!(
            service.refresh().await,
            Err(SyncError::InvalidCursor)
        ));

        let stats = service.stats();
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.invalid_cursor_count, 1);
        assert_eq!(stats.invalid_cursor_fail_fast_count, 1);
        assert!(stats.last_error.is_some());
        let persisted = harness.store.load().unwrap().unwrap();
        assert_eq!(persisted.finalize_cursor.as_deref(), Some("stale"));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_lease_lost_mid_tick_skips_ack_and_persist() {
        let mut harness = Harness::new().with_remote_lease();
        harness.config.finalize.enabled = true;
        harness.config.startup.check_enabled = false;
        harness.center.pages.lock().insert(
            None,
            FinalizePage {
                items: vec![finalize_record("r1", FinalizeStatus::Succeeded)],
                next_cursor: Some("c1".into()),
                has_more: false,
            },
        );
        *harness.center.lose_lease_on_fetch.lock() = harness.remote_lease.clone();

        let service = harness.start().await.unwrap();
        assert!(matches!(service.refresh().await, Err(SyncError::LeaseLost)));
        assert!(harness.center.acks.lock().is_empty());
        assert!(harness.store.load().unwrap().is_none());

        let stats = service.stats();
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.finalize_acked_count, 0);
        assert_eq!(stats.lease_mode, LeaseMode::None);

        // The new holder keeps the lease; this instance stands by.
        assert_eq!(service.refresh().await.unwrap(), TickOutcome::NotLeader);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_lease_lost_mid_tick_skips_persist() {
        let mut harness = Harness::new().with_remote_lease();
        harness.config.startup.check_enabled = false;
        *harness.center.snapshot.lock() = Some(snapshot(1, &["v1"]));
        *harness.center.lose_lease_on_fetch.lock() = harness.remote_lease.clone();

        let service = harness.start().await.unwrap();
        assert!(matches!(service.refresh().await, Err(SyncError::LeaseLost)));
        assert!(harness.store.load().unwrap().is_none());
        assert!(service.stats().last_error.is_some());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_lease_tick_succeeds() {
        let mut harness = Harness::new().with_remote_lease();
        harness.config.finalize.enabled = true;
        harness.center.pages.lock().insert(
            None,
            FinalizePage {
                items: vec![finalize_record("r1", FinalizeStatus::Succeeded)],
                next_cursor: Some("c1".into()),
                has_more: false,
            },
        );

        let service = harness.start().await.unwrap();
        assert_eq!(harness.center.acks.lock().len(), 1);
        assert_eq!(service.stats().lease_mode, LeaseMode::Remote);
        let persisted = harness.store.load().unwrap().unwrap();
        assert_eq!(persisted.finalize_cursor.as_deref(), Some("c1"));
        service.shutdown().await;
    }
}
