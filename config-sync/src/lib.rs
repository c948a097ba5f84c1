//! Governance sync client: pulls signed configuration snapshots from the
//! config center, applies the contract allowlist they carry and reconciles
//! release finalization, with one leader per host or fleet.

pub mod config;
pub mod lease;
pub mod metrics_defs;
pub mod registry;
pub mod remote_config;
pub mod signature;
pub mod sync_service;
pub mod sync_state;
pub mod types;

use call_log::contract::ContractAllowlist;
use lease::{HttpLeaseClient, LeaseManager, RemoteLeaseClient};
use registry::ConfigRegistry;
use remote_config::SignedRemoteConfigClient;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;
use sync_service::{GovernanceSyncApplier, RemoteConfigSyncService, SyncComponents};
use sync_state::SyncStateStore;
use tokio::sync::watch;

#[derive(thiserror::Error, Debug)]
pub enum ConfigSyncError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] config::ValidationError),

    #[error(transparent)]
    Remote(#[from] remote_config::RemoteConfigError),

    #[error(transparent)]
    Lease(#[from] lease::LeaseError),

    #[error(transparent)]
    Sync(#[from] sync_service::SyncError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs the governance sync loop, and the admin listener if configured,
/// until ctrl-c.
pub async fn run(config: config::Config) -> Result<(), ConfigSyncError> {
    config.validate()?;

    let center = Arc::new(SignedRemoteConfigClient::new(
        &config.remote,
        &config.signature,
    )?);
    let remote_lease: Option<Arc<dyn RemoteLeaseClient>> = match &config.lease.remote {
        Some(_) => Some(Arc::new(HttpLeaseClient::new(&config.remote)?)),
        None => None,
    };
    let lease = Arc::new(LeaseManager::new(&config.lease, remote_lease));
    let registry = Arc::new(ConfigRegistry::new());
    let applier: Option<Arc<dyn GovernanceSyncApplier>> = config
        .governance
        .enabled
        .then(|| Arc::new(ContractAllowlist::new(&config.contract)) as Arc<dyn GovernanceSyncApplier>);

    tracing::info!(
        base_url = %config.remote.base_url,
        holder = %lease.holder_id(),
        signature = config.signature.enabled,
        finalize = config.finalize.enabled,
        "Starting governance sync"
    );

    let service = Arc::new(
        RemoteConfigSyncService::start(
            SyncComponents {
                center,
                lease,
                registry,
                applier,
                state_store: Arc::new(SyncStateStore::new(&config.state)),
            },
            &config,
        )
        .await?,
    );

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
        }
        let _ = shutdown_tx.send(true);
    });

    let result = match &config.admin_listener {
        Some(listener) => {
            let status_service = service.clone();
            let admin = AdminService::new(|| true).with_status(move || {
                serde_json::json!({ "governanceSync": status_service.stats() })
            });
            run_http_service(&listener.host, listener.port, admin, async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            })
            .await
        }
        None => {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
            Ok(())
        }
    };

    service.shutdown().await;
    result?;
    Ok(())
}
