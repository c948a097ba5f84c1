//! Server side of the AI-call telemetry pipeline: admission (API key, contract
//! version, minute quota), the append-only indexed log store, and its
//! background maintenance.

pub mod api;
pub mod config;
pub mod errors;
pub mod maintenance;
pub mod metrics_defs;
pub mod quota;
pub mod store;

use api::{AppState, IngestService};
use call_log::contract::ContractAllowlist;
use maintenance::IndexMaintenance;
use quota::MinuteQuota;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;
use store::LogStore;
use tokio::sync::watch;

#[derive(thiserror::Error, Debug)]
pub enum IngestServerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] config::ValidationError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs the ingestion API and admin listeners until ctrl-c.
pub async fn run(config: config::Config) -> Result<(), IngestServerError> {
    config.validate()?;

    let store = Arc::new(LogStore::new(&config.storage));
    let maintenance = Arc::new(IndexMaintenance::start(
        store.clone(),
        config.maintenance.clone(),
    ));

    tracing::info!(
        dir = %store.root().display(),
        index_stride = config.storage.index_stride,
        retention_days = config.storage.retention_days,
        quota_per_minute = config.limits.quota_per_minute,
        "Starting ingestion server"
    );

    let state = Arc::new(AppState {
        api_keys: config.api_keys.clone(),
        limits: config.limits.clone(),
        store,
        quota: MinuteQuota::new(config.limits.quota_per_minute),
        allowlist: Arc::new(ContractAllowlist::new(&config.contract)),
        maintenance: maintenance.clone(),
    });

    let status_maintenance = maintenance.clone();
    let admin = AdminService::new(|| true).with_status(move || {
        serde_json::json!({ "indexMaintenance": status_maintenance.metrics() })
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
        }
        let _ = shutdown_tx.send(true);
    });

    let api_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        IngestService::new(state),
        wait_for_shutdown(shutdown_rx.clone()),
    );
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin,
        wait_for_shutdown(shutdown_rx),
    );

    let result = tokio::try_join!(api_task, admin_task);
    maintenance.shutdown().await;
    result?;
    Ok(())
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
