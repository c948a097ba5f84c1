use call_log::config::ContractPolicy;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const MIN_MAINTENANCE_INTERVAL_SECS: u64 = 30;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("At least one API key must be configured")]
    NoApiKeys,

    #[error("Empty API key")]
    EmptyApiKey,

    #[error("max_batch_size must be greater than 0")]
    InvalidBatchSize,

    #[error("Contract policy: {0}")]
    Contract(#[from] call_log::config::ValidationError),
}

/// Ingestion server configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for the ingestion and governance API
    pub listener: Listener,
    /// Listener for health and readiness probes
    pub admin_listener: Listener,
    /// Keys accepted in the `X-SF-API-KEY` header
    pub api_keys: HashSet<String>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub contract: ContractPolicy,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.api_keys.is_empty() {
            return Err(ValidationError::NoApiKeys);
        }
        if self.api_keys.iter().any(|k| k.trim().is_empty()) {
            return Err(ValidationError::EmptyApiKey);
        }
        if self.limits.max_batch_size == 0 {
            return Err(ValidationError::InvalidBatchSize);
        }

        self.contract.validate()?;
        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Append-only store layout and retention
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Directory holding `{tenant}__{app}.jsonl` files and their index sidecars
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,
    /// One index entry is kept every `index_stride` lines
    #[serde(default = "default_index_stride")]
    pub index_stride: u64,
    /// Files not modified for this many days are purged. 0 disables purging.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    /// fsync data files after every appended batch
    #[serde(default)]
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            dir: default_storage_dir(),
            index_stride: default_index_stride(),
            retention_days: default_retention_days(),
            sync_writes: false,
        }
    }
}

/// Background index rebuild and retention purge
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MaintenanceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_maintenance_interval_secs")]
    pub interval_secs: u64,
    /// Run the retention purge on every maintenance tick
    #[serde(default = "default_true")]
    pub purge_enabled: bool,
}

impl MaintenanceConfig {
    /// Configured interval, never shorter than 30 seconds.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(MIN_MAINTENANCE_INTERVAL_SECS))
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        MaintenanceConfig {
            enabled: true,
            interval_secs: default_maintenance_interval_secs(),
            purge_enabled: true,
        }
    }
}

/// Admission limits for the batch endpoint
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LimitsConfig {
    /// Items admitted per (tenant, app) per calendar minute. Values below 1 are treated as 1.
    #[serde(default = "default_quota_per_minute")]
    pub quota_per_minute: i64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Reject batches without tenant and app ids instead of filing them
    /// under the defaults below
    #[serde(default)]
    pub require_tenant_app: bool,
    #[serde(default = "default_id")]
    pub default_tenant_id: String,
    #[serde(default = "default_id")]
    pub default_app_id: String,
    /// Upper bound for the `limit` query parameter of page reads
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            quota_per_minute: default_quota_per_minute(),
            max_batch_size: default_max_batch_size(),
            max_body_bytes: default_max_body_bytes(),
            require_tenant_app: false,
            default_tenant_id: default_id(),
            default_app_id: default_id(),
            max_page_size: default_max_page_size(),
        }
    }
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("data/ai-call-logs")
}

fn default_index_stride() -> u64 {
    200
}

fn default_retention_days() -> u64 {
    7
}

fn default_true() -> bool {
    true
}

fn default_maintenance_interval_secs() -> u64 {
    300
}

fn default_quota_per_minute() -> i64 {
    6_000
}

fn default_max_batch_size() -> usize {
    500
}

fn default_max_body_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_id() -> String {
    "default".into()
}

fn default_max_page_size() -> usize {
    1_000
}
