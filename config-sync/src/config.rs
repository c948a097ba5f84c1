use call_log::config::ContractPolicy;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const MIN_SYNC_INTERVAL_SECS: u64 = 1;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("api_key must not be empty")]
    EmptyApiKey,

    #[error("signature verification is enabled but no secret is configured")]
    MissingSignatureSecret,

    #[error("lease ttl_seconds must be greater than 0")]
    InvalidLeaseTtl,

    #[error("finalize page_size must be greater than 0")]
    InvalidPageSize,

    #[error("startup max_attempts must be greater than 0")]
    InvalidStartupAttempts,

    #[error("Contract policy: {0}")]
    Contract(#[from] call_log::config::ValidationError),
}

/// Governance sync client configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    pub remote: RemoteConfig,
    #[serde(default)]
    pub signature: SignatureConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub state: SyncStateConfig,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub governance: GovernanceConfig,
    #[serde(default)]
    pub finalize: FinalizeConfig,
    #[serde(default)]
    pub startup: StartupConfig,
    /// Allowlist policy the governance releases are checked against
    #[serde(default)]
    pub contract: ContractPolicy,
    /// Health and status probes. Not served when absent.
    #[serde(default)]
    pub admin_listener: Option<Listener>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.remote.api_key.trim().is_empty() {
            return Err(ValidationError::EmptyApiKey);
        }
        if self.signature.enabled && self.signature.secret.is_empty() {
            return Err(ValidationError::MissingSignatureSecret);
        }
        if self.lease.remote.as_ref().is_some_and(|r| r.ttl_seconds == 0) {
            return Err(ValidationError::InvalidLeaseTtl);
        }
        if self.finalize.page_size == 0 {
            return Err(ValidationError::InvalidPageSize);
        }
        if self.startup.check_enabled && self.startup.max_attempts == 0 {
            return Err(ValidationError::InvalidStartupAttempts);
        }
        self.contract.validate()?;
        Ok(())
    }

    /// Configured interval, never shorter than one second.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(MIN_SYNC_INTERVAL_SECS))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

/// Config center endpoint
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RemoteConfig {
    pub base_url: Url,
    pub api_key: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Retries per request on retriable statuses and connect errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

/// Verification of signed snapshot responses
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SignatureConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_max_skew_seconds")]
    pub max_skew_seconds: u64,
    #[serde(default = "default_replay_window_seconds")]
    pub replay_window_seconds: u64,
    /// Also reject a snapshot version that was already accepted within the
    /// replay window, even when it arrives with a new timestamp
    #[serde(default)]
    pub reject_replayed_version: bool,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        SignatureConfig {
            enabled: false,
            secret: String::new(),
            max_skew_seconds: default_max_skew_seconds(),
            replay_window_seconds: default_replay_window_seconds(),
            reject_replayed_version: false,
        }
    }
}

/// Leader election for the sync loop
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LeaseConfig {
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,
    /// Fleet-wide lease held in the config center, on top of the local lock
    #[serde(default)]
    pub remote: Option<RemoteLeaseConfig>,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        LeaseConfig {
            lock_path: default_lock_path(),
            remote: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RemoteLeaseConfig {
    #[serde(default = "default_lease_key")]
    pub key: String,
    #[serde(default = "default_lease_ttl_seconds")]
    pub ttl_seconds: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SyncStateConfig {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_states")]
    pub max_finalized: usize,
    #[serde(default = "default_max_states")]
    pub max_pending: usize,
}

impl Default for SyncStateConfig {
    fn default() -> Self {
        SyncStateConfig {
            path: default_state_path(),
            max_finalized: default_max_states(),
            max_pending: default_max_states(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct GovernanceConfig {
    /// Apply the contract allowlist carried by snapshots
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Report every apply attempt back to the config center
    #[serde(default = "default_true")]
    pub feedback_enabled: bool,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        GovernanceConfig {
            enabled: true,
            feedback_enabled: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeRecovery {
    /// Drop the cursor and pull again from the start of the feed
    #[default]
    ResetToStart,
    /// Fail the tick and keep the cursor for an operator to look at
    FailFast,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct FinalizeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_pages_per_tick")]
    pub max_pages_per_tick: usize,
    #[serde(default)]
    pub recovery: FinalizeRecovery,
    /// Log a warning on every n-th invalid cursor, debug otherwise
    #[serde(default = "default_invalid_cursor_warn_every")]
    pub invalid_cursor_warn_every: u64,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        FinalizeConfig {
            enabled: false,
            page_size: default_page_size(),
            max_pages_per_tick: default_max_pages_per_tick(),
            recovery: FinalizeRecovery::default(),
            invalid_cursor_warn_every: default_invalid_cursor_warn_every(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StartupConfig {
    #[serde(default = "default_true")]
    pub check_enabled: bool,
    #[serde(default = "default_startup_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_startup_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        StartupConfig {
            check_enabled: true,
            max_attempts: default_startup_max_attempts(),
            retry_delay_ms: default_startup_retry_delay_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    30
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_read_timeout_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_max_skew_seconds() -> u64 {
    300
}

fn default_replay_window_seconds() -> u64 {
    600
}

fn default_lock_path() -> PathBuf {
    PathBuf::from("data/governance-sync.lock")
}

fn default_lease_key() -> String {
    "callsight-governance-sync".into()
}

fn default_lease_ttl_seconds() -> u64 {
    60
}

fn default_state_path() -> PathBuf {
    PathBuf::from("data/governance-sync-state.json")
}

fn default_max_states() -> usize {
    1_000
}

fn default_page_size() -> usize {
    100
}

fn default_max_pages_per_tick() -> usize {
    10
}

fn default_invalid_cursor_warn_every() -> u64 {
    10
}

fn default_startup_max_attempts() -> u32 {
    3
}

fn default_startup_retry_delay_ms() -> u64 {
    1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r#"
remote:
    base_url: "http://config-center.internal:8080"
    api_key: key
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.interval(), Duration::from_secs(30));
        assert!(!config.signature.enabled);
        assert!(!config.finalize.enabled);
        assert_eq!(config.finalize.recovery, FinalizeRecovery::ResetToStart);
        assert_eq!(config.startup.max_attempts, 3);
        assert!(config.lease.remote.is_none());
        assert!(config.admin_listener.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
remote:
    base_url: "https://config.example.com"
    api_key: key
    tenant_id: acme
    max_retries: 1
signature:
    enabled: true
    secret: s3cret
    max_skew_seconds: 30
    reject_replayed_version: true
lease:
    lock_path: /run/callsight/sync.lock
    remote:
        ttl_seconds: 15
state:
    path: /var/lib/callsight/sync.json
    max_finalized: 10
finalize:
    enabled: true
    recovery: fail_fast
    invalid_cursor_warn_every: 3
interval_secs: 0
admin_listener:
    host: 127.0.0.1
    port: 9090
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.interval(), Duration::from_secs(1));
        assert_eq!(config.remote.tenant_id.as_deref(), Some("acme"));
        assert!(config.signature.reject_replayed_version);
        let remote_lease = config.lease.remote.as_ref().unwrap();
        assert_eq!(remote_lease.key, "callsight-governance-sync");
        assert_eq!(remote_lease.ttl_seconds, 15);
        assert_eq!(config.state.max_finalized, 10);
        assert_eq!(config.state.max_pending, 1_000);
        assert_eq!(config.finalize.recovery, FinalizeRecovery::FailFast);
        assert_eq!(config.admin_listener.unwrap().port, 9090);
    }

    #[test]
    fn test_signature_requires_secret() {
        let yaml = r#"
remote:
    base_url: "http://localhost"
    api_key: key
signature:
    enabled: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.validate(), Err(ValidationError::MissingSignatureSecret));
    }
}
