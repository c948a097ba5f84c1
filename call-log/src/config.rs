use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const MIN_FLUSH_INTERVAL_MS: u64 = 1_000;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("batch_size must be greater than 0")]
    EmptyBatch,

    #[error("queue_capacity must be greater than 0")]
    EmptyQueue,

    #[error("primary contract version cannot be empty")]
    EmptyPrimaryVersion,

    #[error("api_key cannot be empty")]
    EmptyApiKey,
}

/// Policy for the ingestion contract version allowlist.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ContractPolicy {
    /// The version this build of the pipeline natively speaks. Always part of
    /// the current allowlist.
    #[serde(default = "default_primary_version")]
    pub primary_version: String,
    /// Additional versions currently accepted.
    #[serde(default)]
    pub versions: Vec<String>,
    /// Upper bound on the size of a proposed allowlist.
    #[serde(default = "default_max_active_versions")]
    pub max_active_contract_versions: usize,
    /// Reject proposals that share no version with the current allowlist.
    #[serde(default = "default_true")]
    pub require_current_version_overlap: bool,
}

impl Default for ContractPolicy {
    fn default() -> Self {
        ContractPolicy {
            primary_version: default_primary_version(),
            versions: Vec::new(),
            max_active_contract_versions: default_max_active_versions(),
            require_current_version_overlap: true,
        }
    }
}

impl ContractPolicy {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.primary_version.trim().is_empty() {
            return Err(ValidationError::EmptyPrimaryVersion);
        }
        Ok(())
    }
}

/// Client-side uploader configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct UploaderConfig {
    /// Base URL of the ingestion server.
    pub endpoint: Url,
    pub api_key: String,
    pub tenant_id: String,
    pub app_id: String,
    #[serde(default = "default_primary_version")]
    pub contract_version: String,
    /// Fraction of records uploaded, clamped to `[0, 1]`.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    /// Upload prompt/input/output content. Off by default.
    #[serde(default)]
    pub upload_content: bool,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Caps the work done by a single flush tick.
    #[serde(default = "default_max_batches_per_flush")]
    pub max_batches_per_flush: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Retries after the first attempt; a batch gets `max_retry + 1` attempts.
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    /// Base delay of the exponential backoff between attempts.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl UploaderConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.batch_size == 0 {
            return Err(ValidationError::EmptyBatch);
        }
        if self.queue_capacity == 0 {
            return Err(ValidationError::EmptyQueue);
        }
        if self.api_key.is_empty() {
            return Err(ValidationError::EmptyApiKey);
        }
        Ok(())
    }

    pub fn effective_sample_rate(&self) -> f64 {
        if self.sample_rate.is_nan() {
            return 0.0;
        }
        self.sample_rate.clamp(0.0, 1.0)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(MIN_FLUSH_INTERVAL_MS))
    }
}

fn default_primary_version() -> String {
    "v1".into()
}

fn default_max_active_versions() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_sample_rate() -> f64 {
    1.0
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    100
}

fn default_max_batches_per_flush() -> usize {
    10
}

fn default_flush_interval_ms() -> u64 {
    5_000
}

fn default_max_retry() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_read_timeout_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uploader_config() {
        let yaml = r#"
endpoint: "http://ingest.internal:8080"
api_key: secret
tenant_id: acme
app_id: chat
sample_rate: 1.7
flush_interval_ms: 10
"#;
        let config: UploaderConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.contract_version, "v1");
        assert_eq!(config.batch_size, 100);
        assert!(!config.upload_content);
        assert_eq!(config.effective_sample_rate(), 1.0);
        assert_eq!(config.flush_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_negative_sample_rate_clamps_to_zero() {
        let yaml = r#"
endpoint: "http://ingest.internal:8080"
api_key: secret
tenant_id: acme
app_id: chat
sample_rate: -0.5
batch_size: 0
"#;
        let config: UploaderConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.effective_sample_rate(), 0.0);
        assert_eq!(config.validate(), Err(ValidationError::EmptyBatch));
    }

    #[test]
    fn test_contract_policy_defaults() {
        let policy: ContractPolicy = serde_yaml::from_str("versions: [v0]").unwrap();
        assert_eq!(policy.primary_version, "v1");
        assert_eq!(policy.max_active_contract_versions, 3);
        assert!(policy.require_current_version_overlap);
    }
}
