//! Wire types exchanged with the config center.

use call_log::record::RequestParams;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A complete, versioned governance configuration. Snapshots are never merged:
/// a newer one replaces the previous one wholesale.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceSnapshot {
    pub version: u64,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    /// Operation type to model name
    #[serde(default)]
    pub operation_model_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub operation_configs: BTreeMap<String, OperationConfig>,
    #[serde(default)]
    pub ingestion_governance: Option<IngestionGovernance>,
}

impl GovernanceSnapshot {
    /// Rejects snapshots whose operations point at models they do not define.
    pub fn validate(&self) -> Result<(), String> {
        let mut names = HashSet::with_capacity(self.models.len());
        for model in &self.models {
            if model.name.trim().is_empty() {
                return Err("model with empty name".into());
            }
            if !names.insert(model.name.as_str()) {
                return Err(format!("duplicate model {}", model.name));
            }
        }

        for (operation, model) in &self.operation_model_mapping {
            if !names.contains(model.as_str()) {
                return Err(format!(
                    "operation {operation} references unknown model {model}"
                ));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub name: String,
    pub provider: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationConfig {
    #[serde(flatten)]
    pub params: RequestParams,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Contract allowlist change proposed by the config center.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionGovernance {
    pub release_id: String,
    #[serde(default)]
    pub contract_allowlist: Vec<String>,
}

/// Result of applying an ingestion governance release, reported back to the
/// config center.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceFeedback {
    pub release_id: String,
    pub snapshot_version: u64,
    pub applied: bool,
    pub current_versions: Vec<String>,
    pub errors: Vec<String>,
    pub reported_at_epoch_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalizeStatus {
    Pending,
    Succeeded,
    Failed,
}

impl FinalizeStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, FinalizeStatus::Pending)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRecord {
    pub release_id: String,
    pub status: FinalizeStatus,
    pub updated_at_epoch_ms: u64,
}

/// One page of the finalize feed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizePage {
    #[serde(default)]
    pub items: Vec<FinalizeRecord>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeAck {
    pub release_ids: Vec<String>,
    pub holder_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRequest {
    pub key: String,
    pub holder_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseResponse {
    pub granted: bool,
    #[serde(default)]
    pub expires_at_epoch_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snapshot() {
        let json = r#"{
            "version": 7,
            "models": [{"name": "gpt", "provider": "openai"}],
            "operationModelMapping": {"summarize": "gpt"},
            "operationConfigs": {"summarize": {"maxTokens": 256, "jsonOutput": true, "timeoutMs": 3000}},
            "ingestionGovernance": {"releaseId": "r-1", "contractAllowlist": ["v1", "v2"]}
        }"#;
        let snapshot: GovernanceSnapshot = serde_json::from_str(json).unwrap();
        snapshot.validate().unwrap();

        assert_eq!(snapshot.version, 7);
        assert!(snapshot.models[0].enabled);
        let op = &snapshot.operation_configs["summarize"];
        assert_eq!(op.params.max_tokens, Some(256));
        assert!(op.params.json_output);
        assert_eq!(op.timeout_ms, Some(3000));
        let governance = snapshot.ingestion_governance.unwrap();
        assert_eq!(governance.contract_allowlist, vec!["v1", "v2"]);
    }

    #[test]
    fn test_dangling_operation_is_invalid() {
        let snapshot = GovernanceSnapshot {
            version: 1,
            operation_model_mapping: BTreeMap::from([("chat".into(), "missing".into())]),
            ..GovernanceSnapshot::default()
        };
        assert!(snapshot.validate().unwrap_err().contains("unknown model missing"));
    }

    #[test]
    fn test_finalize_status_wire_format() {
        let record: FinalizeRecord = serde_json::from_str(
            r#"{"releaseId": "r", "status": "SUCCEEDED", "updatedAtEpochMs": 5}"#,
        )
        .unwrap();
        assert!(record.status.is_terminal());
        assert!(!FinalizeStatus::Pending.is_terminal());
    }
}
