//! Governance of the ingestion contract version allowlist.
//!
//! The current allowlist is the primary version plus the configured list.
//! Proposed replacements are checked against the policy before they are
//! applied; every rule is evaluated so the caller sees all violations at once.

use crate::config::ContractPolicy;
use indexmap::IndexSet;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllowlistViolation {
    #[error("proposed contract versions must not be empty")]
    Empty,

    #[error("proposed {proposed} contract versions, at most {max} may be active")]
    TooManyVersions { proposed: usize, max: usize },

    #[error("proposed contract versions share no version with the current allowlist")]
    NoOverlap,
}

/// Outcome of validating a proposed allowlist.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowlistValidation {
    pub valid: bool,
    pub current_versions: Vec<String>,
    pub proposed_versions: Vec<String>,
    pub errors: Vec<String>,
}

pub struct ContractAllowlist {
    primary_version: String,
    max_active: usize,
    require_overlap: bool,
    configured: RwLock<Vec<String>>,
}

impl ContractAllowlist {
    pub fn new(policy: &ContractPolicy) -> Self {
        ContractAllowlist {
            primary_version: policy.primary_version.trim().to_string(),
            max_active: policy.max_active_contract_versions,
            require_overlap: policy.require_current_version_overlap,
            configured: RwLock::new(normalize(&policy.versions)),
        }
    }

    /// Primary version first, then configured versions in order.
    pub fn current_versions(&self) -> Vec<String> {
        let configured = self.configured.read();
        let mut current = IndexSet::with_capacity(configured.len() + 1);
        current.insert(self.primary_version.clone());
        current.extend(configured.iter().cloned());
        current.into_iter().collect()
    }

    pub fn is_supported(&self, version: &str) -> bool {
        let version = version.trim();
        version == self.primary_version || self.configured.read().iter().any(|v| v == version)
    }

    pub fn validate<S: AsRef<str>>(&self, proposed: &[S]) -> AllowlistValidation {
        let current = self.current_versions();
        let proposed = normalize(proposed);
        let mut errors = Vec::new();

        if proposed.is_empty() {
            errors.push(AllowlistViolation::Empty);
        }

        if proposed.len() > self.max_active {
            errors.push(AllowlistViolation::TooManyVersions {
                proposed: proposed.len(),
                max: self.max_active,
            });
        }

        if self.require_overlap && !proposed.iter().any(|v| current.contains(v)) {
            errors.push(AllowlistViolation::NoOverlap);
        }

        AllowlistValidation {
            valid: errors.is_empty(),
            current_versions: current,
            proposed_versions: proposed,
            errors: errors.iter().map(ToString::to_string).collect(),
        }
    }

    /// Validates `proposed` and, if it passes, makes it the configured list.
    /// On failure the current allowlist is left untouched.
    pub fn apply<S: AsRef<str>>(&self, proposed: &[S]) -> Result<AllowlistValidation, AllowlistValidation> {
        let report = self.validate(proposed);
        if !report.valid {
            return Err(report);
        }

        *self.configured.write() = report.proposed_versions.clone();
        Ok(report)
    }
}

/// Trims, drops blanks and removes duplicates while keeping first-seen order.
fn normalize<S: AsRef<str>>(versions: &[S]) -> Vec<String> {
    versions
        .iter()
        .map(|v| v.as_ref().trim())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect::<IndexSet<_>>()
        .into_iter()
        .collect()
}
