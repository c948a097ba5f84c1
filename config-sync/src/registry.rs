use crate::types::{GovernanceSnapshot, ModelConfig, OperationConfig};
use parking_lot::RwLock;
use std::sync::Arc;

/// The governance snapshot currently in effect. Readers get a consistent
/// snapshot; a sync swaps the whole thing at once.
#[derive(Default)]
pub struct ConfigRegistry {
    current: RwLock<Option<Arc<GovernanceSnapshot>>>,
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<GovernanceSnapshot>> {
        self.current.read().clone()
    }

    pub fn version(&self) -> Option<u64> {
        self.current.read().as_ref().map(|s| s.version)
    }

    pub fn replace(&self, snapshot: GovernanceSnapshot) {
        *self.current.write() = Some(Arc::new(snapshot));
    }

    /// Model an operation is mapped to, if that model is enabled.
    pub fn model_for_operation(&self, operation: &str) -> Option<ModelConfig> {
        let snapshot = self.current()?;
        let name = snapshot.operation_model_mapping.get(operation)?;
        snapshot
            .models
            .iter()
            .find(|m| &m.name == name && m.enabled)
            .cloned()
    }

    pub fn operation_config(&self, operation: &str) -> Option<OperationConfig> {
        self.current()?.operation_configs.get(operation).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn snapshot(version: u64, model: &str, enabled: bool) -> GovernanceSnapshot {
        GovernanceSnapshot {
            version,
            models: vec![ModelConfig {
                name: model.into(),
                provider: "openai".into(),
                base_url: None,
                enabled,
            }],
            operation_model_mapping: BTreeMap::from([("chat".into(), model.into())]),
            ..GovernanceSnapshot::default()
        }
    }

    #[test]
    fn test_replace_is_wholesale() {
        let registry = ConfigRegistry::new();
        assert_eq!(registry.version(), None);
        assert!(registry.model_for_operation("chat").is_none());

        let mut first = snapshot(1, "gpt", true);
        first
            .operation_configs
            .insert("chat".into(), OperationConfig::default());
        registry.replace(first);
        assert_eq!(registry.model_for_operation("chat").unwrap().name, "gpt");
        assert!(registry.operation_config("chat").is_some());

        let held = registry.current().unwrap();
        registry.replace(snapshot(2, "claude", true));
        assert_eq!(registry.version(), Some(2));
        assert_eq!(registry.model_for_operation("chat").unwrap().name, "claude");
        // Nothing carried over from version 1.
        assert!(registry.operation_config("chat").is_none());
        // Earlier readers keep the snapshot they took.
        assert_eq!(held.version, 1);
    }

    #[test]
    fn test_disabled_model_not_resolved() {
        let registry = ConfigRegistry::new();
        registry.replace(snapshot(1, "gpt", false));
        assert!(registry.model_for_operation("chat").is_none());
    }
}
