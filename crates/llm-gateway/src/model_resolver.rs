//! C2: maps a client-facing model id to the upstream model id.
//!
//! Resolution order: KeyStore override table, then the static default table
//! shipped with the binary, then passthrough.

use crate::keystore::KeyStore;
use std::{collections::BTreeMap, sync::Arc};

/// Default client-model-id -> upstream-model-id table, shipped with the binary.
fn default_table() -> &'static BTreeMap<&'static str, &'static str> {
    static TABLE: std::sync::OnceLock<BTreeMap<&'static str, &'static str>> = std::sync::OnceLock::new();

    TABLE.get_or_init(|| {
        BTreeMap::from([
            ("claude-sonnet-4-5-20250929", "global.anthropic.claude-sonnet-4-5-20250929-v1:0"),
            ("claude-opus-4-1-20250805", "global.anthropic.claude-opus-4-1-20250805-v1:0"),
            ("claude-3-7-sonnet-20250219", "global.anthropic.claude-3-7-sonnet-20250219-v1:0"),
            ("claude-3-5-haiku-20241022", "global.anthropic.claude-3-5-haiku-20241022-v1:0"),
        ])
    })
}

pub struct ModelResolver {
    key_store: Arc<dyn KeyStore>,
}

impl ModelResolver {
    pub fn new(key_store: Arc<dyn KeyStore>) -> Self {
        Self { key_store }
    }

    /// Resolves a client model id to the id that should be sent upstream.
    pub async fn resolve(&self, openai_model_id: &str) -> anyhow::Result<String> {
        let overrides = self.key_store.model_mapping().await?;

        if let Some(upstream) = overrides.get(openai_model_id) {
            return Ok(upstream.clone());
        }

        if let Some(upstream) = default_table().get(openai_model_id) {
            return Ok((*upstream).to_string());
        }

        Ok(openai_model_id.to_string())
    }

    /// Whether the static default table shipped with the binary is populated.
    /// Backs the `/ready` check; doesn't touch the key store.
    pub fn default_mapping_loaded(&self) -> bool {
        !default_table().is_empty()
    }

    /// All ids the gateway knows how to serve: union of the default table and
    /// any configured overrides, sorted lexicographically.
    pub async fn known_model_ids(&self) -> anyhow::Result<Vec<String>> {
        let overrides = self.key_store.model_mapping().await?;

        let mut ids: Vec<String> = default_table()
            .keys()
            .map(|id| id.to_string())
            .chain(overrides.keys().cloned())
            .collect();

        ids.sort();
        ids.dedup();

        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::InMemoryKeyStore;

    #[tokio::test]
    async fn default_table_resolves_known_model() {
        let resolver = ModelResolver::new(Arc::new(InMemoryKeyStore::new()));

        let resolved = resolver.resolve("claude-sonnet-4-5-20250929").await.unwrap();
        assert_eq!(resolved, "global.anthropic.claude-sonnet-4-5-20250929-v1:0");
    }

    #[tokio::test]
    async fn override_table_wins_over_default() {
        let store = InMemoryKeyStore::new();
        store.insert_model_mapping("claude-sonnet-4-5-20250929", "custom.model.v2");
        let resolver = ModelResolver::new(Arc::new(store));

        let resolved = resolver.resolve("claude-sonnet-4-5-20250929").await.unwrap();
        assert_eq!(resolved, "custom.model.v2");
    }

    #[tokio::test]
    async fn unknown_model_passes_through_unchanged() {
        let resolver = ModelResolver::new(Arc::new(InMemoryKeyStore::new()));

        let resolved = resolver.resolve("some-future-model").await.unwrap();
        assert_eq!(resolved, "some-future-model");
    }

    #[tokio::test]
    async fn resolution_is_idempotent_on_passthrough_output() {
        let resolver = ModelResolver::new(Arc::new(InMemoryKeyStore::new()));

        let first = resolver.resolve("global.anthropic.claude-sonnet-4-5-20250929-v1:0").await.unwrap();
        let second = resolver.resolve(&first).await.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn default_mapping_is_loaded() {
        let resolver = ModelResolver::new(Arc::new(InMemoryKeyStore::new()));
        assert!(resolver.default_mapping_loaded());
    }

    #[tokio::test]
    async fn known_model_ids_are_sorted_and_deduplicated() {
        let store = InMemoryKeyStore::new();
        store.insert_model_mapping("claude-3-5-haiku-20241022", "duplicate-of-default");
        let resolver = ModelResolver::new(Arc::new(store));

        let ids = resolver.known_model_ids().await.unwrap();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
