//! Persistent key-value state: API keys, model-id overrides, and usage rows.
//!
//! The real store lives behind a key-value interface (`Get`/`Put`/`Delete`/`Query`
//! plus conditional updates); this crate only needs a narrow slice of that surface,
//! expressed as the [`KeyStore`] trait. [`InMemoryKeyStore`] is the default
//! implementation, suitable for a single-process deployment or for tests.

use async_trait::async_trait;
use dashmap::DashMap;
use std::{collections::BTreeMap, sync::Arc};

/// A provisioned API key and its quota.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub api_key: String,
    pub user_id: String,
    pub name: String,
    pub is_active: bool,
    /// Requests allowed per rate-limit window. Must be >= 1 while `is_active`.
    pub rate_limit: u32,
    pub created_at: String,
    pub metadata: BTreeMap<String, String>,
}

impl ApiKeyRecord {
    /// Synthetic record used for the configured master key: active, unlimited rate.
    pub fn master(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            user_id: "master".to_string(),
            name: "master key".to_string(),
            is_active: true,
            rate_limit: u32::MAX,
            created_at: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn is_master(&self) -> bool {
        self.rate_limit == u32::MAX
    }

    /// Synthetic record used when `REQUIRE_API_KEY` is off and the caller sent no
    /// credential: active, rate-limited like any provisioned key.
    pub fn anonymous(rate_limit: u32) -> Self {
        Self {
            api_key: "anonymous".to_string(),
            user_id: "anonymous".to_string(),
            name: "anonymous".to_string(),
            is_active: true,
            rate_limit,
            created_at: String::new(),
            metadata: BTreeMap::new(),
        }
    }
}

/// A completed request's accounting row. Written exactly once per request.
#[derive(Debug, Clone)]
pub struct UsageRow {
    pub api_key: String,
    pub timestamp: String,
    pub request_id: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub success: bool,
    pub error_message: Option<String>,
    pub latency_ms: u64,
}

/// CRUD surface the core needs from the persistent key-value store.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Looks up an API key record by its opaque key string.
    async fn get_api_key(&self, api_key: &str) -> anyhow::Result<Option<ApiKeyRecord>>;

    /// Returns the current openai-model-id -> upstream-model-id override table.
    async fn model_mapping(&self) -> anyhow::Result<BTreeMap<String, String>>;

    /// Appends a usage row. The caller treats failures as non-fatal.
    async fn put_usage(&self, row: UsageRow) -> anyhow::Result<()>;

    /// Cheap reachability check backing `/ready`.
    async fn ping(&self) -> bool;
}

/// In-memory default implementation, backed by sharded concurrent maps.
#[derive(Clone, Default)]
pub struct InMemoryKeyStore {
    api_keys: Arc<DashMap<String, ApiKeyRecord>>,
    model_mapping: Arc<DashMap<String, String>>,
    usage: Arc<DashMap<(String, String), UsageRow>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_api_key(&self, record: ApiKeyRecord) {
        self.api_keys.insert(record.api_key.clone(), record);
    }

    pub fn insert_model_mapping(&self, openai_model_id: impl Into<String>, upstream_model_id: impl Into<String>) {
        self.model_mapping.insert(openai_model_id.into(), upstream_model_id.into());
    }

    /// Test helper: all usage rows recorded for a given key, unordered.
    pub fn usage_rows_for(&self, api_key: &str) -> Vec<UsageRow> {
        self.usage.iter().filter(|e| e.key().0 == api_key).map(|e| e.value().clone()).collect()
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn get_api_key(&self, api_key: &str) -> anyhow::Result<Option<ApiKeyRecord>> {
        Ok(self.api_keys.get(api_key).map(|entry| entry.clone()))
    }

    async fn model_mapping(&self) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(self.model_mapping.iter().map(|e| (e.key().clone(), e.value().clone())).collect())
    }

    async fn put_usage(&self, row: UsageRow) -> anyhow::Result<()> {
        self.usage.insert((row.api_key.clone(), row.timestamp.clone()), row);
        Ok(())
    }

    async fn ping(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_key_returns_none() {
        let store = InMemoryKeyStore::new();
        assert!(store.get_api_key("sk-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn inserted_key_is_found() {
        let store = InMemoryKeyStore::new();
        store.insert_api_key(ApiKeyRecord {
            api_key: "sk-1".to_string(),
            user_id: "u1".to_string(),
            name: "test".to_string(),
            is_active: true,
            rate_limit: 10,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            metadata: BTreeMap::new(),
        });

        let record = store.get_api_key("sk-1").await.unwrap().unwrap();
        assert_eq!(record.rate_limit, 10);
    }

    #[tokio::test]
    async fn model_mapping_reflects_inserts() {
        let store = InMemoryKeyStore::new();
        store.insert_model_mapping("gpt-4o", "global.anthropic.claude-custom-v1:0");

        let mapping = store.model_mapping().await.unwrap();
        assert_eq!(mapping.get("gpt-4o").map(String::as_str), Some("global.anthropic.claude-custom-v1:0"));
    }

    #[test]
    fn master_record_bypasses_rate_limit() {
        let record = ApiKeyRecord::master("sk-master");
        assert!(record.is_master());
        assert!(record.is_active);
    }

    #[test]
    fn anonymous_record_is_rate_limited_not_master() {
        let record = ApiKeyRecord::anonymous(30);
        assert!(record.is_active);
        assert!(!record.is_master());
        assert_eq!(record.rate_limit, 30);
    }

    #[tokio::test]
    async fn in_memory_store_always_pings_true() {
        let store = InMemoryKeyStore::new();
        assert!(store.ping().await);
    }
}
