//! C9: records one [`UsageRow`] per request, on every exit path including errors.

use crate::keystore::{KeyStore, UsageRow};
use jiff::Zoned;
use std::sync::Arc;

/// Current instant formatted as UTC RFC3339, for `UsageRow::timestamp`.
pub fn iso_now() -> String {
    Zoned::now().with_time_zone(jiff::tz::TimeZone::UTC).strftime("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[derive(Clone)]
pub struct UsageRecorder {
    key_store: Arc<dyn KeyStore>,
}

impl UsageRecorder {
    pub fn new(key_store: Arc<dyn KeyStore>) -> Self {
        Self { key_store }
    }

    /// Persists `row`. Failures are logged and swallowed: a broken usage
    /// sink must never fail the client-facing request it is recording.
    pub async fn record(&self, row: UsageRow) {
        let api_key = row.api_key.clone();
        let request_id = row.request_id.clone();

        if let Err(err) = self.key_store.put_usage(row).await {
            log::error!(
                "failed to record usage for request {request_id} (key ending in {}): {err:#}",
                api_key.chars().rev().take(4).collect::<String>().chars().rev().collect::<String>()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::InMemoryKeyStore;

    #[tokio::test]
    async fn record_persists_through_key_store() {
        let store = Arc::new(InMemoryKeyStore::default());
        let recorder = UsageRecorder::new(store.clone());

        recorder
            .record(UsageRow {
                api_key: "sk-test".to_string(),
                timestamp: "2026-01-01T00:00:00Z".to_string(),
                request_id: "req-1".to_string(),
                model: "gpt-4o".to_string(),
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
                success: true,
                error_message: None,
                latency_ms: 42,
            })
            .await;

        let rows = store.usage_rows_for("sk-test");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_tokens, 15);
    }
}
