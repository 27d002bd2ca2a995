//! C3: extracts and validates the caller's API key.

use crate::{
    error::GatewayError,
    keystore::{ApiKeyRecord, KeyStore},
};
use axum::http::HeaderMap;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;

pub struct Authenticator {
    key_store: Arc<dyn KeyStore>,
    master_api_key: Option<SecretString>,
    require_api_key: bool,
    anonymous_rate_limit: u32,
}

impl Authenticator {
    pub fn new(
        key_store: Arc<dyn KeyStore>,
        master_api_key: Option<SecretString>,
        require_api_key: bool,
        anonymous_rate_limit: u32,
    ) -> Self {
        Self { key_store, master_api_key, require_api_key, anonymous_rate_limit }
    }

    /// Extracts a bearer credential from `Authorization: Bearer <t>` or `x-api-key: <t>`
    /// (first present wins, in that order), then validates it against the key store.
    ///
    /// When no credential is present at all, a missing `REQUIRE_API_KEY` lets the
    /// caller through as a rate-limited anonymous identity instead of failing.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<ApiKeyRecord, GatewayError> {
        let Some(token) = extract_bearer_token(headers) else {
            if self.require_api_key {
                return Err(GatewayError::AuthenticationFailed);
            }
            return Ok(ApiKeyRecord::anonymous(self.anonymous_rate_limit));
        };

        if let Some(master) = &self.master_api_key {
            if constant_time_eq(master.expose_secret(), &token) {
                return Ok(ApiKeyRecord::master(token));
            }
        }

        let record = self
            .key_store
            .get_api_key(&token)
            .await
            .map_err(GatewayError::internal)?
            .ok_or(GatewayError::AuthenticationFailed)?;

        if !record.is_active {
            return Err(GatewayError::AuthenticationFailed);
        }

        Ok(record)
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION) {
        let value = value.to_str().ok()?;
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }

    headers.get("x-api-key").and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }

    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
