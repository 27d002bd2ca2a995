//! Canonical error kinds and their mapping to OpenAI-shaped HTTP error bodies.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// The closed set of error kinds the gateway can surface to a client.
///
/// Every failure in the admission pipeline or the translators ultimately becomes
/// one of these. New upstream failure modes should be folded into the closest
/// existing kind rather than growing this enum.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{message}")]
    InvalidRequest { message: String, param: Option<String> },

    #[error("missing or invalid API key")]
    AuthenticationFailed,

    #[error("{0}")]
    PermissionDenied(String),

    #[error("model '{0}' not found")]
    ModelNotFound(String),

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("upstream throttled the request")]
    UpstreamThrottled,

    #[error("upstream is unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream returned a server error: {0}")]
    UpstreamServer(String),

    /// If `Some`, the message came from a known-safe source (e.g. a validation
    /// message) and can be logged; the client always gets a generic message.
    #[error("internal error")]
    Internal(#[source] Option<anyhow::Error>),
}

impl GatewayError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            param: None,
        }
    }

    pub fn invalid_request_param(message: impl Into<String>, param: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            param: Some(param.into()),
        }
    }

    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        Self::Internal(Some(err.into()))
    }

    /// Canonical kind name, used in logs and tracing, never sent to the client verbatim.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request_error",
            Self::AuthenticationFailed => "authentication_error",
            Self::PermissionDenied(_) => "permission_error",
            Self::ModelNotFound(_) => "not_found_error",
            Self::RateLimitExceeded { .. } => "rate_limit_error",
            Self::UpstreamThrottled => "upstream_throttled",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::UpstreamServer(_) => "upstream_server",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::ModelNotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamThrottled => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamServer(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request_error",
            Self::AuthenticationFailed => "authentication_error",
            Self::PermissionDenied(_) => "permission_error",
            Self::ModelNotFound(_) => "not_found_error",
            Self::RateLimitExceeded { .. } => "rate_limit_error",
            Self::UpstreamThrottled => "rate_limit_error",
            Self::UpstreamUnavailable(_) => "service_unavailable",
            Self::UpstreamServer(_) => "server_error",
            Self::Internal(_) => "server_error",
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request",
            Self::AuthenticationFailed => "invalid_api_key",
            Self::PermissionDenied(_) => "permission_denied",
            Self::ModelNotFound(_) => "model_not_found",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::UpstreamThrottled => "upstream_throttled",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::UpstreamServer(_) => "upstream_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Message safe to return to the client. Internal errors never leak their cause.
    fn client_message(&self) -> String {
        match self {
            Self::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    fn param(&self) -> Option<String> {
        match self {
            Self::InvalidRequest { param, .. } => param.clone(),
            _ => None,
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: ErrorDetails {
                message: self.client_message(),
                r#type: self.error_type().to_string(),
                param: self.param(),
                code: self.error_code().to_string(),
            },
        }
    }
}

/// Error response format compatible with the OpenAI API.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub message: String,
    pub r#type: String,
    pub param: Option<String>,
    pub code: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if matches!(self, Self::Internal(_)) {
            log::error!("internal error: {self:?}");
        }

        let retry_after = match &self {
            Self::RateLimitExceeded { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };

        let mut response = (self.status_code(), Json(self.to_error_response())).into_response();

        if let Some(retry_after_secs) = retry_after {
            if let Ok(value) = axum::http::HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_error_body_matches_canonical_table() {
        let err = GatewayError::RateLimitExceeded { retry_after_secs: 5 };
        let body = err.to_error_response();

        assert_eq!(body.error.r#type, "rate_limit_error");
        assert_eq!(body.error.code, "rate_limit_exceeded");
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn upstream_throttled_uses_rate_limit_error_type_but_distinct_code() {
        let err = GatewayError::UpstreamThrottled;
        let body = err.to_error_response();

        assert_eq!(body.error.r#type, "rate_limit_error");
        assert_eq!(body.error.code, "upstream_throttled");
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn internal_error_never_leaks_cause() {
        let err = GatewayError::internal(anyhow::anyhow!("connection string leaked credentials"));
        let body = err.to_error_response();

        assert_eq!(body.error.message, "Internal server error");
        assert_eq!(body.error.code, "internal_error");
    }

    #[test]
    fn invalid_request_carries_param() {
        let err = GatewayError::invalid_request_param("bad arguments", "tool_calls.arguments");
        let body = err.to_error_response();

        assert_eq!(body.error.param.as_deref(), Some("tool_calls.arguments"));
        assert_eq!(body.error.code, "invalid_request");
    }
}
