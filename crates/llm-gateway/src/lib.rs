//! OpenAI Chat Completions -> AWS Bedrock Converse gateway.
//!
//! [`router`] builds the axum [`Router`] exposing `/v1/chat/completions`,
//! `/v1/models`, `/health`, and `/ready`. Everything else in this crate is the
//! admission pipeline [`server::GatewayServer`] wires together: authentication,
//! rate limiting, model resolution, request/response/stream translation, and
//! the upstream Bedrock client.

mod auth;
pub mod error;
mod ids;
pub mod keystore;
mod messages;
mod model_resolver;
mod rate_limit;
mod request;
mod server;
mod translate;
mod upstream;
mod upstream_types;
mod usage;

use crate::{
    messages::openai::ChatRequest,
    request::RequestContext,
    server::{GatewayServer, StreamItem},
};
use axum::{
    Router,
    extract::{Json, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response, Sse, sse::Event},
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use keystore::{InMemoryKeyStore, KeyStore};
use std::{convert::Infallible, sync::Arc};

pub use error::{GatewayError, Result};

/// Builds the gateway's axum router and starts its background tasks (the
/// rate-limit bucket reaper).
pub async fn router(config: &config::Config) -> anyhow::Result<Router> {
    let key_store: Arc<dyn KeyStore> = Arc::new(InMemoryKeyStore::new());
    let server = Arc::new(GatewayServer::new(config, key_store).await);
    server.spawn_rate_limit_reaper();

    Ok(Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(server))
}

async fn chat_completions(State(server): State<Arc<GatewayServer>>, headers: HeaderMap, Json(request): Json<ChatRequest>) -> Response {
    let ctx = RequestContext::new();
    let request_id = ctx.request_id.clone();
    let streaming = request.stream.unwrap_or(false);

    log::debug!("chat completions request for model '{}', streaming={streaming}", request.model);

    let mut response = if streaming {
        match server.chat_completions_stream(ctx, &headers, request).await {
            Ok((admission, stream)) => {
                let mut response = sse_response(stream);
                apply_rate_limit_headers(response.headers_mut(), admission.limit, admission.remaining, admission.reset_epoch);
                response
            }
            Err(err) => err.into_response(),
        }
    } else {
        match server.chat_completions(&ctx, &headers, request).await {
            Ok(outcome) => {
                let mut response = Json(outcome.completion).into_response();
                apply_rate_limit_headers(
                    response.headers_mut(),
                    outcome.admission.limit,
                    outcome.admission.remaining,
                    outcome.admission.reset_epoch,
                );
                response
            }
            Err(err) => err.into_response(),
        }
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }

    response
}

fn sse_response(stream: impl Stream<Item = StreamItem> + Send + 'static) -> Response {
    let events = stream.map(|item| {
        let event = match item {
            StreamItem::Chunk(chunk) => {
                let json = serde_json::to_string(&chunk).unwrap_or_else(|err| {
                    log::error!("failed to serialize chat completion chunk: {err}");
                    r#"{"error":{"message":"serialization failed","type":"server_error","param":null,"code":"internal_error"}}"#.to_string()
                });

                Event::default().data(json)
            }
            StreamItem::Error(error) => {
                let json = serde_json::to_string(&error).unwrap_or_else(|err| {
                    log::error!("failed to serialize stream error: {err}");
                    r#"{"error":{"message":"serialization failed","type":"server_error","param":null,"code":"internal_error"}}"#.to_string()
                });

                Event::default().event("error").data(json)
            }
        };

        Ok::<_, Infallible>(event)
    });

    let with_done = events.chain(futures::stream::once(async { Ok::<_, Infallible>(Event::default().data("[DONE]")) }));

    Sse::new(with_done).into_response()
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset_epoch: u64) {
    for (name, value) in [
        ("x-ratelimit-limit", limit.to_string()),
        ("x-ratelimit-remaining", remaining.to_string()),
        ("x-ratelimit-reset", reset_epoch.to_string()),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}

async fn list_models(State(server): State<Arc<GatewayServer>>) -> Response {
    match server.list_models().await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn ready(State(server): State<Arc<GatewayServer>>) -> impl IntoResponse {
    if server.is_ready().await {
        (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({"status": "not_ready"})))
    }
}
