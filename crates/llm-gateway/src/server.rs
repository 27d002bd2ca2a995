//! Wires the admission pipeline together: one [`GatewayServer`] per process,
//! shared behind an `Arc` across every inbound request.

use crate::{
    auth::Authenticator,
    error::{ErrorResponse, GatewayError},
    ids,
    keystore::{ApiKeyRecord, KeyStore, UsageRow},
    messages::openai::{ChatCompletion, ChatCompletionChunk, ChatRequest, ModelInfo, ModelsResponse},
    model_resolver::ModelResolver,
    rate_limit::{Admission, RateLimiter},
    request::RequestContext,
    translate::{RequestTranslator, ResponseTranslator, StreamTranslator, TranslatorFeatures, response::unix_seconds_now},
    upstream::UpstreamClient,
    upstream_types::StreamEvent,
    usage::{UsageRecorder, iso_now},
};
use axum::http::HeaderMap;
use futures::Stream;
use std::{collections::VecDeque, sync::Arc, time::Duration};

pub struct GatewayServer {
    authenticator: Authenticator,
    rate_limiter: RateLimiter,
    rate_limit_enabled: bool,
    rate_limit_window: Duration,
    key_store: Arc<dyn KeyStore>,
    model_resolver: ModelResolver,
    request_translator: RequestTranslator,
    response_translator: ResponseTranslator,
    upstream: UpstreamClient,
    usage: UsageRecorder,
}

/// One item of a chat completion's SSE body: a normal chunk, or an out-of-band
/// terminal error event emitted when the upstream connection drops mid-stream.
pub enum StreamItem {
    Chunk(ChatCompletionChunk),
    Error(ErrorResponse),
}

pub struct UnaryOutcome {
    pub completion: ChatCompletion,
    pub admission: Admission,
}

impl GatewayServer {
    pub async fn new(config: &config::Config, key_store: Arc<dyn KeyStore>) -> Self {
        let upstream = UpstreamClient::new(config.aws_region.clone()).await;

        let features = TranslatorFeatures {
            enable_vision: config.enable_vision,
            enable_tool_use: config.enable_tool_use,
            enable_extended_thinking: config.enable_extended_thinking,
        };

        Self {
            authenticator: Authenticator::new(
                key_store.clone(),
                config.master_api_key.clone(),
                config.require_api_key,
                config.rate_limit.requests,
            ),
            rate_limiter: RateLimiter::new(),
            rate_limit_enabled: config.rate_limit.enabled,
            rate_limit_window: config.rate_limit.window,
            key_store: key_store.clone(),
            model_resolver: ModelResolver::new(key_store.clone()),
            request_translator: RequestTranslator::new(features),
            response_translator: ResponseTranslator,
            upstream,
            usage: UsageRecorder::new(key_store),
        }
    }

    /// Backs `/ready`: the key store must be reachable and the default model
    /// mapping must have loaded before the gateway can serve traffic.
    pub async fn is_ready(&self) -> bool {
        self.key_store.ping().await && self.model_resolver.default_mapping_loaded()
    }

    /// Spawns the rate limiter's idle-bucket reaper. Intended to be called once at
    /// startup and left running for the lifetime of the process.
    pub fn spawn_rate_limit_reaper(&self) -> tokio::task::JoinHandle<()> {
        self.rate_limiter.spawn_reaper(self.rate_limit_window.max(Duration::from_secs(60)) * 10)
    }

    pub async fn list_models(&self) -> Result<ModelsResponse, GatewayError> {
        let ids = self.model_resolver.known_model_ids().await.map_err(GatewayError::internal)?;
        let created = unix_seconds_now();

        Ok(ModelsResponse {
            object: "list",
            data: ids.into_iter().map(|id| ModelInfo { id, object: "model", created, owned_by: "anthropic" }).collect(),
        })
    }

    fn check_rate_limit(&self, key: &ApiKeyRecord) -> Admission {
        if !self.rate_limit_enabled || key.is_master() {
            return Admission { allowed: true, limit: u32::MAX, remaining: u32::MAX, reset_epoch: 0 };
        }

        self.rate_limiter.admit(&key.api_key, key.rate_limit, self.rate_limit_window)
    }

    /// Runs one non-streaming chat completion, recording a usage row on every exit
    /// once the caller's identity is known (i.e. once authentication succeeds).
    pub async fn chat_completions(
        &self,
        ctx: &RequestContext,
        headers: &HeaderMap,
        request: ChatRequest,
    ) -> Result<UnaryOutcome, GatewayError> {
        let client_model_id = request.model.clone();
        let key = self.authenticator.authenticate(headers).await?;

        let result = self.chat_completions_after_auth(&key, request).await;

        let (success, prompt_tokens, completion_tokens, total_tokens, error_message) = match &result {
            Ok(outcome) => (
                true,
                outcome.completion.usage.prompt_tokens,
                outcome.completion.usage.completion_tokens,
                outcome.completion.usage.total_tokens,
                None,
            ),
            Err(err) => (false, 0, 0, 0, Some(err.to_string())),
        };

        self.usage
            .record(UsageRow {
                api_key: key.api_key,
                timestamp: iso_now(),
                request_id: ctx.request_id.clone(),
                model: client_model_id,
                prompt_tokens,
                completion_tokens,
                total_tokens,
                success,
                error_message,
                latency_ms: ctx.elapsed_ms(),
            })
            .await;

        result
    }

    async fn chat_completions_after_auth(
        &self,
        key: &ApiKeyRecord,
        request: ChatRequest,
    ) -> Result<UnaryOutcome, GatewayError> {
        let admission = self.check_rate_limit(key);
        if !admission.allowed {
            return Err(GatewayError::RateLimitExceeded {
                retry_after_secs: admission.reset_epoch.saturating_sub(unix_seconds_now()),
            });
        }

        let client_model_id = request.model.clone();
        let upstream_model_id = self.model_resolver.resolve(&client_model_id).await.map_err(GatewayError::internal)?;
        let upstream_request = self.request_translator.translate(request, upstream_model_id)?;
        let upstream_response = self.upstream.invoke(&upstream_request).await?;
        let completion = self.response_translator.translate(upstream_response, ids::completion_id(), client_model_id);

        Ok(UnaryOutcome { completion, admission })
    }

    /// Runs one streaming chat completion. Returns the admission immediately (for
    /// response headers) and an item stream that records its own usage row once it
    /// finishes, successfully or not.
    ///
    /// A failure before the first upstream event (rate limit, translation, initial
    /// connect) records a usage row here, mirroring [`Self::chat_completions`];
    /// authentication failures alone skip it since no key identity is known yet.
    pub async fn chat_completions_stream(
        &self,
        ctx: RequestContext,
        headers: &HeaderMap,
        request: ChatRequest,
    ) -> Result<(Admission, impl Stream<Item = StreamItem> + Send + use<>), GatewayError> {
        let client_model_id = request.model.clone();
        let key = self.authenticator.authenticate(headers).await?;

        let (admission, events, translator) = match self.start_stream_after_auth(&key, request).await {
            Ok(started) => started,
            Err(err) => {
                self.usage
                    .record(UsageRow {
                        api_key: key.api_key,
                        timestamp: iso_now(),
                        request_id: ctx.request_id.clone(),
                        model: client_model_id,
                        prompt_tokens: 0,
                        completion_tokens: 0,
                        total_tokens: 0,
                        success: false,
                        error_message: Some(err.to_string()),
                        latency_ms: ctx.elapsed_ms(),
                    })
                    .await;
                return Err(err);
            }
        };

        let state = StreamPipelineState {
            events,
            translator,
            queue: VecDeque::new(),
            done: false,
            error_message: None,
            usage: self.usage.clone(),
            ctx,
            api_key: key.api_key,
            client_model_id,
        };

        Ok((admission, futures::stream::unfold(state, pump_stream_pipeline)))
    }

    #[allow(clippy::type_complexity)]
    async fn start_stream_after_auth(
        &self,
        key: &ApiKeyRecord,
        request: ChatRequest,
    ) -> Result<(Admission, std::pin::Pin<Box<dyn Stream<Item = Result<StreamEvent, GatewayError>> + Send>>, StreamTranslator), GatewayError>
    {
        let admission = self.check_rate_limit(key);
        if !admission.allowed {
            return Err(GatewayError::RateLimitExceeded {
                retry_after_secs: admission.reset_epoch.saturating_sub(unix_seconds_now()),
            });
        }

        let client_model_id = request.model.clone();
        let upstream_model_id = self.model_resolver.resolve(&client_model_id).await.map_err(GatewayError::internal)?;
        let upstream_request = self.request_translator.translate(request, upstream_model_id)?;
        let events = self.upstream.invoke_stream(&upstream_request).await?;
        let created = unix_seconds_now();
        let translator = StreamTranslator::new(ids::completion_id(), created, client_model_id);

        Ok((admission, events, translator))
    }
}

struct StreamPipelineState {
    events: std::pin::Pin<Box<dyn Stream<Item = Result<StreamEvent, GatewayError>> + Send>>,
    translator: StreamTranslator,
    queue: VecDeque<StreamItem>,
    done: bool,
    error_message: Option<String>,
    usage: UsageRecorder,
    ctx: RequestContext,
    api_key: String,
    client_model_id: String,
}

async fn pump_stream_pipeline(mut state: StreamPipelineState) -> Option<(StreamItem, StreamPipelineState)> {
    use futures::StreamExt;

    loop {
        if let Some(item) = state.queue.pop_front() {
            return Some((item, state));
        }

        if state.done {
            return None;
        }

        match state.events.next().await {
            Some(Ok(event)) => {
                let is_stop = matches!(event, StreamEvent::MessageStop);
                state.queue.extend(state.translator.handle_event(event).into_iter().map(StreamItem::Chunk));
                if is_stop {
                    state.done = true;
                    record_stream_usage(&mut state).await;
                }
            }
            Some(Err(err)) => {
                state.queue.push_back(StreamItem::Chunk(state.translator.on_upstream_failure()));
                state.queue.push_back(StreamItem::Error(err.to_error_response()));
                state.error_message = Some(err.to_string());
                state.done = true;
                record_stream_usage(&mut state).await;
            }
            None => {
                state.done = true;
                record_stream_usage(&mut state).await;
            }
        }
    }
}

async fn record_stream_usage(state: &mut StreamPipelineState) {
    let (prompt_tokens, completion_tokens, total_tokens) = state.translator.captured_usage();

    state
        .usage
        .record(UsageRow {
            api_key: state.api_key.clone(),
            timestamp: iso_now(),
            request_id: state.ctx.request_id.clone(),
            model: state.client_model_id.clone(),
            prompt_tokens,
            completion_tokens,
            total_tokens,
            success: state.error_message.is_none(),
            error_message: state.error_message.take(),
            latency_ms: state.ctx.elapsed_ms(),
        })
        .await;
}
