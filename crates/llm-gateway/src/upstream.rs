//! C8: invokes the upstream Converse API (unary and streaming), translating
//! both directions between [`crate::upstream_types`] and the AWS SDK's own types.

use crate::{
    error::GatewayError,
    upstream_types::{
        ContentBlock, ContentBlockDelta, ContentBlockStart, ImageFormat, Role, StopReason, StreamEvent,
        ThinkingConfig as OurThinkingConfig, ToolChoiceSpec, UnaryUpstreamResponse, UpstreamMessage, UpstreamRequest,
        UpstreamUsage,
    },
};
use aws_sdk_bedrockruntime::{
    Client,
    error::SdkError,
    types::{
        self as bedrock, ContentBlock as AwsContentBlock, ConversationRole, ConverseOutput as AwsConverseOutput,
        ImageBlock, ImageFormat as AwsImageFormat, ImageSource, InferenceConfiguration, Message as AwsMessage,
        SystemContentBlock, Tool, ToolChoice as AwsToolChoice, ToolConfiguration, ToolInputSchema,
        ToolResultBlock, ToolResultContentBlock, ToolSpecification, ToolUseBlock,
    },
};
use aws_smithy_types::{Blob, Document};
use futures::Stream;
use rand::Rng;
use std::{pin::Pin, time::Duration};

const MAX_RETRIES: u32 = 2;
const RETRY_BASE: Duration = Duration::from_millis(250);

pub struct UpstreamClient {
    client: Client,
    unary_timeout: Duration,
    stream_timeout: Duration,
}

impl UpstreamClient {
    pub async fn new(region: String) -> Self {
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region))
            .load()
            .await;

        Self {
            client: Client::new(&aws_config),
            unary_timeout: Duration::from_secs(120),
            stream_timeout: Duration::from_secs(300),
        }
    }

    pub async fn invoke(&self, request: &UpstreamRequest) -> Result<UnaryUpstreamResponse, GatewayError> {
        with_retry(|| async { self.invoke_once(request).await }).await
    }

    async fn invoke_once(&self, request: &UpstreamRequest) -> Result<UnaryUpstreamResponse, GatewayError> {
        let fluent = build_converse_request(&self.client, request)?;

        let output = tokio::time::timeout(self.unary_timeout, fluent.send())
            .await
            .map_err(|_| GatewayError::UpstreamUnavailable("request timed out".to_string()))?
            .map_err(map_sdk_error)?;

        from_converse_output(output)
    }

    pub async fn invoke_stream(
        &self,
        request: &UpstreamRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamEvent, GatewayError>> + Send>>, GatewayError> {
        let fluent = build_converse_stream_request(&self.client, request)?;

        let output = tokio::time::timeout(self.unary_timeout, fluent.send())
            .await
            .map_err(|_| GatewayError::UpstreamUnavailable("request timed out".to_string()))?
            .map_err(map_sdk_error)?;

        let state = StreamPollState {
            stream: output.stream,
            deadline: self.stream_timeout,
            queue: std::collections::VecDeque::new(),
            stop_reason: None,
            finished: false,
        };

        let events = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.queue.pop_front() {
                    return Some((Ok(event), state));
                }

                if state.finished {
                    return None;
                }

                let next = match tokio::time::timeout(state.deadline, state.stream.recv()).await {
                    Ok(Ok(next)) => next,
                    Ok(Err(err)) => {
                        state.finished = true;
                        return Some((Err(map_sdk_error(err)), state));
                    }
                    Err(_) => {
                        state.finished = true;
                        return Some((Err(GatewayError::UpstreamUnavailable("stream timed out".to_string())), state));
                    }
                };

                match next {
                    Some(event) => ingest_stream_event(event, &mut state),
                    None => {
                        if state.stop_reason.is_some() || !state.queue.is_empty() {
                            state.queue.push_back(StreamEvent::MessageDelta {
                                stop_reason: state.stop_reason.take().unwrap_or(StopReason::Other),
                                usage: None,
                            });
                            state.queue.push_back(StreamEvent::MessageStop);
                        }
                        state.finished = true;
                    }
                }
            }
        });

        Ok(Box::pin(events))
    }
}

struct StreamPollState {
    stream: aws_sdk_bedrockruntime::operation::converse_stream::ConverseStreamOutputReceiver,
    deadline: Duration,
    queue: std::collections::VecDeque<StreamEvent>,
    stop_reason: Option<StopReason>,
    finished: bool,
}

async fn with_retry<F, Fut, T>(mut attempt: F) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, GatewayError>>,
{
    let mut tries = 0;

    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if tries < MAX_RETRIES && is_retryable(&err) => {
                let backoff = RETRY_BASE * 2u32.pow(tries);
                let jitter = rand::rng().random_range(0..=backoff.as_millis() as u64);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                tries += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_retryable(err: &GatewayError) -> bool {
    matches!(err, GatewayError::UpstreamUnavailable(_) | GatewayError::UpstreamThrottled)
}

fn map_sdk_error<E, R>(err: SdkError<E, R>) -> GatewayError
where
    E: std::error::Error + aws_sdk_bedrockruntime::error::ProvideErrorMetadata,
{
    match &err {
        SdkError::ServiceError(service_err) => {
            let code = service_err.err().code().unwrap_or_default();
            let message = service_err.err().message().unwrap_or_default().to_string();

            match code {
                "ThrottlingException" => GatewayError::UpstreamThrottled,
                "AccessDeniedException" => GatewayError::PermissionDenied(message),
                "ResourceNotFoundException" => GatewayError::ModelNotFound(message),
                "ValidationException" => GatewayError::invalid_request(message),
                "ModelTimeoutException" | "ServiceUnavailableException" => GatewayError::UpstreamUnavailable(message),
                "InternalServerException" => GatewayError::UpstreamServer(message),
                _ => GatewayError::UpstreamServer(message),
            }
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            GatewayError::UpstreamUnavailable(err.to_string())
        }
        _ => GatewayError::internal(anyhow::anyhow!(err.to_string())),
    }
}

fn build_converse_request(
    client: &Client,
    request: &UpstreamRequest,
) -> Result<aws_sdk_bedrockruntime::operation::converse::builders::ConverseFluentBuilder, GatewayError> {
    let mut builder = client
        .converse()
        .model_id(&request.model_id)
        .set_system(Some(system_blocks(&request.system)))
        .set_messages(Some(to_aws_messages(&request.messages)?))
        .inference_config(to_inference_config(request));

    if let Some(tool_config) = &request.tool_config {
        builder = builder.set_tool_config(Some(to_tool_configuration(tool_config)?));
    }

    if let Some(thinking) = &request.thinking {
        builder = builder.set_additional_model_request_fields(Some(thinking_document(thinking)));
    }

    Ok(builder)
}

fn build_converse_stream_request(
    client: &Client,
    request: &UpstreamRequest,
) -> Result<aws_sdk_bedrockruntime::operation::converse_stream::builders::ConverseStreamFluentBuilder, GatewayError> {
    let mut builder = client
        .converse_stream()
        .model_id(&request.model_id)
        .set_system(Some(system_blocks(&request.system)))
        .set_messages(Some(to_aws_messages(&request.messages)?))
        .inference_config(to_inference_config(request));

    if let Some(tool_config) = &request.tool_config {
        builder = builder.set_tool_config(Some(to_tool_configuration(tool_config)?));
    }

    if let Some(thinking) = &request.thinking {
        builder = builder.set_additional_model_request_fields(Some(thinking_document(thinking)));
    }

    Ok(builder)
}

fn system_blocks(system: &[String]) -> Vec<SystemContentBlock> {
    system.iter().map(|text| SystemContentBlock::Text(text.clone())).collect()
}

fn to_inference_config(request: &UpstreamRequest) -> InferenceConfiguration {
    let mut builder = InferenceConfiguration::builder();

    if let Some(max_tokens) = request.inference_config.max_tokens {
        builder = builder.max_tokens(max_tokens as i32);
    }
    if let Some(temperature) = request.inference_config.temperature {
        builder = builder.temperature(temperature as f32);
    }
    if let Some(top_p) = request.inference_config.top_p {
        builder = builder.top_p(top_p as f32);
    }
    if !request.inference_config.stop_sequences.is_empty() {
        builder = builder.set_stop_sequences(Some(request.inference_config.stop_sequences.clone()));
    }

    builder.build()
}

fn to_tool_configuration(tool_config: &crate::upstream_types::ToolConfig) -> Result<ToolConfiguration, GatewayError> {
    let mut builder = ToolConfiguration::builder();

    for spec in &tool_config.tools {
        let schema = ToolInputSchema::Json(json_to_document(&spec.input_schema));

        let tool_spec = ToolSpecification::builder()
            .name(&spec.name)
            .set_description(spec.description.clone())
            .input_schema(schema)
            .build()
            .map_err(GatewayError::internal)?;

        builder = builder.tools(Tool::ToolSpec(tool_spec));
    }

    if let Some(choice) = &tool_config.tool_choice {
        let aws_choice = match choice {
            ToolChoiceSpec::Auto => AwsToolChoice::Auto(bedrock::AutoToolChoice::builder().build()),
            ToolChoiceSpec::Any => AwsToolChoice::Any(bedrock::AnyToolChoice::builder().build()),
            ToolChoiceSpec::Tool { name } => {
                AwsToolChoice::Tool(bedrock::SpecificToolChoice::builder().name(name).build().map_err(GatewayError::internal)?)
            }
        };

        builder = builder.tool_choice(aws_choice);
    }

    builder.build().map_err(GatewayError::internal)
}

fn thinking_document(thinking: &OurThinkingConfig) -> Document {
    Document::Object(
        [(
            "thinking".to_string(),
            Document::Object(
                [
                    ("type".to_string(), Document::String("enabled".to_string())),
                    ("budget_tokens".to_string(), Document::Number(aws_smithy_types::Number::PosInt(thinking.budget_tokens as u64))),
                ]
                .into_iter()
                .collect(),
            ),
        )]
        .into_iter()
        .collect(),
    )
}

fn json_to_document(value: &serde_json::Value) -> Document {
    match value {
        serde_json::Value::Null => Document::Null,
        serde_json::Value::Bool(b) => Document::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Document::Number(aws_smithy_types::Number::NegInt(i))
            } else if let Some(f) = n.as_f64() {
                Document::Number(aws_smithy_types::Number::Float(f))
            } else {
                Document::Null
            }
        }
        serde_json::Value::String(s) => Document::String(s.clone()),
        serde_json::Value::Array(items) => Document::Array(items.iter().map(json_to_document).collect()),
        serde_json::Value::Object(map) => {
            Document::Object(map.iter().map(|(k, v)| (k.clone(), json_to_document(v))).collect())
        }
    }
}

fn document_to_json(document: &Document) -> serde_json::Value {
    match document {
        Document::Null => serde_json::Value::Null,
        Document::Bool(b) => serde_json::Value::Bool(*b),
        Document::Number(n) => match n {
            aws_smithy_types::Number::PosInt(v) => serde_json::json!(*v),
            aws_smithy_types::Number::NegInt(v) => serde_json::json!(*v),
            aws_smithy_types::Number::Float(v) => serde_json::json!(*v),
        },
        Document::String(s) => serde_json::Value::String(s.clone()),
        Document::Array(items) => serde_json::Value::Array(items.iter().map(document_to_json).collect()),
        Document::Object(map) => {
            serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), document_to_json(v))).collect())
        }
    }
}

fn to_aws_messages(messages: &[UpstreamMessage]) -> Result<Vec<AwsMessage>, GatewayError> {
    messages.iter().map(to_aws_message).collect()
}

fn to_aws_message(message: &UpstreamMessage) -> Result<AwsMessage, GatewayError> {
    let role = match message.role {
        Role::User => ConversationRole::User,
        Role::Assistant => ConversationRole::Assistant,
    };

    let mut builder = AwsMessage::builder().role(role);

    for block in &message.content {
        builder = builder.content(to_aws_content_block(block)?);
    }

    builder.build().map_err(GatewayError::internal)
}

fn to_aws_content_block(block: &ContentBlock) -> Result<AwsContentBlock, GatewayError> {
    Ok(match block {
        ContentBlock::Text(text) => AwsContentBlock::Text(text.clone()),
        ContentBlock::Image { format, bytes } => {
            let aws_format = match format {
                ImageFormat::Jpeg => AwsImageFormat::Jpeg,
                ImageFormat::Png => AwsImageFormat::Png,
                ImageFormat::Gif => AwsImageFormat::Gif,
                ImageFormat::Webp => AwsImageFormat::Webp,
            };

            let image = ImageBlock::builder()
                .format(aws_format)
                .source(ImageSource::Bytes(Blob::new(bytes.clone())))
                .build()
                .map_err(GatewayError::internal)?;

            AwsContentBlock::Image(image)
        }
        ContentBlock::ToolUse { id, name, input } => {
            let tool_use = ToolUseBlock::builder()
                .tool_use_id(id)
                .name(name)
                .input(json_to_document(input))
                .build()
                .map_err(GatewayError::internal)?;

            AwsContentBlock::ToolUse(tool_use)
        }
        ContentBlock::ToolResult { tool_use_id, content } => {
            let result = ToolResultBlock::builder()
                .tool_use_id(tool_use_id)
                .content(ToolResultContentBlock::Text(content.clone()))
                .build()
                .map_err(GatewayError::internal)?;

            AwsContentBlock::ToolResult(result)
        }
        ContentBlock::Thinking(text) => {
            let reasoning = bedrock::ReasoningContentBlock::ReasoningText(
                bedrock::ReasoningTextBlock::builder().text(text).build().map_err(GatewayError::internal)?,
            );

            AwsContentBlock::ReasoningContent(reasoning)
        }
    })
}

fn from_converse_output(output: AwsConverseOutput) -> Result<UnaryUpstreamResponse, GatewayError> {
    let stop_reason = to_our_stop_reason(output.stop_reason());

    let usage = output
        .usage()
        .map(|usage| UpstreamUsage {
            input_tokens: usage.input_tokens().max(0) as u32,
            output_tokens: usage.output_tokens().max(0) as u32,
        })
        .unwrap_or(UpstreamUsage { input_tokens: 0, output_tokens: 0 });

    let message = match output.output() {
        Some(bedrock::ConverseOutput::Message(message)) => message.clone(),
        _ => return Err(GatewayError::internal(anyhow::anyhow!("upstream response carried no message"))),
    };

    let content = message.content().iter().map(from_aws_content_block).collect();

    Ok(UnaryUpstreamResponse { content, stop_reason, usage })
}

fn from_aws_content_block(block: &AwsContentBlock) -> ContentBlock {
    match block {
        AwsContentBlock::Text(text) => ContentBlock::Text(text.clone()),
        AwsContentBlock::ToolUse(tool_use) => ContentBlock::ToolUse {
            id: tool_use.tool_use_id().to_string(),
            name: tool_use.name().to_string(),
            input: document_to_json(tool_use.input()),
        },
        AwsContentBlock::ToolResult(result) => ContentBlock::ToolResult {
            tool_use_id: result.tool_use_id().to_string(),
            content: String::new(),
        },
        AwsContentBlock::ReasoningContent(reasoning) => ContentBlock::Thinking(reasoning_text(reasoning)),
        _ => ContentBlock::Text(String::new()),
    }
}

fn reasoning_text(reasoning: &bedrock::ReasoningContentBlock) -> String {
    match reasoning {
        bedrock::ReasoningContentBlock::ReasoningText(text) => text.text().to_string(),
        _ => String::new(),
    }
}

fn to_our_stop_reason(reason: &bedrock::StopReason) -> StopReason {
    match reason {
        bedrock::StopReason::EndTurn => StopReason::EndTurn,
        bedrock::StopReason::StopSequence => StopReason::StopSequence,
        bedrock::StopReason::MaxTokens => StopReason::MaxTokens,
        bedrock::StopReason::ToolUse => StopReason::ToolUse,
        bedrock::StopReason::ContentFiltered => StopReason::ContentFiltered,
        _ => StopReason::Other,
    }
}

/// Ingests one raw AWS stream event into `state`, queuing zero or more
/// [`StreamEvent`]s for the translator to consume.
///
/// Bedrock emits `MessageStop{stop_reason}` before the trailing
/// `Metadata{usage}` event, the opposite order from the `messageDelta`
/// (carrying both) then `messageStop` pair the stream translator expects. The
/// stop reason is held here and folded into `MessageDelta` once `Metadata`
/// (or end of stream) arrives.
fn ingest_stream_event(event: aws_sdk_bedrockruntime::types::ConverseStreamOutput, state: &mut StreamPollState) {
    use aws_sdk_bedrockruntime::types::ConverseStreamOutput as Evt;

    match event {
        Evt::MessageStart(_) => state.queue.push_back(StreamEvent::MessageStart),
        Evt::ContentBlockStart(start) => {
            let index = start.content_block_index() as u32;
            let block = match start.start() {
                Some(bedrock::ContentBlockStartEvent::ToolUse(tool_use)) => ContentBlockStart::ToolUse {
                    tool_use_id: tool_use.tool_use_id().to_string(),
                    name: tool_use.name().to_string(),
                },
                // Bedrock has no start-time variant for text or reasoning blocks; both
                // arrive as ContentBlockStart::Text and are told apart by the first delta.
                _ => ContentBlockStart::Text,
            };

            state.queue.push_back(StreamEvent::ContentBlockStart { index, block });
        }
        Evt::ContentBlockDelta(delta_event) => {
            let index = delta_event.content_block_index() as u32;
            let delta = match delta_event.delta() {
                Some(bedrock::ContentBlockDelta::Text(text)) => ContentBlockDelta::Text(text.clone()),
                Some(bedrock::ContentBlockDelta::ToolUse(tool_use)) => {
                    ContentBlockDelta::ToolUsePartialJson(tool_use.input().to_string())
                }
                Some(bedrock::ContentBlockDelta::ReasoningContent(reasoning)) => match reasoning {
                    bedrock::ReasoningContentBlockDelta::Text(text) => ContentBlockDelta::Thinking(text.clone()),
                    _ => return,
                },
                _ => return,
            };

            state.queue.push_back(StreamEvent::ContentBlockDelta { index, delta });
        }
        Evt::ContentBlockStop(stop) => {
            state.queue.push_back(StreamEvent::ContentBlockStop { index: stop.content_block_index() as u32 });
        }
        Evt::MessageStop(stop) => {
            state.stop_reason = Some(to_our_stop_reason(stop.stop_reason()));
        }
        Evt::Metadata(metadata) => {
            let usage = metadata.usage().map(|usage| UpstreamUsage {
                input_tokens: usage.input_tokens().max(0) as u32,
                output_tokens: usage.output_tokens().max(0) as u32,
            });

            state.queue.push_back(StreamEvent::MessageDelta {
                stop_reason: state.stop_reason.take().unwrap_or(StopReason::Other),
                usage,
            });
            state.queue.push_back(StreamEvent::MessageStop);
            state.finished = true;
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_document_round_trips_through_object_and_array() {
        let value = serde_json::json!({"a": 1, "b": [true, "s", null]});
        let document = json_to_document(&value);
        let back = document_to_json(&document);
        assert_eq!(value, back);
    }
}
