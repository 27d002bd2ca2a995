//! Upstream (Bedrock Converse) request/response data model, independent of the
//! AWS SDK's wire types. [`crate::upstream`] is the only module that converts
//! between these and `aws-sdk-bedrockruntime`'s own builders.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub model_id: String,
    pub system: Vec<String>,
    pub messages: Vec<UpstreamMessage>,
    pub inference_config: InferenceConfig,
    pub tool_config: Option<ToolConfig>,
    pub thinking: Option<ThinkingConfig>,
}

#[derive(Debug, Clone)]
pub struct UpstreamMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone)]
pub enum ContentBlock {
    Text(String),
    Image { format: ImageFormat, bytes: Vec<u8> },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: String },
    Thinking(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ImageFormat {
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/gif" => Some(Self::Gif),
            "image/webp" => Some(Self::Webp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InferenceConfig {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop_sequences: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ToolConfig {
    pub tools: Vec<ToolSpec>,
    pub tool_choice: Option<ToolChoiceSpec>,
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone)]
pub enum ToolChoiceSpec {
    Auto,
    Any,
    Tool { name: String },
}

#[derive(Debug, Clone)]
pub struct ThinkingConfig {
    pub budget_tokens: u32,
}

/// Terminal response to a non-streaming `invoke`.
#[derive(Debug, Clone)]
pub struct UnaryUpstreamResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: UpstreamUsage,
}

#[derive(Debug, Clone, Copy)]
pub struct UpstreamUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    StopSequence,
    MaxTokens,
    ToolUse,
    ContentFiltered,
    Other,
}

/// One event of an upstream streaming response, in the shape the stream
/// translator (§4.6) consumes.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    MessageStart,
    ContentBlockStart { index: u32, block: ContentBlockStart },
    ContentBlockDelta { index: u32, delta: ContentBlockDelta },
    ContentBlockStop { index: u32 },
    MessageDelta { stop_reason: StopReason, usage: Option<UpstreamUsage> },
    MessageStop,
}

#[derive(Debug, Clone)]
pub enum ContentBlockStart {
    Text,
    ToolUse { tool_use_id: String, name: String },
    Thinking,
}

#[derive(Debug, Clone)]
pub enum ContentBlockDelta {
    Text(String),
    ToolUsePartialJson(String),
    Thinking(String),
}
