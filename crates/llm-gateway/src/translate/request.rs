//! C5: OpenAI request -> upstream (Bedrock Converse) request.

use crate::{
    error::GatewayError,
    messages::openai::{ChatRequest, ContentPart, FunctionCall, Message, MessageContent, Role, ToolChoice},
    upstream_types::{
        ContentBlock, ImageFormat, InferenceConfig, ThinkingConfig, ToolChoiceSpec, ToolConfig, ToolSpec,
        UpstreamMessage, UpstreamRequest, Role as UpstreamRole,
    },
};
use base64::Engine;

/// Feature gates from configuration; when a gate is off, the corresponding
/// request field causes an `invalid_request_error` rather than being ignored.
#[derive(Debug, Clone, Copy)]
pub struct TranslatorFeatures {
    pub enable_vision: bool,
    pub enable_tool_use: bool,
    pub enable_extended_thinking: bool,
}

const SUPPORTED_IMAGE_MIME: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

pub struct RequestTranslator {
    features: TranslatorFeatures,
}

impl RequestTranslator {
    pub fn new(features: TranslatorFeatures) -> Self {
        Self { features }
    }

    pub fn translate(&self, request: ChatRequest, upstream_model_id: String) -> Result<UpstreamRequest, GatewayError> {
        self.validate_ranges(&request)?;

        let (system, candidates) = partition_system_messages(request.messages);

        let mut upstream_messages = Vec::with_capacity(candidates.len());
        for message in candidates {
            upstream_messages.push(self.translate_message(message)?);
        }

        let upstream_messages = coalesce_adjacent_same_role(upstream_messages);

        let stop_sequences = request.stop.map(|s| s.into_vec()).unwrap_or_default();
        let inference_config = InferenceConfig {
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences,
        };

        let tool_config = match request.tools {
            Some(tools) if !tools.is_empty() && !is_tool_choice_none(&request.tool_choice) => {
                if !self.features.enable_tool_use {
                    return Err(GatewayError::invalid_request("tool use is not enabled on this gateway"));
                }
                Some(self.translate_tool_config(tools, request.tool_choice)?)
            }
            _ => None,
        };

        let thinking = match request.thinking {
            Some(cfg) if cfg.is_enabled() => {
                if !self.features.enable_extended_thinking {
                    return Err(GatewayError::invalid_request("extended thinking is not enabled on this gateway"));
                }
                if request.temperature.is_some() {
                    return Err(GatewayError::invalid_request_param(
                        "temperature must be omitted when extended thinking is enabled",
                        "temperature",
                    ));
                }
                Some(ThinkingConfig { budget_tokens: cfg.budget_tokens })
            }
            _ => None,
        };

        Ok(UpstreamRequest {
            model_id: upstream_model_id,
            system,
            messages: upstream_messages,
            inference_config,
            tool_config,
            thinking,
        })
    }

    fn validate_ranges(&self, request: &ChatRequest) -> Result<(), GatewayError> {
        if request.messages.is_empty() {
            return Err(GatewayError::invalid_request_param("messages must not be empty", "messages"));
        }

        if let Some(t) = request.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(GatewayError::invalid_request_param("temperature must be in [0, 2]", "temperature"));
            }
        }

        if let Some(p) = request.top_p {
            if !(p > 0.0 && p <= 1.0) {
                return Err(GatewayError::invalid_request_param("top_p must be in (0, 1]", "top_p"));
            }
        }

        if let Some(max_tokens) = request.max_tokens {
            if max_tokens < 1 {
                return Err(GatewayError::invalid_request_param("max_tokens must be >= 1", "max_tokens"));
            }
        }

        Ok(())
    }

    fn translate_message(&self, message: Message) -> Result<UpstreamMessage, GatewayError> {
        match message.role {
            Role::Tool => self.translate_tool_message(message),
            Role::Assistant => self.translate_assistant_message(message),
            Role::User => self.translate_user_message(message),
            Role::System => unreachable!("system messages are partitioned out before this point"),
        }
    }

    fn translate_tool_message(&self, message: Message) -> Result<UpstreamMessage, GatewayError> {
        if let Some(content) = &message.content {
            if let Some((part_tool_call_id, text)) = content.as_tool_result() {
                let tool_use_id = part_tool_call_id
                    .map(str::to_string)
                    .or(message.tool_call_id)
                    .ok_or_else(|| GatewayError::invalid_request_param("tool message missing tool_call_id", "tool_call_id"))?;

                return Ok(UpstreamMessage {
                    role: UpstreamRole::User,
                    content: vec![ContentBlock::ToolResult { tool_use_id, content: text.to_string() }],
                });
            }
        }

        let tool_use_id = message
            .tool_call_id
            .ok_or_else(|| GatewayError::invalid_request_param("tool message missing tool_call_id", "tool_call_id"))?;

        let text = message.content.and_then(|c| c.as_plain_text()).unwrap_or_default();

        Ok(UpstreamMessage {
            role: UpstreamRole::User,
            content: vec![ContentBlock::ToolResult { tool_use_id, content: text }],
        })
    }

    fn translate_assistant_message(&self, message: Message) -> Result<UpstreamMessage, GatewayError> {
        let mut blocks = Vec::new();

        if let Some(text) = message.content.and_then(|c| c.as_plain_text()) {
            if !text.is_empty() {
                blocks.push(ContentBlock::Text(text));
            }
        }

        for call in message.tool_calls.into_iter().flatten() {
            blocks.push(self.translate_tool_call(call.id, call.function)?);
        }

        Ok(UpstreamMessage { role: UpstreamRole::Assistant, content: blocks })
    }

    fn translate_tool_call(&self, id: String, function: FunctionCall) -> Result<ContentBlock, GatewayError> {
        let input = serde_json::from_str(&function.arguments)
            .map_err(|_| GatewayError::invalid_request_param("tool_calls[].function.arguments is not valid JSON", "tool_calls.arguments"))?;

        Ok(ContentBlock::ToolUse { id, name: function.name, input })
    }

    fn translate_user_message(&self, message: Message) -> Result<UpstreamMessage, GatewayError> {
        let parts = match message.content {
            Some(MessageContent::Text(text)) => vec![ContentPart::Text { text }],
            Some(MessageContent::Parts(parts)) => parts,
            None => Vec::new(),
        };

        let mut blocks = Vec::with_capacity(parts.len());
        for part in parts {
            blocks.push(self.translate_content_part(part)?);
        }

        Ok(UpstreamMessage { role: UpstreamRole::User, content: blocks })
    }

    fn translate_content_part(&self, part: ContentPart) -> Result<ContentBlock, GatewayError> {
        match part {
            ContentPart::Text { text } => Ok(ContentBlock::Text(text)),
            ContentPart::ImageUrl { image_url } => {
                if !self.features.enable_vision {
                    return Err(GatewayError::invalid_request("vision input is not enabled on this gateway"));
                }
                decode_image_url(&image_url.url)
            }
        }
    }

    fn translate_tool_config(
        &self,
        tools: Vec<crate::messages::openai::Tool>,
        tool_choice: Option<ToolChoice>,
    ) -> Result<ToolConfig, GatewayError> {
        let tool_choice = match tool_choice {
            None => Some(ToolChoiceSpec::Auto),
            Some(ToolChoice::Mode(mode)) => match mode.as_str() {
                "auto" => Some(ToolChoiceSpec::Auto),
                "required" => Some(ToolChoiceSpec::Any),
                other => {
                    return Err(GatewayError::invalid_request_param(
                        format!("unsupported tool_choice '{other}'"),
                        "tool_choice",
                    ));
                }
            },
            Some(ToolChoice::Function { function }) => Some(ToolChoiceSpec::Tool { name: function.name }),
        };

        let specs = tools
            .into_iter()
            .map(|tool| ToolSpec {
                name: tool.function.name,
                description: tool.function.description,
                input_schema: tool.function.parameters,
            })
            .collect();

        Ok(ToolConfig { tools: specs, tool_choice })
    }
}

fn is_tool_choice_none(tool_choice: &Option<ToolChoice>) -> bool {
    matches!(tool_choice, Some(ToolChoice::Mode(mode)) if mode == "none")
}

fn partition_system_messages(messages: Vec<Message>) -> (Vec<String>, Vec<Message>) {
    let mut system = Vec::new();
    let mut candidates = Vec::new();

    for message in messages {
        if message.role == Role::System {
            if let Some(text) = message.content.and_then(|c| c.as_plain_text()) {
                system.push(text);
            }
        } else {
            candidates.push(message);
        }
    }

    (system, candidates)
}

fn coalesce_adjacent_same_role(messages: Vec<UpstreamMessage>) -> Vec<UpstreamMessage> {
    let mut out: Vec<UpstreamMessage> = Vec::with_capacity(messages.len());

    for message in messages {
        match out.last_mut() {
            Some(last) if last.role == message.role => last.content.extend(message.content),
            _ => out.push(message),
        }
    }

    out
}

fn decode_image_url(url: &str) -> Result<ContentBlock, GatewayError> {
    if let Some(rest) = url.strip_prefix("data:") {
        let Some((header, payload)) = rest.split_once(";base64,") else {
            return Err(GatewayError::invalid_request("image_url data URI must use base64 encoding"));
        };

        let Some(format) = ImageFormat::from_mime(header) else {
            return Err(GatewayError::invalid_request(format!("unsupported image mime type '{header}'")));
        };

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|_| GatewayError::invalid_request("image_url payload is not valid base64"))?;

        return Ok(ContentBlock::Image { format, bytes });
    }

    if url.starts_with("http://") || url.starts_with("https://") {
        return Err(GatewayError::invalid_request(
            "fetching remote image URLs is not supported by this gateway instance",
        ));
    }

    Err(GatewayError::invalid_request("image_url must be a data: URI or http(s) URL"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::openai::{ChatRequest, Role};

    fn features() -> TranslatorFeatures {
        TranslatorFeatures { enable_vision: true, enable_tool_use: true, enable_extended_thinking: true }
    }

    fn user_message(text: &str) -> Message {
        Message {
            role: Role::User,
            content: Some(MessageContent::Text(text.to_string())),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    #[test]
    fn system_messages_become_ordered_text_blocks() {
        let request: ChatRequest = serde_json::from_str(
            r#"{"model":"m","messages":[
                {"role":"system","content":"S1"},
                {"role":"user","content":"U1"},
                {"role":"system","content":"S2"},
                {"role":"user","content":"U2"}
            ]}"#,
        )
        .unwrap();

        let translator = RequestTranslator::new(features());
        let upstream = translator.translate(request, "model-id".to_string()).unwrap();

        assert_eq!(upstream.system, vec!["S1".to_string(), "S2".to_string()]);
        assert_eq!(upstream.messages.len(), 1, "adjacent user messages coalesce");
        assert_eq!(upstream.messages[0].content.len(), 2);
    }

    #[test]
    fn tool_role_message_becomes_user_tool_result() {
        let request: ChatRequest = serde_json::from_str(
            r#"{"model":"m","messages":[
                {"role":"user","content":"weather?"},
                {"role":"assistant","content":null,"tool_calls":[{"id":"tu_1","function":{"name":"get_weather","arguments":"{\"location\":\"Tokyo\"}"}}]},
                {"role":"tool","tool_call_id":"tu_1","content":"22C"}
            ]}"#,
        )
        .unwrap();

        let translator = RequestTranslator::new(features());
        let upstream = translator.translate(request, "model-id".to_string()).unwrap();

        assert_eq!(upstream.messages.len(), 3);
        match &upstream.messages[2].content[0] {
            ContentBlock::ToolResult { tool_use_id, content } => {
                assert_eq!(tool_use_id, "tu_1");
                assert_eq!(content, "22C");
            }
            other => panic!("expected tool result block, got {other:?}"),
        }
    }

    #[test]
    fn tool_message_with_parts_array_content_is_translated() {
        let request: ChatRequest = serde_json::from_str(
            r#"{"model":"m","messages":[
                {"role":"user","content":"weather?"},
                {"role":"assistant","content":null,"tool_calls":[{"id":"tu_1","function":{"name":"get_weather","arguments":"{}"}}]},
                {"role":"tool","tool_call_id":"tu_1","content":[{"type":"tool_result","tool_call_id":"tu_1","content":"22C"}]}
            ]}"#,
        )
        .unwrap();

        let translator = RequestTranslator::new(features());
        let upstream = translator.translate(request, "model-id".to_string()).unwrap();

        match &upstream.messages[2].content[0] {
            ContentBlock::ToolResult { tool_use_id, content } => {
                assert_eq!(tool_use_id, "tu_1");
                assert_eq!(content, "22C");
            }
            other => panic!("expected tool result block, got {other:?}"),
        }
    }

    #[test]
    fn malformed_tool_call_arguments_fail_with_named_param() {
        let request: ChatRequest = serde_json::from_str(
            r#"{"model":"m","messages":[
                {"role":"assistant","content":null,"tool_calls":[{"id":"tu_1","function":{"name":"f","arguments":"not json"}}]}
            ]}"#,
        )
        .unwrap();

        let translator = RequestTranslator::new(features());
        let err = translator.translate(request, "model-id".to_string()).unwrap_err();

        match err {
            GatewayError::InvalidRequest { param, .. } => assert_eq!(param.as_deref(), Some("tool_calls.arguments")),
            other => panic!("expected invalid_request_error, got {other:?}"),
        }
    }

    #[test]
    fn data_url_png_decodes_to_image_block() {
        let payload = base64::engine::general_purpose::STANDARD.encode(b"\x89PNG...");
        let request = ChatRequest {
            model: "m".to_string(),
            messages: vec![Message {
                role: Role::User,
                content: Some(MessageContent::Parts(vec![ContentPart::ImageUrl {
                    image_url: crate::messages::openai::ImageUrl { url: format!("data:image/png;base64,{payload}") },
                }])),
                tool_calls: None,
                tool_call_id: None,
            }],
            stream: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
            tools: None,
            tool_choice: None,
            thinking: None,
        };

        let translator = RequestTranslator::new(features());
        let upstream = translator.translate(request, "model-id".to_string()).unwrap();

        match &upstream.messages[0].content[0] {
            ContentBlock::Image { format, bytes } => {
                assert_eq!(*format, ImageFormat::Png);
                assert_eq!(bytes, b"\x89PNG...");
            }
            other => panic!("expected image block, got {other:?}"),
        }
    }

    #[test]
    fn thinking_enabled_conflicts_with_explicit_temperature() {
        let mut request: ChatRequest = serde_json::from_str(r#"{"model":"m","messages":[{"role":"user","content":"hi"}]}"#).unwrap();
        request.messages = vec![user_message("hi")];
        request.temperature = Some(0.5);
        request.thinking = Some(crate::messages::openai::ThinkingConfig { kind: "enabled".to_string(), budget_tokens: 1024 });

        let translator = RequestTranslator::new(features());
        let err = translator.translate(request, "model-id".to_string()).unwrap_err();

        match err {
            GatewayError::InvalidRequest { param, .. } => assert_eq!(param.as_deref(), Some("temperature")),
            other => panic!("expected invalid_request_error, got {other:?}"),
        }
    }

    #[test]
    fn tool_choice_none_drops_tool_config_entirely() {
        let request: ChatRequest = serde_json::from_str(
            r#"{"model":"m","messages":[{"role":"user","content":"hi"}],"tools":[{"type":"function","function":{"name":"f","parameters":{}}}],"tool_choice":"none"}"#,
        )
        .unwrap();

        let translator = RequestTranslator::new(features());
        let upstream = translator.translate(request, "model-id".to_string()).unwrap();

        assert!(upstream.tool_config.unwrap().tool_choice.is_none());
    }

    #[test]
    fn empty_stop_list_omits_stop_sequences() {
        let request: ChatRequest = serde_json::from_str(
            r#"{"model":"m","messages":[{"role":"user","content":"hi"}],"stop":[]}"#,
        )
        .unwrap();

        let translator = RequestTranslator::new(features());
        let upstream = translator.translate(request, "model-id".to_string()).unwrap();

        assert!(upstream.inference_config.stop_sequences.is_empty());
    }

    #[test]
    fn vision_disabled_feature_gate_rejects_image_part() {
        let request = ChatRequest {
            model: "m".to_string(),
            messages: vec![Message {
                role: Role::User,
                content: Some(MessageContent::Parts(vec![ContentPart::ImageUrl {
                    image_url: crate::messages::openai::ImageUrl { url: "data:image/png;base64,AA==".to_string() },
                }])),
                tool_calls: None,
                tool_call_id: None,
            }],
            stream: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
            tools: None,
            tool_choice: None,
            thinking: None,
        };

        let translator =
            RequestTranslator::new(TranslatorFeatures { enable_vision: false, enable_tool_use: true, enable_extended_thinking: true });
        let err = translator.translate(request, "model-id".to_string()).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));
    }
}
