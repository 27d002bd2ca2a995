//! C6: upstream unary response -> OpenAI `ChatCompletion`.

use crate::{
    messages::openai::{ChatCompletion, Choice, ResponseFunctionCall, ResponseMessage, ResponseToolCall, Usage},
    upstream_types::{ContentBlock, StopReason, UnaryUpstreamResponse},
};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn finish_reason_for(stop_reason: StopReason) -> &'static str {
    match stop_reason {
        StopReason::EndTurn | StopReason::StopSequence => "stop",
        StopReason::MaxTokens => "length",
        StopReason::ToolUse => "tool_calls",
        StopReason::ContentFiltered => "content_filter",
        StopReason::Other => "stop",
    }
}

pub struct ResponseTranslator;

impl ResponseTranslator {
    pub fn translate(&self, response: UnaryUpstreamResponse, id: String, client_model_id: String) -> ChatCompletion {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut thinking = String::new();

        for block in response.content {
            match block {
                ContentBlock::Text(t) => text.push_str(&t),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(ResponseToolCall {
                    id,
                    kind: "function",
                    function: ResponseFunctionCall {
                        name,
                        arguments: serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string()),
                    },
                }),
                ContentBlock::Thinking(t) => thinking.push_str(&t),
                ContentBlock::Image { .. } | ContentBlock::ToolResult { .. } => {}
            }
        }

        let content = if text.is_empty() && !tool_calls.is_empty() { None } else { Some(text) };

        let message = ResponseMessage {
            role: "assistant",
            content,
            tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            thinking: if thinking.is_empty() { None } else { Some(thinking) },
        };

        let usage = Usage {
            prompt_tokens: response.usage.input_tokens,
            completion_tokens: response.usage.output_tokens,
            total_tokens: response.usage.input_tokens + response.usage.output_tokens,
        };

        ChatCompletion {
            id,
            object: "chat.completion",
            created: unix_seconds_now(),
            model: client_model_id,
            choices: vec![Choice { index: 0, message, finish_reason: finish_reason_for(response.stop_reason).to_string() }],
            usage,
        }
    }
}

pub fn unix_seconds_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream_types::UpstreamUsage;

    #[test]
    fn text_only_response_has_stop_finish_reason() {
        let response = UnaryUpstreamResponse {
            content: vec![ContentBlock::Text("Hello".to_string())],
            stop_reason: StopReason::EndTurn,
            usage: UpstreamUsage { input_tokens: 3, output_tokens: 2 },
        };

        let completion = ResponseTranslator.translate(response, "chatcmpl-1".to_string(), "gpt-4o".to_string());

        assert_eq!(completion.choices[0].message.content.as_deref(), Some("Hello"));
        assert_eq!(completion.choices[0].finish_reason, "stop");
        assert_eq!(completion.usage.total_tokens, 5);
        assert_eq!(completion.model, "gpt-4o");
    }

    #[test]
    fn tool_use_response_has_null_content_and_tool_calls() {
        let response = UnaryUpstreamResponse {
            content: vec![ContentBlock::ToolUse {
                id: "tu_1".to_string(),
                name: "get_weather".to_string(),
                input: serde_json::json!({"location": "Tokyo"}),
            }],
            stop_reason: StopReason::ToolUse,
            usage: UpstreamUsage { input_tokens: 10, output_tokens: 5 },
        };

        let completion = ResponseTranslator.translate(response, "chatcmpl-2".to_string(), "gpt-4o".to_string());

        assert!(completion.choices[0].message.content.is_none());
        assert_eq!(completion.choices[0].finish_reason, "tool_calls");

        let tool_calls = completion.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(tool_calls[0].id, "tu_1");
        assert_eq!(tool_calls[0].function.arguments, r#"{"location":"Tokyo"}"#);
    }

    #[test]
    fn thinking_blocks_concatenate_into_extension_field() {
        let response = UnaryUpstreamResponse {
            content: vec![ContentBlock::Thinking("step one. ".to_string()), ContentBlock::Thinking("step two.".to_string())],
            stop_reason: StopReason::EndTurn,
            usage: UpstreamUsage { input_tokens: 1, output_tokens: 1 },
        };

        let completion = ResponseTranslator.translate(response, "chatcmpl-3".to_string(), "gpt-4o".to_string());
        assert_eq!(completion.choices[0].message.thinking.as_deref(), Some("step one. step two."));
    }

    #[test]
    fn max_tokens_maps_to_length_finish_reason() {
        assert_eq!(finish_reason_for(StopReason::MaxTokens), "length");
        assert_eq!(finish_reason_for(StopReason::ContentFiltered), "content_filter");
    }
}
