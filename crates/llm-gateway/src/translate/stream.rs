//! C7: upstream event stream -> OpenAI SSE chunks.
//!
//! One [`StreamTranslator`] is owned per in-flight request. It is fed upstream
//! [`StreamEvent`]s in order and returns zero or more chunks to emit for each.

use crate::{
    messages::openai::{ChatCompletionChunk, ChunkChoice, Delta, FunctionCallDelta, ToolCallDelta, Usage},
    translate::response::finish_reason_for,
    upstream_types::{ContentBlockDelta, ContentBlockStart, StopReason, StreamEvent, UpstreamUsage},
};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    ToolUse,
    Thinking,
}

pub struct StreamTranslator {
    id: String,
    created: u64,
    client_model_id: String,
    block_kinds: HashMap<u32, BlockKind>,
    tool_call_indices: HashMap<u32, u32>,
    next_tool_call_index: u32,
    finish_reason: Option<StopReason>,
    usage: Option<UpstreamUsage>,
}

impl StreamTranslator {
    pub fn new(id: String, created: u64, client_model_id: String) -> Self {
        Self {
            id,
            created,
            client_model_id,
            block_kinds: HashMap::new(),
            tool_call_indices: HashMap::new(),
            next_tool_call_index: 0,
            finish_reason: None,
            usage: None,
        }
    }

    /// Feeds one upstream event, returning the (zero or one) OpenAI chunks it produces.
    pub fn handle_event(&mut self, event: StreamEvent) -> Vec<ChatCompletionChunk> {
        match event {
            StreamEvent::MessageStart => vec![self.chunk(Delta { role: Some("assistant"), ..Default::default() }, None)],

            StreamEvent::ContentBlockStart { index, block } => match block {
                ContentBlockStart::Text => {
                    self.block_kinds.insert(index, BlockKind::Text);
                    vec![]
                }
                ContentBlockStart::Thinking => {
                    self.block_kinds.insert(index, BlockKind::Thinking);
                    vec![]
                }
                ContentBlockStart::ToolUse { tool_use_id, name } => {
                    self.block_kinds.insert(index, BlockKind::ToolUse);
                    let tool_call_index = self.next_tool_call_index;
                    self.next_tool_call_index += 1;
                    self.tool_call_indices.insert(index, tool_call_index);

                    let delta = Delta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index: tool_call_index,
                            id: Some(tool_use_id),
                            kind: Some("function"),
                            function: FunctionCallDelta { name: Some(name), arguments: Some(String::new()) },
                        }]),
                        ..Default::default()
                    };

                    vec![self.chunk(delta, None)]
                }
            },

            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                ContentBlockDelta::Text(text) => {
                    vec![self.chunk(Delta { content: Some(text), ..Default::default() }, None)]
                }
                ContentBlockDelta::Thinking(text) => {
                    vec![self.chunk(Delta { thinking: Some(text), ..Default::default() }, None)]
                }
                ContentBlockDelta::ToolUsePartialJson(partial_json) => {
                    let Some(&tool_call_index) = self.tool_call_indices.get(&index) else {
                        return vec![];
                    };

                    let delta = Delta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index: tool_call_index,
                            id: None,
                            kind: None,
                            function: FunctionCallDelta { name: None, arguments: Some(partial_json) },
                        }]),
                        ..Default::default()
                    };

                    vec![self.chunk(delta, None)]
                }
            },

            StreamEvent::ContentBlockStop { .. } => vec![],

            StreamEvent::MessageDelta { stop_reason, usage } => {
                self.finish_reason = Some(stop_reason);
                if let Some(usage) = usage {
                    self.usage = Some(usage);
                }
                vec![]
            }

            StreamEvent::MessageStop => {
                let finish_reason = self.finish_reason.unwrap_or(StopReason::Other);
                let usage = self.usage.map(|u| Usage {
                    prompt_tokens: u.input_tokens,
                    completion_tokens: u.output_tokens,
                    total_tokens: u.input_tokens + u.output_tokens,
                });

                vec![self.chunk(Delta::default(), Some((finish_reason_for(finish_reason).to_string(), usage)))]
            }
        }
    }

    /// Produces the synthetic terminal chunk for a connection that dropped before `MessageStop`.
    pub fn on_upstream_failure(&self) -> ChatCompletionChunk {
        self.chunk(Delta::default(), Some(("error".to_string(), None)))
    }

    /// Token counts captured off `MessageDelta`/`Metadata`, for the usage row. Zeroed
    /// if the stream never carried a usage event (e.g. it failed before `MessageStop`).
    pub fn captured_usage(&self) -> (u32, u32, u32) {
        match self.usage {
            Some(u) => (u.input_tokens, u.output_tokens, u.input_tokens + u.output_tokens),
            None => (0, 0, 0),
        }
    }

    fn chunk(&self, delta: Delta, finish: Option<(String, Option<Usage>)>) -> ChatCompletionChunk {
        let (finish_reason, usage) = match finish {
            Some((reason, usage)) => (Some(reason), usage),
            None => (None, None),
        };

        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.client_model_id.clone(),
            choices: vec![ChunkChoice { index: 0, delta, finish_reason }],
            usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_start_emits_role_delta() {
        let mut translator = StreamTranslator::new("chatcmpl-1".to_string(), 0, "gpt-4o".to_string());
        let chunks = translator.handle_event(StreamEvent::MessageStart);

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].choices[0].delta.role, Some("assistant"));
    }

    #[test]
    fn text_deltas_concatenate_in_event_order() {
        let mut translator = StreamTranslator::new("id".to_string(), 0, "gpt-4o".to_string());
        translator.handle_event(StreamEvent::MessageStart);
        translator.handle_event(StreamEvent::ContentBlockStart { index: 0, block: ContentBlockStart::Text });

        let mut text = String::new();
        for fragment in ["Hel", "lo"] {
            let chunks = translator.handle_event(StreamEvent::ContentBlockDelta {
                index: 0,
                delta: ContentBlockDelta::Text(fragment.to_string()),
            });
            text.push_str(chunks[0].choices[0].delta.content.as_deref().unwrap());
        }

        assert_eq!(text, "Hello");
    }

    #[test]
    fn concurrent_tool_calls_get_dense_zero_based_indices() {
        let mut translator = StreamTranslator::new("id".to_string(), 0, "gpt-4o".to_string());

        let first = translator.handle_event(StreamEvent::ContentBlockStart {
            index: 0,
            block: ContentBlockStart::ToolUse { tool_use_id: "tu_1".to_string(), name: "a".to_string() },
        });
        let second = translator.handle_event(StreamEvent::ContentBlockStart {
            index: 2,
            block: ContentBlockStart::ToolUse { tool_use_id: "tu_2".to_string(), name: "b".to_string() },
        });

        let first_index = first[0].choices[0].delta.tool_calls.as_ref().unwrap()[0].index;
        let second_index = second[0].choices[0].delta.tool_calls.as_ref().unwrap()[0].index;

        assert_eq!(first_index, 0);
        assert_eq!(second_index, 1, "tool_call_index must be dense from zero, not the block index");
    }

    #[test]
    fn message_stop_carries_finish_reason_and_usage() {
        let mut translator = StreamTranslator::new("id".to_string(), 0, "gpt-4o".to_string());
        translator.handle_event(StreamEvent::MessageDelta {
            stop_reason: StopReason::EndTurn,
            usage: Some(UpstreamUsage { input_tokens: 3, output_tokens: 2 }),
        });

        let chunks = translator.handle_event(StreamEvent::MessageStop);
        assert_eq!(chunks[0].choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(chunks[0].usage.unwrap().total_tokens, 5);
    }
}
