//! Folds canonical stream chunks back into one completion response.

use std::collections::BTreeMap;

use crate::types::{
    ApiError, Choice, CompletionResponse, FinishReason, Message, MessageContent, MessageRole,
    StreamCompletionResponse, TokenUsage, ToolCall,
};

/// Folds canonical stream chunks back into one [`CompletionResponse`].
///
/// Content and reasoning fragments are concatenated in arrival order; tool
/// calls are assembled by canonical index, taking id and name from the first
/// fragment and appending every later argument fragment. An argument fragment
/// for an unseen index opens a new call.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    id: Option<String>,
    created: Option<i64>,
    model: Option<String>,
    content: String,
    reasoning: String,
    signature: String,
    redacted: String,
    tool_calls: BTreeMap<u32, ToolCall>,
    finish_reason: Option<FinishReason>,
    usage: Option<TokenUsage>,
    error: Option<ApiError>,
    chunks: usize,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &StreamCompletionResponse) {
        self.chunks += 1;
        self.id.get_or_insert_with(|| chunk.id.clone());
        self.created.get_or_insert(chunk.created);
        self.model.get_or_insert_with(|| chunk.model.clone());
        if let Some(usage) = &chunk.usage {
            self.usage = Some(usage.clone());
        }
        if let Some(err) = &chunk.error {
            self.error = Some(err.clone());
        }
        for choice in &chunk.choices {
            let delta = &choice.delta;
            if let Some(text) = &delta.content {
                self.content.push_str(text);
            }
            if let Some(text) = &delta.reasoning_content {
                self.reasoning.push_str(text);
            }
            if let Some(sig) = &delta.reasoning_content_signature {
                self.signature.push_str(sig);
            }
            if let Some(blob) = &delta.redacted_reasoning_content {
                self.redacted.push_str(blob);
            }
            for fragment in delta.tool_calls.iter().flatten() {
                let call = self
                    .tool_calls
                    .entry(fragment.index)
                    .or_insert_with(|| ToolCall::new(String::new(), String::new(), String::new()).at_index(fragment.index));
                if let Some(id) = fragment.id.as_ref().filter(|id| call.id.is_empty() && !id.is_empty()) {
                    call.id = id.clone();
                }
                if let Some(f) = &fragment.function {
                    if let Some(name) = f.name.as_ref().filter(|n| call.function.name.is_empty() && !n.is_empty()) {
                        call.function.name = name.clone();
                    }
                    if let Some(args) = &f.arguments {
                        call.function.arguments.push_str(args);
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
        }
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn usage(&self) -> Option<&TokenUsage> {
        self.usage.as_ref()
    }

    pub fn finish(self) -> CompletionResponse {
        let model = self.model.unwrap_or_default();
        let mut response = CompletionResponse::new(model);
        if let Some(id) = self.id {
            response.id = id;
        }
        if let Some(created) = self.created {
            response.created = created;
        }
        if let Some(err) = self.error {
            response.error = Some(err);
            response.usage = self.usage;
            return response;
        }

        let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };
        let content = non_empty(self.content).map(MessageContent::Text);
        let mut message = match content {
            Some(c) => Message::with_content(MessageRole::Assistant, c),
            None => Message {
                content: None,
                ..Message::assistant("")
            },
        };
        message.reasoning_content = non_empty(self.reasoning);
        message.reasoning_content_signature = non_empty(self.signature);
        message.redacted_reasoning_content = non_empty(self.redacted);
        if !self.tool_calls.is_empty() {
            message.tool_calls = Some(self.tool_calls.into_values().collect());
        }
        response.choices.push(Choice {
            index: 0,
            message,
            finish_reason: Some(self.finish_reason.unwrap_or(FinishReason::Stop)),
        });
        response.usage = self.usage;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Delta, ToolCallChunk};

    fn chunk() -> StreamCompletionResponse {
        StreamCompletionResponse::new("chatcmpl-1", 1, "m")
    }

    #[test]
    fn folds_text_reasoning_and_tools() {
        let mut acc = StreamAccumulator::new();
        acc.push(&chunk().with_delta(Delta::reasoning("let me ")));
        acc.push(&chunk().with_delta(Delta::reasoning("think")));
        acc.push(&chunk().with_delta(Delta::content("Hello")));
        acc.push(&chunk().with_delta(Delta::tool_call(ToolCallChunk::started(1, "call_b", "b"))));
        acc.push(&chunk().with_delta(Delta::tool_call(ToolCallChunk::started(0, "call_a", "a"))));
        acc.push(&chunk().with_delta(Delta::tool_call(ToolCallChunk::arguments(0, "{\"x\":"))));
        acc.push(&chunk().with_delta(Delta::tool_call(ToolCallChunk::arguments(1, "{}"))));
        acc.push(&chunk().with_delta(Delta::tool_call(ToolCallChunk::arguments(0, "1}"))));
        acc.push(&chunk().with_finish(FinishReason::ToolCalls));
        acc.push(&chunk().with_usage(TokenUsage::new(3, 4)));
        assert_eq!(acc.chunks(), 10);

        let resp = acc.finish();
        assert_eq!(resp.id, "chatcmpl-1");
        let msg = resp.first_message().unwrap();
        assert_eq!(msg.text(), "Hello");
        assert_eq!(msg.reasoning_content.as_deref(), Some("let me think"));
        let calls = msg.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].function.arguments, "{\"x\":1}");
        assert_eq!(calls[1].index, Some(1));
        assert_eq!(resp.choices[0].finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(resp.usage.unwrap().total_tokens, 7);
    }

    #[test]
    fn tool_only_message_has_no_content() {
        let mut acc = StreamAccumulator::new();
        acc.push(&chunk().with_delta(Delta::tool_call(ToolCallChunk::started(0, "c", "f"))));
        let resp = acc.finish();
        assert!(resp.first_message().unwrap().content.is_none());
        assert_eq!(resp.choices[0].finish_reason, Some(FinishReason::Stop));
    }
}
