//! Chat-completions chunk normalizer (OpenAI and compatible dialects)

use serde_json::Value;

use crate::channel::Vendor;
use crate::drivers::embedded_error;
use crate::drivers::openai::openai_usage;
use crate::types::{FinishReason, StreamCompletionResponse};
use crate::{Error, PipeResult};

use super::{str_at, StreamNormalizer, StreamState, VendorEvent};

/// Re-indexes vendor tool-call fragments and splits mixed deltas into one
/// chunk per concern: reasoning, then content, then tool calls.
pub struct OpenAiNormalizer {
    vendor: Vendor,
    state: StreamState,
    seen_frame: bool,
}

impl OpenAiNormalizer {
    pub fn new(vendor: Vendor, model: impl Into<String>) -> Self {
        Self {
            vendor,
            state: StreamState::new(model),
            seen_frame: false,
        }
    }

    fn on_choice(&mut self, choice: &Value, out: &mut Vec<StreamCompletionResponse>) {
        if let Some(delta) = choice.get("delta") {
            let reasoning = str_at(delta, "/reasoning_content").or_else(|| str_at(delta, "/reasoning"));
            if let Some(text) = reasoning.filter(|t| !t.is_empty()) {
                out.push(self.state.reasoning(text));
            }
            if let Some(text) = str_at(delta, "/content").filter(|t| !t.is_empty()) {
                out.push(self.state.text(text));
            }
            if let Some(calls) = delta.get("tool_calls").and_then(|c| c.as_array()) {
                for (pos, call) in calls.iter().enumerate() {
                    self.on_tool_fragment(call, pos, out);
                }
            }
        }
        if let Some(reason) = str_at(choice, "/finish_reason") {
            out.push(self.state.finish(FinishReason::from_openai(reason)));
        }
        if let Some(usage) = choice.get("usage").and_then(openai_usage) {
            out.push(self.state.usage_chunk(usage));
        }
    }

    fn on_tool_fragment(&mut self, call: &Value, pos: usize, out: &mut Vec<StreamCompletionResponse>) {
        let key = call
            .get("index")
            .and_then(|i| i.as_u64())
            .unwrap_or(pos as u64)
            .to_string();
        if self.state.tool_index(&key).is_none() {
            let id = str_at(call, "/id")
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .unwrap_or_else(crate::drivers::new_call_id);
            let name = str_at(call, "/function/name").unwrap_or_default();
            out.push(self.state.start_tool(key.clone(), id, name));
        }
        if let Some(fragment) = str_at(call, "/function/arguments") {
            out.extend(self.state.tool_arguments(&key, fragment));
        }
    }
}

impl StreamNormalizer for OpenAiNormalizer {
    fn on_event(&mut self, event: VendorEvent) -> PipeResult<Vec<StreamCompletionResponse>> {
        let data = match event {
            VendorEvent::Done => {
                self.state.finished = true;
                return Ok(Vec::new());
            }
            VendorEvent::Frame { data, .. } => data,
        };
        if let Some(err) = data.get("error").filter(|e| !e.is_null()) {
            tracing::warn!(vendor = %self.vendor, "vendor reported an error mid-stream");
            return Err(Error::Channel(embedded_error(err)));
        }
        if !self.seen_frame {
            self.seen_frame = true;
            if let Some(id) = str_at(&data, "/id").filter(|id| !id.is_empty()) {
                self.state.id = id.to_string();
            }
        }

        let mut out = Vec::new();
        if let Some(choices) = data.get("choices").and_then(|c| c.as_array()) {
            for choice in choices {
                self.on_choice(choice, &mut out);
            }
        }
        if let Some(usage) = data.get("usage").and_then(openai_usage) {
            out.push(self.state.usage_chunk(usage));
        }
        Ok(out)
    }

    fn state(&self) -> &StreamState {
        &self.state
    }
}
