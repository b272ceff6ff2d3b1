//! ConverseStream event normalizer

use serde_json::Value;

use crate::drivers::bedrock::{bedrock_usage, finish_reason};
use crate::drivers::{new_call_id, vendor_error};
use crate::types::{Delta, StreamCompletionResponse};
use crate::{Error, PipeResult};

use super::{str_at, u64_at, StreamNormalizer, StreamState, VendorEvent};

const EVENT_NAMES: [&str; 6] = [
    "messageStart",
    "contentBlockStart",
    "contentBlockDelta",
    "contentBlockStop",
    "messageStop",
    "metadata",
];

/// Tool calls are keyed by `contentBlockIndex`; reasoning signatures and
/// redacted blobs ride on their own delta chunks.
pub struct BedrockNormalizer {
    state: StreamState,
}

impl BedrockNormalizer {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            state: StreamState::new(model),
        }
    }

    fn block_key(data: &Value) -> String {
        u64_at(data, "/contentBlockIndex").unwrap_or(0).to_string()
    }

    fn on_block_start(&mut self, data: &Value) -> Vec<StreamCompletionResponse> {
        let Some(tool) = data.pointer("/start/toolUse") else {
            return Vec::new();
        };
        let id = str_at(tool, "/toolUseId")
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(new_call_id);
        let name = str_at(tool, "/name").unwrap_or_default();
        vec![self.state.start_tool(Self::block_key(data), id, name)]
    }

    fn on_block_delta(&mut self, data: &Value) -> Vec<StreamCompletionResponse> {
        let Some(delta) = data.get("delta") else {
            return Vec::new();
        };
        let mut out = Vec::new();
        if let Some(text) = str_at(delta, "/text").filter(|t| !t.is_empty()) {
            out.push(self.state.text(text));
        }
        if let Some(input) = str_at(delta, "/toolUse/input") {
            let key = Self::block_key(data);
            if self.state.tool_index(&key).is_none() {
                // Some models skip contentBlockStart for tools.
                out.push(self.state.start_tool(key.clone(), new_call_id(), ""));
            }
            out.extend(self.state.tool_arguments(&key, input));
        }
        if let Some(reasoning) = delta.get("reasoningContent") {
            if let Some(text) = str_at(reasoning, "/text").filter(|t| !t.is_empty()) {
                out.push(self.state.reasoning(text));
            }
            if let Some(sig) = str_at(reasoning, "/signature") {
                out.push(self.state.delta(Delta {
                    reasoning_content_signature: Some(sig.to_string()),
                    ..Delta::default()
                }));
            }
            if let Some(blob) = str_at(reasoning, "/redactedContent") {
                out.push(self.state.delta(Delta {
                    redacted_reasoning_content: Some(blob.to_string()),
                    ..Delta::default()
                }));
            }
        }
        out
    }

    /// Frames without an `:event-type` arrive wrapped as `{"<name>": {...}}`.
    fn unwrap_event(event: Option<String>, data: Value) -> (Option<String>, Value) {
        if event.is_some() {
            return (event, data);
        }
        if let Value::Object(map) = &data {
            if map.len() == 1 {
                if let Some((name, inner)) = map.iter().next() {
                    if EVENT_NAMES.contains(&name.as_str()) {
                        return (Some(name.clone()), inner.clone());
                    }
                }
            }
        }
        (None, data)
    }
}

impl StreamNormalizer for BedrockNormalizer {
    fn on_event(&mut self, event: VendorEvent) -> PipeResult<Vec<StreamCompletionResponse>> {
        let (name, data) = match event {
            VendorEvent::Done => return Ok(Vec::new()),
            VendorEvent::Frame { event, data } => Self::unwrap_event(event, data),
        };
        let out = match name.as_deref() {
            Some("contentBlockStart") => self.on_block_start(&data),
            Some("contentBlockDelta") => self.on_block_delta(&data),
            Some("messageStop") => {
                let reason = str_at(&data, "/stopReason").unwrap_or("end_turn");
                vec![self.state.finish(finish_reason(reason))]
            }
            Some("metadata") => data
                .get("usage")
                .and_then(bedrock_usage)
                .map(|u| vec![self.state.usage_chunk(u)])
                .unwrap_or_default(),
            Some("exception") => {
                let kind = str_at(&data, "/type").unwrap_or_default();
                let message = str_at(&data, "/message").unwrap_or("vendor stream error");
                tracing::warn!(exception = kind, "bedrock stream exception");
                return Err(Error::Channel(vendor_error(None, kind, message)));
            }
            _ => Vec::new(),
        };
        Ok(out)
    }

    fn state(&self) -> &StreamState {
        &self.state
    }
}
