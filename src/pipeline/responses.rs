//! Responses API typed-event normalizer

use serde_json::Value;

use crate::drivers::embedded_error;
use crate::drivers::new_call_id;
use crate::drivers::responses::{finish_from_status, responses_usage};
use crate::types::StreamCompletionResponse;
use crate::{Error, PipeResult};

use super::{str_at, StreamNormalizer, StreamState, VendorEvent};

/// Function calls are keyed by output item id; argument deltas reference the
/// item, not the call id.
pub struct ResponsesNormalizer {
    state: StreamState,
}

impl ResponsesNormalizer {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            state: StreamState::new(model),
        }
    }

    fn on_item_added(&mut self, data: &Value) -> Vec<StreamCompletionResponse> {
        let Some(item) = data.get("item").filter(|i| str_at(i, "/type") == Some("function_call")) else {
            return Vec::new();
        };
        let key = str_at(item, "/id").unwrap_or_default().to_string();
        let id = str_at(item, "/call_id")
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(new_call_id);
        let name = str_at(item, "/name").unwrap_or_default();
        let mut out = vec![self.state.start_tool(key.clone(), id, name)];
        if let Some(args) = str_at(item, "/arguments") {
            out.extend(self.state.tool_arguments(&key, args));
        }
        out
    }

    fn on_terminal(&mut self, response: &Value) -> Vec<StreamCompletionResponse> {
        let mut out = vec![self.state.finish(finish_from_status(response))];
        if let Some(usage) = response.get("usage").and_then(responses_usage) {
            out.push(self.state.usage_chunk(usage));
        }
        out
    }
}

impl StreamNormalizer for ResponsesNormalizer {
    fn on_event(&mut self, event: VendorEvent) -> PipeResult<Vec<StreamCompletionResponse>> {
        let (name, data) = match event {
            VendorEvent::Done => return Ok(Vec::new()),
            VendorEvent::Frame { event, data } => (event, data),
        };
        let kind = str_at(&data, "/type")
            .map(str::to_string)
            .or(name)
            .unwrap_or_default();
        let delta = || str_at(&data, "/delta").filter(|d| !d.is_empty());
        let out = match kind.as_str() {
            "response.created" => {
                if let Some(id) = str_at(&data, "/response/id").filter(|id| !id.is_empty()) {
                    self.state.id = id.to_string();
                }
                Vec::new()
            }
            "response.output_item.added" => self.on_item_added(&data),
            "response.output_text.delta" => delta().map(|d| vec![self.state.text(d)]).unwrap_or_default(),
            "response.reasoning_summary_text.delta" => {
                delta().map(|d| vec![self.state.reasoning(d)]).unwrap_or_default()
            }
            "response.function_call_arguments.delta" => {
                let key = str_at(&data, "/item_id").unwrap_or_default();
                delta()
                    .and_then(|d| self.state.tool_arguments(key, d))
                    .into_iter()
                    .collect()
            }
            "response.completed" | "response.incomplete" => {
                let response = data.get("response").cloned().unwrap_or(Value::Null);
                self.on_terminal(&response)
            }
            "response.failed" => {
                let err = data.pointer("/response/error").cloned().unwrap_or(Value::Null);
                tracing::warn!("responses stream failed");
                return Err(Error::Channel(embedded_error(&err)));
            }
            "error" => {
                tracing::warn!("responses stream error event");
                return Err(Error::Channel(embedded_error(&data)));
            }
            _ => Vec::new(),
        };
        Ok(out)
    }

    fn state(&self) -> &StreamState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::accumulate::StreamAccumulator;
    use crate::types::FinishReason;
    use serde_json::json;

    fn run(events: Vec<Value>) -> (ResponsesNormalizer, Vec<StreamCompletionResponse>) {
        let mut n = ResponsesNormalizer::new("gpt-5");
        let mut out = Vec::new();
        for e in events {
            out.extend(n.on_event(VendorEvent::data(e)).unwrap());
        }
        (n, out)
    }

    #[test]
    fn interleaved_function_calls_by_item_id() {
        let (n, chunks) = run(vec![
            json!({"type": "response.created", "response": {"id": "resp_7"}}),
            json!({"type": "response.output_item.added", "item": {"type": "function_call", "id": "fc_a", "call_id": "call_a", "name": "weather", "arguments": ""}}),
            json!({"type": "response.output_item.added", "item": {"type": "function_call", "id": "fc_b", "call_id": "call_b", "name": "time", "arguments": ""}}),
            json!({"type": "response.function_call_arguments.delta", "item_id": "fc_b", "delta": "{}"}),
            json!({"type": "response.function_call_arguments.delta", "item_id": "fc_a", "delta": "{\"city\":"}),
            json!({"type": "response.function_call_arguments.delta", "item_id": "fc_a", "delta": "\"Kyiv\"}"}),
            json!({"type": "response.completed", "response": {"status": "completed",
                "usage": {"input_tokens": 9, "output_tokens": 11, "total_tokens": 20}}}),
        ]);
        assert!(n.is_finished());
        assert_eq!(n.state().finish_reason, Some(FinishReason::ToolCalls));
        let mut acc = StreamAccumulator::new();
        chunks.iter().for_each(|c| acc.push(c));
        let resp = acc.finish();
        assert_eq!(resp.id, "resp_7");
        let calls = resp.first_message().unwrap().tool_calls.clone().unwrap();
        assert_eq!((calls[0].id.as_str(), calls[0].function.arguments.as_str()), ("call_a", "{\"city\":\"Kyiv\"}"));
        assert_eq!((calls[1].id.as_str(), calls[1].function.arguments.as_str()), ("call_b", "{}"));
        assert_eq!(resp.usage.unwrap().total_tokens, 20);
    }

    #[test]
    fn text_and_reasoning_deltas() {
        let (_, chunks) = run(vec![
            json!({"type": "response.reasoning_summary_text.delta", "delta": "why"}),
            json!({"type": "response.output_text.delta", "delta": "Because"}),
            json!({"type": "response.incomplete", "response": {"status": "incomplete",
                "incomplete_details": {"reason": "max_output_tokens"}}}),
        ]);
        let mut acc = StreamAccumulator::new();
        chunks.iter().for_each(|c| acc.push(c));
        let resp = acc.finish();
        assert_eq!(resp.first_message().unwrap().text(), "Because");
        assert_eq!(resp.choices[0].finish_reason, Some(FinishReason::Length));
    }

    #[test]
    fn failed_event_is_an_error() {
        let mut n = ResponsesNormalizer::new("gpt-5");
        let err = n
            .on_event(VendorEvent::named(
                "response.failed",
                json!({"response": {"error": {"code": "server_error", "message": "boom"}}}),
            ))
            .unwrap_err();
        assert_eq!(err.to_channel_error().message, "boom");
    }
}
