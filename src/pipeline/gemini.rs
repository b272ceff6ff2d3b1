//! generateContent SSE normalizer (Gemini / Vertex)

use serde_json::Value;

use crate::drivers::embedded_error;
use crate::drivers::gemini::{finish_reason, gemini_usage};
use crate::drivers::new_call_id;
use crate::tokens::quirks::fold_completion_details;
use crate::types::{Delta, FinishReason, StreamCompletionResponse};
use crate::{Error, PipeResult};

use super::{str_at, StreamNormalizer, StreamState, VendorEvent};

/// Every frame is a complete response object. Function calls arrive whole, so
/// each one is started and given its full arguments in one step.
pub struct GeminiNormalizer {
    state: StreamState,
    calls: usize,
    seen_frame: bool,
}

impl GeminiNormalizer {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            state: StreamState::new(model),
            calls: 0,
            seen_frame: false,
        }
    }

    fn on_part(&mut self, part: &Value, out: &mut Vec<StreamCompletionResponse>) {
        if let Some(call) = part.get("functionCall") {
            let key = self.calls.to_string();
            self.calls += 1;
            let name = str_at(call, "/name").unwrap_or_default();
            out.push(self.state.start_tool(key.clone(), new_call_id(), name));
            let args = call.get("args").map(Value::to_string).unwrap_or_else(|| "{}".into());
            out.extend(self.state.tool_arguments(&key, &args));
        } else if let Some(text) = str_at(part, "/text").filter(|t| !t.is_empty()) {
            if part.get("thought").and_then(|b| b.as_bool()).unwrap_or(false) {
                out.push(self.state.reasoning(text));
            } else {
                out.push(self.state.text(text));
            }
        }
        if let Some(sig) = str_at(part, "/thoughtSignature") {
            out.push(self.state.delta(Delta {
                reasoning_content_signature: Some(sig.to_string()),
                ..Delta::default()
            }));
        }
    }
}

impl StreamNormalizer for GeminiNormalizer {
    fn on_event(&mut self, event: VendorEvent) -> PipeResult<Vec<StreamCompletionResponse>> {
        let data = match event {
            VendorEvent::Done => return Ok(Vec::new()),
            VendorEvent::Frame { data, .. } => data,
        };
        if let Some(err) = data.get("error").filter(|e| !e.is_null()) {
            tracing::warn!("gemini reported an error mid-stream");
            return Err(Error::Channel(embedded_error(err)));
        }
        if !self.seen_frame {
            self.seen_frame = true;
            if let Some(id) = str_at(&data, "/responseId").filter(|id| !id.is_empty()) {
                self.state.id = id.to_string();
            }
        }

        let mut out = Vec::new();
        let candidate = data.pointer("/candidates/0");
        for part in candidate
            .and_then(|c| c.pointer("/content/parts"))
            .and_then(|p| p.as_array())
            .into_iter()
            .flatten()
        {
            self.on_part(part, &mut out);
        }

        let reason = if data.pointer("/promptFeedback/blockReason").is_some() {
            Some(FinishReason::ContentFilter)
        } else {
            candidate
                .and_then(|c| str_at(c, "/finishReason"))
                .map(finish_reason)
        };
        if let Some(reason) = reason {
            out.push(self.state.finish(reason));
            // Usage is repeated on every frame; only the terminal one counts.
            if let Some(mut usage) = data.get("usageMetadata").and_then(gemini_usage) {
                fold_completion_details(&mut usage);
                out.push(self.state.usage_chunk(usage));
            }
        }
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
    use crate::pipeline::decode::SseDecoder;
    use crate::pipeline::normalize;
    use crate::pipeline::test_support::byte_stream;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn sse_frames_to_text_and_folded_usage() {
        let body = byte_stream(vec![
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"hm\",\"thought\":true}]}}],\"usageMetadata\":{\"promptTokenCount\":12}}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hi\"}]}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\" there\"}]},\"finishReason\":\"STOP\"}],",
            "\"usageMetadata\":{\"promptTokenCount\":12,\"candidatesTokenCount\":4,\"thoughtsTokenCount\":863,\"totalTokenCount\":879}}\r\n\r\n",
        ]);
        let mut stream = normalize(body, Box::new(SseDecoder::new()), Box::new(GeminiNormalizer::new("gemini-2.5-pro")))
            .await
            .unwrap();
        let mut acc = StreamAccumulator::new();
        while let Some(chunk) = stream.next().await {
            acc.push(&chunk.unwrap());
        }
        let resp = acc.finish();
        let msg = resp.first_message().unwrap();
        assert_eq!(msg.text(), "Hi there");
        assert_eq!(msg.reasoning_content.as_deref(), Some("hm"));
        let usage = resp.usage.unwrap();
        assert_eq!((usage.completion_tokens, usage.total_tokens), (867, 879));
    }

    #[test]
    fn whole_function_calls_become_start_plus_arguments() {
        let mut n = GeminiNormalizer::new("g");
        let out = n
            .on_event(VendorEvent::data(json!({"candidates": [{"content": {"parts": [
                {"functionCall": {"name": "weather", "args": {"city": "Oslo"}}},
                {"functionCall": {"name": "time", "args": {}}}
            ]}, "finishReason": "STOP"}]})))
            .unwrap();
        let mut acc = StreamAccumulator::new();
        out.iter().for_each(|c| acc.push(c));
        let resp = acc.finish();
        let calls = resp.first_message().unwrap().tool_calls.clone().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].function.arguments, r#"{"city":"Oslo"}"#);
        assert_eq!(calls[1].function.name, "time");
        assert_eq!(resp.choices[0].finish_reason, Some(FinishReason::ToolCalls));
        assert!(n.is_finished());
    }

    #[test]
    fn close_without_finish_reason_fails() {
        let mut n = GeminiNormalizer::new("g");
        n.on_event(VendorEvent::data(json!({"candidates": [{"content": {"parts": [{"text": "par"}]}}]})))
            .unwrap();
        assert_eq!(n.on_end().unwrap_err().to_channel_error().status, 502);
    }
}
