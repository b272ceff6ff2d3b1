//! Bedrock Converse API 驱动 — 实现 Converse / ConverseStream 的请求/响应格式转换
//!
//! Differences from the canonical shape:
//! - System and developer messages go to the top-level `system` block list.
//! - Content is a list of typed blocks (`text`, `image`, `toolUse`,
//!   `toolResult`, `reasoningContent`, `cachePoint`); turns must alternate, so
//!   consecutive same-role messages are merged and tool results join the user
//!   turn.
//! - Images must be base64 data URIs and are sent as raw bytes plus format.
//! - `inferenceConfig` carries sampling; thinking budgets go through
//!   `additionalModelRequestFields`.
//! - Streaming responses use the AWS binary event-stream framing.

use serde_json::{json, Map, Value};

use crate::channel::{ChannelConfig, Vendor};
use crate::pipeline::bedrock::BedrockNormalizer;
use crate::pipeline::eventstream::EventStreamDecoder;
use crate::pipeline::{Decoder, StreamNormalizer};
use crate::transport::HttpRequest;
use crate::types::{
    Choice, CompletionRequest, CompletionResponse, ContentPart, FinishReason, Message,
    MessageContent, MessageRole, TokenUsage, TokensDetail, ToolCall, ToolChoice,
};
use crate::{Error, Result};

use super::{
    apply_channel_headers, decode_data_uri, merge_object, path_segment, push_turn, response_id, tool_arguments, Turn,
    VendorDriver,
};

#[derive(Debug, Clone, Default)]
pub struct BedrockDriver;

impl BedrockDriver {
    pub fn new() -> Self {
        Self
    }

    fn url(channel: &ChannelConfig, model: &str, stream: bool) -> String {
        let action = if stream { "converse-stream" } else { "converse" };
        format!("{}/model/{}/{}", channel.base(), path_segment(model), action)
    }

    fn cache_point() -> Value {
        json!({"cachePoint": {"type": "default"}})
    }

    fn content_blocks(message: &Message, index: usize, cache: bool) -> Result<Vec<Value>> {
        let mut blocks = Vec::new();
        for (j, part) in message.parts().iter().enumerate() {
            let path = format!("messages[{}].content[{}]", index, j);
            match part {
                ContentPart::Text { text, .. } => {
                    if !text.is_empty() {
                        blocks.push(json!({ "text": text }));
                    }
                }
                ContentPart::ImageUrl { image_url, .. } => {
                    let image = decode_data_uri(&image_url.url, &path)?;
                    blocks.push(json!({
                        "image": {"format": image.format(), "source": {"bytes": image.to_base64()}}
                    }));
                }
                ContentPart::Thinking { thinking, signature } => {
                    let mut text = json!({ "text": thinking });
                    if let Some(sig) = signature {
                        text["signature"] = json!(sig);
                    }
                    blocks.push(json!({ "reasoningContent": { "reasoningText": text } }));
                }
                ContentPart::RedactedThinking { data } => {
                    blocks.push(json!({ "reasoningContent": { "redactedContent": data } }));
                }
                ContentPart::ToolCall { id, function } => {
                    let call = ToolCall::new(id.clone(), function.name.clone(), function.arguments.clone());
                    blocks.push(Self::tool_use(&call, &path)?);
                }
            }
            if cache && part.is_cacheable() {
                blocks.push(Self::cache_point());
            }
        }
        Ok(blocks)
    }

    fn tool_use(call: &ToolCall, path: &str) -> Result<Value> {
        Ok(json!({
            "toolUse": {
                "toolUseId": call.id,
                "name": call.function.name,
                "input": tool_arguments(call, path)?,
            }
        }))
    }

    fn assistant_blocks(message: &Message, index: usize, cache: bool) -> Result<Vec<Value>> {
        let mut blocks = Vec::new();
        if let Some(reasoning) = message.reasoning_content.as_deref().filter(|r| !r.is_empty()) {
            let mut text = json!({ "text": reasoning });
            if let Some(sig) = &message.reasoning_content_signature {
                text["signature"] = json!(sig);
            }
            blocks.push(json!({ "reasoningContent": { "reasoningText": text } }));
        }
        if let Some(redacted) = &message.redacted_reasoning_content {
            blocks.push(json!({ "reasoningContent": { "redactedContent": redacted } }));
        }
        blocks.extend(Self::content_blocks(message, index, cache)?);
        for (j, call) in message.tool_calls.iter().flatten().enumerate() {
            blocks.push(Self::tool_use(call, &format!("messages[{}].tool_calls[{}]", index, j))?);
        }
        Ok(blocks)
    }

    fn turns(request: &CompletionRequest, cache: bool) -> Result<Vec<Turn>> {
        let mut turns = Vec::new();
        for (i, message) in request.messages.iter().enumerate() {
            match message.role {
                MessageRole::System | MessageRole::Developer => {}
                MessageRole::User => push_turn(&mut turns, "user", Self::content_blocks(message, i, cache)?),
                MessageRole::Assistant => {
                    push_turn(&mut turns, "assistant", Self::assistant_blocks(message, i, cache)?)
                }
                MessageRole::Tool => {
                    let id = message.tool_call_id.clone().ok_or_else(|| {
                        Error::argument_with_context(
                            "tool message without tool_call_id",
                            crate::ErrorContext::new().with_field_path(format!("messages[{}].tool_call_id", i)),
                        )
                    })?;
                    let result = json!({
                        "toolResult": {
                            "toolUseId": id,
                            "content": [{ "text": message.text() }],
                            "status": "success",
                        }
                    });
                    push_turn(&mut turns, "user", vec![result]);
                }
            }
        }
        Ok(turns)
    }

    fn system_blocks(request: &CompletionRequest, cache: bool) -> Vec<Value> {
        let mut blocks = Vec::new();
        for message in request.messages.iter().filter(|m| m.role.is_instruction()) {
            for part in message.parts() {
                if let ContentPart::Text { text, .. } = &part {
                    if !text.is_empty() {
                        blocks.push(json!({ "text": text }));
                    }
                }
                if cache && part.is_cacheable() {
                    blocks.push(Self::cache_point());
                }
            }
        }
        blocks
    }

    fn tool_config(request: &CompletionRequest) -> Option<Value> {
        let tools = request.tools.as_ref().filter(|t| !t.is_empty())?;
        let specs: Vec<Value> = tools
            .iter()
            .map(|t| {
                let mut spec = json!({
                    "name": t.function.name,
                    "inputSchema": { "json": t.function.schema() },
                });
                if let Some(desc) = &t.function.description {
                    spec["description"] = json!(desc);
                }
                json!({ "toolSpec": spec })
            })
            .collect();
        let mut config = json!({ "tools": specs });
        match request.tool_choice().unwrap_or(ToolChoice::Auto) {
            ToolChoice::Auto => config["toolChoice"] = json!({"auto": {}}),
            ToolChoice::Required => config["toolChoice"] = json!({"any": {}}),
            ToolChoice::Function(name) => config["toolChoice"] = json!({"tool": {"name": name}}),
            // Converse has no "none"; leaving the choice out lets the model decide.
            ToolChoice::None => {}
        }
        Some(config)
    }
}

/// Converse `stopReason` onto the canonical set.
pub fn finish_reason(reason: &str) -> FinishReason {
    match reason {
        "tool_use" => FinishReason::ToolCalls,
        "max_tokens" | "model_context_window_exceeded" => FinishReason::Length,
        "guardrail_intervened" | "content_filtered" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

/// Converse usage. Cache reads and writes are billed input, so they are added
/// to `prompt_tokens` and also reported as details.
pub fn bedrock_usage(value: &Value) -> Option<TokenUsage> {
    let obj = value.as_object()?;
    let read = |k: &str| obj.get(k).and_then(|v| v.as_u64()).unwrap_or(0);
    let cache_read = read("cacheReadInputTokens");
    let cache_write = read("cacheWriteInputTokens");
    let mut usage = TokenUsage::new(read("inputTokens") + cache_read + cache_write, read("outputTokens"));
    if cache_read > 0 || cache_write > 0 {
        usage.prompt_tokens_details = Some(TokensDetail {
            cached_tokens: (cache_read > 0).then_some(cache_read),
            cache_creation_tokens: (cache_write > 0).then_some(cache_write),
            ..TokensDetail::default()
        });
    }
    Some(usage)
}

impl VendorDriver for BedrockDriver {
    fn vendor(&self) -> Vendor {
        Vendor::Bedrock
    }

    fn build_request(&self, request: &CompletionRequest, channel: &ChannelConfig) -> Result<HttpRequest> {
        let cache = channel.features.supports_cache;
        let messages: Vec<Value> = Self::turns(request, cache)?
            .into_iter()
            .map(|t| json!({ "role": t.role, "content": t.parts }))
            .collect();

        let mut body = Map::new();
        body.insert("messages".into(), Value::Array(messages));
        let system = Self::system_blocks(request, cache);
        if !system.is_empty() {
            body.insert("system".into(), Value::Array(system));
        }

        let mut inference = Map::new();
        if let Some(n) = request.output_token_limit() {
            inference.insert("maxTokens".into(), json!(n));
        }
        if let Some(t) = request.temperature {
            inference.insert("temperature".into(), json!(t));
        }
        if let Some(p) = request.top_p {
            inference.insert("topP".into(), json!(p));
        }
        let stop = request.stop_sequences();
        if !stop.is_empty() {
            inference.insert("stopSequences".into(), json!(stop));
        }
        if !inference.is_empty() {
            body.insert("inferenceConfig".into(), Value::Object(inference));
        }
        if let Some(config) = Self::tool_config(request) {
            body.insert("toolConfig".into(), config);
        }
        if let Some(budget) = request
            .reasoning()
            .filter(|_| channel.features.supports_thinking)
            .and_then(|e| e.budget_tokens())
        {
            body.insert(
                "additionalModelRequestFields".into(),
                json!({"thinking": {"type": "enabled", "budget_tokens": budget}}),
            );
        }
        merge_object(&mut body, &channel.extra_params);

        let model = channel.wire_model(&request.model);
        let http = HttpRequest::json(Self::url(channel, model, request.stream), &Value::Object(body), request.stream)?;
        let http = if request.stream {
            http.with_header("accept", "application/vnd.amazon.eventstream")
        } else {
            http
        };
        Ok(apply_channel_headers(http, channel, None))
    }

    fn parse_response(&self, body: &[u8], model: &str) -> Result<CompletionResponse> {
        let value: Value = serde_json::from_slice(body)?;
        let mut message = Message {
            content: None,
            ..Message::assistant("")
        };
        let mut text = String::new();
        let mut calls = Vec::new();
        for block in value
            .pointer("/output/message/content")
            .and_then(|c| c.as_array())
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                text.push_str(t);
            } else if let Some(tool) = block.get("toolUse") {
                let args = tool.get("input").cloned().unwrap_or_else(|| json!({}));
                let index = calls.len() as u32;
                calls.push(
                    ToolCall::new(
                        tool.get("toolUseId").and_then(|v| v.as_str()).unwrap_or_default(),
                        tool.get("name").and_then(|v| v.as_str()).unwrap_or_default(),
                        serde_json::to_string(&args)?,
                    )
                    .at_index(index),
                );
            } else if let Some(reasoning) = block.get("reasoningContent") {
                if let Some(rt) = reasoning.get("reasoningText") {
                    let piece = rt.get("text").and_then(|t| t.as_str()).unwrap_or_default();
                    message.reasoning_content.get_or_insert_with(String::new).push_str(piece);
                    if let Some(sig) = rt.get("signature").and_then(|s| s.as_str()) {
                        message.reasoning_content_signature = Some(sig.to_string());
                    }
                }
                if let Some(redacted) = reasoning.get("redactedContent").and_then(|r| r.as_str()) {
                    message.redacted_reasoning_content = Some(redacted.to_string());
                }
            }
        }
        if !text.is_empty() {
            message.content = Some(MessageContent::Text(text));
        }
        if !calls.is_empty() {
            message.tool_calls = Some(calls);
        }

        let mut response = CompletionResponse::new(model);
        response.id = response_id(None);
        let reason = value
            .get("stopReason")
            .and_then(|r| r.as_str())
            .map(finish_reason)
            .unwrap_or(FinishReason::Stop);
        response.choices.push(Choice {
            index: 0,
            message,
            finish_reason: Some(reason),
        });
        response.usage = value.get("usage").and_then(bedrock_usage);
        Ok(response)
    }

    fn stream_decoder(&self) -> Box<dyn Decoder> {
        Box::new(EventStreamDecoder::new())
    }

    fn stream_normalizer(&self, model: &str) -> Box<dyn StreamNormalizer> {
        Box::new(BedrockNormalizer::new(model))
    }
}
