//! OpenAI Responses API 驱动 — 将规范的聊天请求转换为 `/responses` 的 input items
//!
//! Differences from chat completions:
//! - Instructions are a top-level `instructions` string.
//! - The conversation is a flat `input` list: role messages, `function_call`
//!   items and `function_call_output` items.
//! - Output is a list of typed items (`reasoning`, `message`, `function_call`).
//! - Streaming events are typed (`response.output_text.delta`, ...), with the
//!   final usage on `response.completed`.

use serde_json::{json, Map, Value};

use crate::channel::{ChannelConfig, Vendor};
use crate::pipeline::decode::SseDecoder;
use crate::pipeline::responses::ResponsesNormalizer;
use crate::pipeline::{Decoder, StreamNormalizer};
use crate::transport::HttpRequest;
use crate::types::{
    Choice, CompletionRequest, CompletionResponse, ContentPart, FinishReason, Message,
    MessageContent, MessageRole, TokenUsage, TokensDetail, ToolCall, ToolChoice,
};
use crate::{Error, Result};

use super::{
    apply_channel_headers, embedded_error, instruction_text, merge_object, response_id, tool_arguments,
    VendorDriver,
};

#[derive(Debug, Clone, Default)]
pub struct ResponsesDriver;

impl ResponsesDriver {
    pub fn new() -> Self {
        Self
    }

    fn message_item(message: &Message, role: &str, text_type: &str) -> Option<Value> {
        let content: Vec<Value> = message
            .parts()
            .into_iter()
            .filter_map(|part| match part {
                ContentPart::Text { text, .. } if !text.is_empty() => Some(json!({ "type": text_type, "text": text })),
                ContentPart::ImageUrl { image_url, .. } if role == "user" => {
                    Some(json!({ "type": "input_image", "image_url": image_url.url }))
                }
                _ => None,
            })
            .collect();
        if content.is_empty() {
            None
        } else {
            Some(json!({ "role": role, "content": content }))
        }
    }

    fn input_items(request: &CompletionRequest) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        for (i, message) in request.messages.iter().enumerate() {
            match message.role {
                MessageRole::System | MessageRole::Developer => {}
                MessageRole::User => items.extend(Self::message_item(message, "user", "input_text")),
                MessageRole::Assistant => {
                    items.extend(Self::message_item(message, "assistant", "output_text"));
                    for (j, call) in message.tool_calls.iter().flatten().enumerate() {
                        tool_arguments(call, &format!("messages[{}].tool_calls[{}]", i, j))?;
                        items.push(json!({
                            "type": "function_call",
                            "call_id": call.id,
                            "name": call.function.name,
                            "arguments": call.function.arguments,
                        }));
                    }
                }
                MessageRole::Tool => {
                    let call_id = message.tool_call_id.as_deref().filter(|id| !id.is_empty()).ok_or_else(|| {
                        Error::argument_with_context(
                            "tool message without tool_call_id",
                            crate::ErrorContext::new().with_field_path(format!("messages[{}].tool_call_id", i)),
                        )
                    })?;
                    items.push(json!({
                        "type": "function_call_output",
                        "call_id": call_id,
                        "output": message.text(),
                    }));
                }
            }
        }
        Ok(items)
    }

    fn tool_choice(choice: ToolChoice) -> Value {
        match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::None => json!("none"),
            ToolChoice::Required => json!("required"),
            ToolChoice::Function(name) => json!({ "type": "function", "name": name }),
        }
    }
}

/// Canonical finish reason from a terminal response `status`.
pub fn finish_from_status(response: &Value) -> FinishReason {
    match response.get("status").and_then(|s| s.as_str()) {
        Some("incomplete") => match response.pointer("/incomplete_details/reason").and_then(|r| r.as_str()) {
            Some("content_filter") => FinishReason::ContentFilter,
            _ => FinishReason::Length,
        },
        Some("failed") => FinishReason::Error,
        Some("cancelled") => FinishReason::Cancelled,
        _ => FinishReason::Stop,
    }
}

pub fn responses_usage(value: &Value) -> Option<TokenUsage> {
    let obj = value.as_object()?;
    let read = |p: &str| value.pointer(p).and_then(|v| v.as_u64());
    let mut usage = TokenUsage::new(read("/input_tokens").unwrap_or(0), read("/output_tokens").unwrap_or(0));
    if let Some(total) = obj.get("total_tokens").and_then(|t| t.as_u64()).filter(|t| *t > 0) {
        usage.total_tokens = total;
    }
    if let Some(cached) = read("/input_tokens_details/cached_tokens").filter(|n| *n > 0) {
        usage.prompt_tokens_details = Some(TokensDetail {
            cached_tokens: Some(cached),
            ..TokensDetail::default()
        });
    }
    if let Some(reasoning) = read("/output_tokens_details/reasoning_tokens").filter(|n| *n > 0) {
        usage.completion_tokens_details = Some(TokensDetail {
            reasoning_tokens: Some(reasoning),
            ..TokensDetail::default()
        });
    }
    Some(usage)
}

impl VendorDriver for ResponsesDriver {
    fn vendor(&self) -> Vendor {
        Vendor::Responses
    }

    fn build_request(&self, request: &CompletionRequest, channel: &ChannelConfig) -> Result<HttpRequest> {
        let mut body = Map::new();
        body.insert("model".into(), json!(channel.wire_model(&request.model)));
        body.insert("input".into(), Value::Array(Self::input_items(request)?));
        if let Some(instructions) = instruction_text(&request.messages) {
            body.insert("instructions".into(), json!(instructions));
        }
        if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
            let defs: Vec<Value> = tools
                .iter()
                .map(|t| {
                    let mut def = json!({
                        "type": "function",
                        "name": t.function.name,
                        "parameters": t.function.schema(),
                    });
                    if let Some(desc) = &t.function.description {
                        def["description"] = json!(desc);
                    }
                    if let Some(strict) = t.function.strict {
                        def["strict"] = json!(strict);
                    }
                    def
                })
                .collect();
            body.insert("tools".into(), Value::Array(defs));
            body.insert(
                "tool_choice".into(),
                Self::tool_choice(request.tool_choice().unwrap_or(ToolChoice::Auto)),
            );
        }
        if let Some(n) = request.output_token_limit() {
            body.insert("max_output_tokens".into(), json!(n));
        }
        if let Some(t) = request.temperature {
            body.insert("temperature".into(), json!(t));
        }
        if let Some(p) = request.top_p {
            body.insert("top_p".into(), json!(p));
        }
        if let Some(effort) = request.reasoning().and_then(|e| e.effort_name()) {
            body.insert("reasoning".into(), json!({ "effort": effort, "summary": "auto" }));
        }
        if let Some(user) = &request.user {
            body.insert("user".into(), json!(user));
        }
        body.insert("stream".into(), json!(request.stream));
        body.insert("store".into(), json!(false));
        merge_object(&mut body, &request.extra);
        merge_object(&mut body, &channel.extra_params);

        let url = format!("{}/responses", channel.base());
        let http = HttpRequest::json(url, &Value::Object(body), request.stream)?;
        Ok(apply_channel_headers(http, channel, None))
    }

    fn parse_response(&self, body: &[u8], model: &str) -> Result<CompletionResponse> {
        let value: Value = serde_json::from_slice(body)?;
        if value.get("status").and_then(|s| s.as_str()) == Some("failed") {
            let err = value.get("error").cloned().unwrap_or(Value::Null);
            return Err(Error::Channel(embedded_error(&err)));
        }

        let mut message = Message {
            content: None,
            ..Message::assistant("")
        };
        let mut text = String::new();
        let mut calls = Vec::new();
        for item in value.get("output").and_then(|o| o.as_array()).into_iter().flatten() {
            match item.get("type").and_then(|t| t.as_str()) {
                Some("reasoning") => {
                    for summary in item.get("summary").and_then(|s| s.as_array()).into_iter().flatten() {
                        if let Some(t) = summary.get("text").and_then(|t| t.as_str()) {
                            message.reasoning_content.get_or_insert_with(String::new).push_str(t);
                        }
                    }
                }
                Some("message") => {
                    for part in item.get("content").and_then(|c| c.as_array()).into_iter().flatten() {
                        let kind = part.get("type").and_then(|t| t.as_str());
                        if matches!(kind, Some("output_text") | Some("refusal")) {
                            let t = part
                                .get("text")
                                .or_else(|| part.get("refusal"))
                                .and_then(|t| t.as_str())
                                .unwrap_or_default();
                            text.push_str(t);
                        }
                    }
                }
                Some("function_call") => {
                    let field = |k: &str| item.get(k).and_then(|v| v.as_str()).unwrap_or_default();
                    let index = calls.len() as u32;
                    calls.push(ToolCall::new(field("call_id"), field("name"), field("arguments")).at_index(index));
                }
                _ => {}
            }
        }
        if !text.is_empty() {
            message.content = Some(MessageContent::Text(text));
        }
        let had_calls = !calls.is_empty();
        if had_calls {
            message.tool_calls = Some(calls);
        }
        let reason = match finish_from_status(&value) {
            FinishReason::Stop if had_calls => FinishReason::ToolCalls,
            other => other,
        };

        let mut response = CompletionResponse::new(model);
        response.id = response_id(value.get("id").and_then(|v| v.as_str()));
        if let Some(created) = value.get("created_at").and_then(|c| c.as_i64()) {
            response.created = created;
        }
        response.choices.push(Choice {
            index: 0,
            message,
            finish_reason: Some(reason),
        });
        response.usage = value.get("usage").and_then(responses_usage);
        Ok(response)
    }

    fn stream_decoder(&self) -> Box<dyn Decoder> {
        Box::new(SseDecoder::new())
    }

    fn stream_normalizer(&self, model: &str) -> Box<dyn StreamNormalizer> {
        Box::new(ResponsesNormalizer::new(model))
    }
}
