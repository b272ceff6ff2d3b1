//! Gemini generateContent 驱动 — 实现 Gemini / Vertex 特有的请求/响应格式转换
//!
//! Google generateContent API driver (AI Studio and Vertex). Key differences:
//! - Uses `contents` instead of `messages`, with `parts` instead of `content`.
//! - Roles: `user` and `model`; instructions go to `systemInstruction`.
//! - `generationConfig` wraps temperature, max tokens (→ `maxOutputTokens`),
//!   stop sequences and the thinking budget.
//! - Tool calls carry no ids on the wire; tool results are matched by
//!   function name, so ids are minted on the way in and resolved on the way out.
//! - Streaming uses SSE (`alt=sse`); each frame is a full response object.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use crate::channel::{ChannelConfig, Vendor};
use crate::pipeline::decode::SseDecoder;
use crate::pipeline::gemini::GeminiNormalizer;
use crate::pipeline::{Decoder, StreamNormalizer};
use crate::tokens::quirks::fold_completion_details;
use crate::transport::HttpRequest;
use crate::types::{
    Choice, CompletionRequest, CompletionResponse, ContentPart, FinishReason, Message,
    MessageContent, MessageRole, ReasoningEffort, TokenUsage, TokensDetail, ToolCall, ToolChoice,
};
use crate::{Error, ErrorContext, Result};

use super::{
    apply_channel_headers, decode_data_uri, embedded_error, merge_object, new_call_id, path_segment, push_turn,
    response_id, tool_arguments, Turn, VendorDriver,
};

#[derive(Debug, Clone)]
pub struct GeminiDriver {
    vendor: Vendor,
}

impl GeminiDriver {
    pub fn new(vendor: Vendor) -> Self {
        Self { vendor }
    }

    fn url(channel: &ChannelConfig, model: &str, stream: bool) -> String {
        let model = path_segment(model);
        if stream {
            format!("{}/models/{}:streamGenerateContent?alt=sse", channel.base(), model)
        } else {
            format!("{}/models/{}:generateContent", channel.base(), model)
        }
    }

    fn user_parts(message: &Message, index: usize) -> Result<Vec<Value>> {
        let mut parts = Vec::new();
        for (j, part) in message.parts().iter().enumerate() {
            match part {
                ContentPart::Text { text, .. } if !text.is_empty() => parts.push(json!({ "text": text })),
                ContentPart::ImageUrl { image_url, .. } => {
                    let image = decode_data_uri(&image_url.url, &format!("messages[{}].content[{}]", index, j))?;
                    parts.push(json!({
                        "inlineData": {"mimeType": image.mime_type, "data": image.to_base64()}
                    }));
                }
                _ => {}
            }
        }
        Ok(parts)
    }

    fn model_parts(message: &Message, index: usize) -> Result<Vec<Value>> {
        let mut parts = Self::user_parts(message, index)?;
        let mut signature = message.reasoning_content_signature.as_deref();
        for (j, call) in message.tool_calls.iter().flatten().enumerate() {
            let args = tool_arguments(call, &format!("messages[{}].tool_calls[{}]", index, j))?;
            let mut part = json!({ "functionCall": { "name": call.function.name, "args": args } });
            if let Some(sig) = signature.take() {
                part["thoughtSignature"] = json!(sig);
            }
            parts.push(part);
        }
        Ok(parts)
    }

    fn function_response(message: &Message, index: usize, names: &HashMap<String, String>) -> Result<Value> {
        let name = message
            .tool_call_id
            .as_ref()
            .and_then(|id| names.get(id))
            .or(message.name.as_ref())
            .ok_or_else(|| {
                Error::argument_with_context(
                    "tool result does not match any earlier tool call",
                    ErrorContext::new().with_field_path(format!("messages[{}].tool_call_id", index)),
                )
            })?;
        let text = message.text();
        let response = match serde_json::from_str::<Value>(&text) {
            Ok(obj @ Value::Object(_)) => obj,
            _ => json!({ "content": text }),
        };
        Ok(json!({ "functionResponse": { "name": name, "response": response } }))
    }

    fn contents(request: &CompletionRequest) -> Result<Vec<Turn>> {
        let mut names: HashMap<String, String> = HashMap::new();
        let mut turns = Vec::new();
        for (i, message) in request.messages.iter().enumerate() {
            match message.role {
                MessageRole::System | MessageRole::Developer => {}
                MessageRole::User => push_turn(&mut turns, "user", Self::user_parts(message, i)?),
                MessageRole::Assistant => {
                    for call in message.tool_calls.iter().flatten() {
                        names.insert(call.id.clone(), call.function.name.clone());
                    }
                    push_turn(&mut turns, "model", Self::model_parts(message, i)?);
                }
                MessageRole::Tool => {
                    push_turn(&mut turns, "user", vec![Self::function_response(message, i, &names)?]);
                }
            }
        }
        Ok(turns)
    }

    fn generation_config(request: &CompletionRequest, channel: &ChannelConfig) -> Map<String, Value> {
        let mut config = Map::new();
        if let Some(t) = request.temperature {
            config.insert("temperature".into(), json!(t));
        }
        if let Some(p) = request.top_p {
            config.insert("topP".into(), json!(p));
        }
        if let Some(n) = request.output_token_limit() {
            config.insert("maxOutputTokens".into(), json!(n));
        }
        let stop = request.stop_sequences();
        if !stop.is_empty() {
            config.insert("stopSequences".into(), json!(stop));
        }
        if let Some(seed) = request.seed {
            config.insert("seed".into(), json!(seed));
        }
        if let Some(p) = request.presence_penalty {
            config.insert("presencePenalty".into(), json!(p));
        }
        if let Some(p) = request.frequency_penalty {
            config.insert("frequencyPenalty".into(), json!(p));
        }
        let json_output = request
            .response_format
            .as_ref()
            .and_then(|f| f.get("type"))
            .and_then(|t| t.as_str())
            .map_or(false, |t| t.starts_with("json"));
        if json_output {
            config.insert("responseMimeType".into(), json!("application/json"));
        }
        if let Some(effort) = request.reasoning().filter(|_| channel.features.supports_thinking) {
            let thinking = match effort {
                ReasoningEffort::Disabled => json!({ "thinkingBudget": 0 }),
                other => json!({
                    "thinkingBudget": other.budget_tokens().unwrap_or(0),
                    "includeThoughts": true,
                }),
            };
            config.insert("thinkingConfig".into(), thinking);
        }
        config
    }

    fn tools(request: &CompletionRequest, body: &mut Map<String, Value>) {
        let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) else {
            return;
        };
        let declarations: Vec<Value> = tools
            .iter()
            .map(|t| {
                let mut decl = json!({ "name": t.function.name, "parameters": t.function.schema() });
                if let Some(desc) = &t.function.description {
                    decl["description"] = json!(desc);
                }
                decl
            })
            .collect();
        body.insert("tools".into(), json!([{ "functionDeclarations": declarations }]));
        let calling = match request.tool_choice().unwrap_or(ToolChoice::Auto) {
            ToolChoice::Auto => json!({ "mode": "AUTO" }),
            ToolChoice::Required => json!({ "mode": "ANY" }),
            ToolChoice::None => json!({ "mode": "NONE" }),
            ToolChoice::Function(name) => json!({ "mode": "ANY", "allowedFunctionNames": [name] }),
        };
        body.insert("toolConfig".into(), json!({ "functionCallingConfig": calling }));
    }
}

/// Gemini `finishReason` onto the canonical set.
pub fn finish_reason(reason: &str) -> FinishReason {
    match reason {
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" | "IMAGE_SAFETY" => {
            FinishReason::ContentFilter
        }
        "MALFORMED_FUNCTION_CALL" => FinishReason::Error,
        _ => FinishReason::Stop,
    }
}

fn modality_counts(details: Option<&Value>) -> (Option<u64>, Option<u64>) {
    let mut image = None;
    let mut audio = None;
    for entry in details.and_then(|d| d.as_array()).into_iter().flatten() {
        let count = entry.get("tokenCount").and_then(|c| c.as_u64()).unwrap_or(0);
        match entry.get("modality").and_then(|m| m.as_str()) {
            Some("IMAGE") => image = Some(count),
            Some("AUDIO") => audio = Some(count),
            _ => {}
        }
    }
    (image, audio)
}

/// Raw `usageMetadata` as reported, before any folding.
pub fn gemini_usage(meta: &Value) -> Option<TokenUsage> {
    let obj = meta.as_object()?;
    let read = |k: &str| obj.get(k).and_then(|v| v.as_u64());
    let prompt = read("promptTokenCount").unwrap_or(0);
    let completion = read("candidatesTokenCount").unwrap_or(0);
    let mut usage = TokenUsage::new(prompt, completion);
    if let Some(total) = read("totalTokenCount") {
        usage.total_tokens = total;
    }

    let (image_in, audio_in) = modality_counts(obj.get("promptTokensDetails"));
    let prompt_details = TokensDetail {
        cached_tokens: read("cachedContentTokenCount").filter(|n| *n > 0),
        image_tokens: image_in,
        audio_tokens: audio_in,
        ..TokensDetail::default()
    };
    if !prompt_details.is_empty() {
        usage.prompt_tokens_details = Some(prompt_details);
    }

    let (image_out, audio_out) = modality_counts(obj.get("candidatesTokensDetails"));
    let completion_details = TokensDetail {
        reasoning_tokens: read("thoughtsTokenCount"),
        image_tokens: image_out,
        audio_tokens: audio_out,
        ..TokensDetail::default()
    };
    if !completion_details.is_empty() {
        usage.completion_tokens_details = Some(completion_details);
    }
    Some(usage)
}

impl VendorDriver for GeminiDriver {
    fn vendor(&self) -> Vendor {
        self.vendor
    }

    fn build_request(&self, request: &CompletionRequest, channel: &ChannelConfig) -> Result<HttpRequest> {
        let contents: Vec<Value> = Self::contents(request)?
            .into_iter()
            .map(|t| json!({ "role": t.role, "parts": t.parts }))
            .collect();
        let mut body = Map::new();
        body.insert("contents".into(), Value::Array(contents));
        if let Some(system) = super::instruction_text(&request.messages) {
            body.insert("systemInstruction".into(), json!({ "parts": [{ "text": system }] }));
        }
        let config = Self::generation_config(request, channel);
        if !config.is_empty() {
            body.insert("generationConfig".into(), Value::Object(config));
        }
        Self::tools(request, &mut body);
        merge_object(&mut body, &channel.extra_params);

        let model = channel.wire_model(&request.model);
        let http = HttpRequest::json(Self::url(channel, model, request.stream), &Value::Object(body), request.stream)?;
        Ok(apply_channel_headers(http, channel, Some("x-goog-api-key")))
    }

    fn parse_response(&self, body: &[u8], model: &str) -> Result<CompletionResponse> {
        let value: Value = serde_json::from_slice(body)?;
        if let Some(err) = value.get("error").filter(|e| !e.is_null()) {
            return Err(Error::Channel(embedded_error(err)));
        }

        let mut message = Message {
            content: None,
            ..Message::assistant("")
        };
        let mut text = String::new();
        let mut calls: Vec<ToolCall> = Vec::new();
        let candidate = value.pointer("/candidates/0");
        for part in candidate
            .and_then(|c| c.pointer("/content/parts"))
            .and_then(|p| p.as_array())
            .into_iter()
            .flatten()
        {
            if let Some(sig) = part.get("thoughtSignature").and_then(|s| s.as_str()) {
                message.reasoning_content_signature = Some(sig.to_string());
            }
            if let Some(call) = part.get("functionCall") {
                let name = call.get("name").and_then(|n| n.as_str()).unwrap_or_default();
                let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                let index = calls.len() as u32;
                calls.push(ToolCall::new(new_call_id(), name, serde_json::to_string(&args)?).at_index(index));
            } else if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                if part.get("thought").and_then(|b| b.as_bool()).unwrap_or(false) {
                    message.reasoning_content.get_or_insert_with(String::new).push_str(t);
                } else {
                    text.push_str(t);
                }
            }
        }
        if !text.is_empty() {
            message.content = Some(MessageContent::Text(text));
        }
        let had_calls = !calls.is_empty();
        if had_calls {
            message.tool_calls = Some(calls);
        }

        let blocked = value.pointer("/promptFeedback/blockReason").is_some();
        let reason = match candidate.and_then(|c| c.get("finishReason")).and_then(|r| r.as_str()) {
            _ if blocked => FinishReason::ContentFilter,
            Some(r) => finish_reason(r),
            None => FinishReason::Stop,
        };
        let reason = if reason == FinishReason::Stop && had_calls {
            FinishReason::ToolCalls
        } else {
            reason
        };

        let mut response = CompletionResponse::new(model);
        response.id = response_id(value.get("responseId").and_then(|v| v.as_str()));
        response.choices.push(Choice {
            index: 0,
            message,
            finish_reason: Some(reason),
        });
        response.usage = value.get("usageMetadata").and_then(gemini_usage).map(|mut u| {
            fold_completion_details(&mut u);
            u
        });
        Ok(response)
    }

    fn stream_decoder(&self) -> Box<dyn Decoder> {
        Box::new(SseDecoder::new())
    }

    fn stream_normalizer(&self, model: &str) -> Box<dyn StreamNormalizer> {
        Box::new(GeminiNormalizer::new(model))
    }
}
