//! OpenAI chat-completions 驱动 — 覆盖 OpenAI / Azure 及各兼容厂商方言
//!
//! OpenAI-wire-compatible driver. The canonical shape already is the OpenAI
//! shape, so conversion is mostly dialect trimming:
//! - `developer` is kept for OpenAI/Azure and rewritten to `system` elsewhere.
//! - Replayed reasoning fields and thinking parts are stripped from outbound
//!   messages; `cache_control` survives only on cache-capable channels.
//! - `reasoning_effort` becomes the vendor's own thinking switch (Qwen
//!   `enable_thinking`, Zhipu/Doubao `thinking.type`) or is dropped.
//! - Streaming always asks for the trailing usage chunk.

use serde_json::{json, Map, Value};

use crate::channel::{ChannelConfig, Vendor};
use crate::pipeline::decode::SseDecoder;
use crate::pipeline::openai::OpenAiNormalizer;
use crate::pipeline::{Decoder, StreamNormalizer};
use crate::transport::HttpRequest;
use crate::types::{
    Choice, CompletionRequest, CompletionResponse, FinishReason, Message, MessageRole,
    ReasoningEffort, TokenUsage, TokensDetail, ToolChoice,
};
use crate::{Error, Result};

use super::{apply_channel_headers, embedded_error, merge_object, response_id, tool_arguments, VendorDriver};

const AZURE_API_VERSION: &str = "2024-10-21";

#[derive(Debug, Clone)]
pub struct OpenAiDriver {
    vendor: Vendor,
}

impl OpenAiDriver {
    pub fn new(vendor: Vendor) -> Self {
        Self { vendor }
    }

    fn keeps_developer_role(&self) -> bool {
        matches!(self.vendor, Vendor::OpenAi | Vendor::AzureOpenAi)
    }

    fn url(&self, channel: &ChannelConfig) -> String {
        match (self.vendor, channel.deploy_name.as_deref()) {
            (Vendor::AzureOpenAi, Some(deploy)) => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                channel.base(),
                deploy,
                channel.api_version.as_deref().unwrap_or(AZURE_API_VERSION)
            ),
            _ => format!("{}/chat/completions", channel.base()),
        }
    }

    fn outbound_message(&self, message: &Message, index: usize, channel: &ChannelConfig) -> Result<Value> {
        if let Some(calls) = &message.tool_calls {
            for (j, call) in calls.iter().enumerate() {
                tool_arguments(call, &format!("messages[{}].tool_calls[{}]", index, j))?;
            }
        }
        let mut value = serde_json::to_value(message)?;
        if let Some(obj) = value.as_object_mut() {
            self.trim_message(obj, message.role, channel);
        }
        Ok(value)
    }

    fn trim_message(&self, obj: &mut Map<String, Value>, role: MessageRole, channel: &ChannelConfig) {
        obj.remove("reasoning_content");
        obj.remove("reasoning_content_signature");
        obj.remove("redacted_reasoning_content");
        if role == MessageRole::Developer && !self.keeps_developer_role() {
            obj.insert("role".into(), json!("system"));
        }
        if let Some(Value::Array(parts)) = obj.get_mut("content") {
            parts.retain(|p| matches!(p.get("type").and_then(|t| t.as_str()), Some("text" | "image_url")));
            if !channel.features.supports_cache {
                for part in parts.iter_mut() {
                    if let Some(p) = part.as_object_mut() {
                        p.remove("cache_control");
                    }
                }
            }
        }
    }

    fn apply_reasoning(&self, body: &mut Map<String, Value>, effort: ReasoningEffort) {
        match self.vendor {
            Vendor::OpenAi | Vendor::AzureOpenAi => {
                if let Some(name) = effort.effort_name() {
                    body.insert("reasoning_effort".into(), json!(name));
                }
            }
            Vendor::Qwen => match effort.budget_tokens() {
                Some(budget) => {
                    body.insert("enable_thinking".into(), json!(true));
                    body.insert("thinking_budget".into(), json!(budget));
                }
                None => {
                    body.insert("enable_thinking".into(), json!(false));
                }
            },
            Vendor::Zhipu | Vendor::Doubao => {
                let kind = if effort == ReasoningEffort::Disabled {
                    "disabled"
                } else {
                    "enabled"
                };
                body.insert("thinking".into(), json!({ "type": kind }));
            }
            _ => {
                tracing::debug!(vendor = %self.vendor, "dropping reasoning hint: no native thinking control");
            }
        }
    }
}

/// Canonical tool choice in chat-completions form.
pub(crate) fn tool_choice_value(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::None => json!("none"),
        ToolChoice::Auto => json!("auto"),
        ToolChoice::Required => json!("required"),
        ToolChoice::Function(name) => json!({"type": "function", "function": {"name": name}}),
    }
}

/// Usage block of a chat-completions body or chunk.
///
/// DeepSeek reports cache hits as `prompt_cache_hit_tokens`; they land in
/// `prompt_tokens_details.cached_tokens`.
pub fn openai_usage(value: &Value) -> Option<TokenUsage> {
    if !value.is_object() {
        return None;
    }
    let mut usage: TokenUsage = serde_json::from_value(value.clone()).ok()?;
    if let Some(hit) = value.get("prompt_cache_hit_tokens").and_then(|v| v.as_u64()) {
        let details = usage.prompt_tokens_details.get_or_insert_with(TokensDetail::default);
        if details.cached_tokens.is_none() {
            details.cached_tokens = Some(hit);
        }
    }
    if usage.total_tokens == 0 {
        usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
    }
    Some(usage)
}

impl VendorDriver for OpenAiDriver {
    fn vendor(&self) -> Vendor {
        self.vendor
    }

    fn build_request(&self, request: &CompletionRequest, channel: &ChannelConfig) -> Result<HttpRequest> {
        let messages = request
            .messages
            .iter()
            .enumerate()
            .map(|(i, m)| self.outbound_message(m, i, channel))
            .collect::<Result<Vec<_>>>()?;

        let mut body = Map::new();
        body.insert("model".into(), json!(channel.wire_model(&request.model)));
        body.insert("messages".into(), Value::Array(messages));

        if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
            body.insert("tools".into(), serde_json::to_value(tools)?);
            let choice = request.tool_choice().unwrap_or(ToolChoice::Auto);
            body.insert("tool_choice".into(), tool_choice_value(&choice));
        }
        if let Some(t) = request.temperature {
            body.insert("temperature".into(), json!(t));
        }
        if let Some(p) = request.top_p {
            body.insert("top_p".into(), json!(p));
        }
        if let Some(p) = request.frequency_penalty {
            body.insert("frequency_penalty".into(), json!(p));
        }
        if let Some(p) = request.presence_penalty {
            body.insert("presence_penalty".into(), json!(p));
        }
        if let Some(stop) = &request.stop {
            body.insert("stop".into(), serde_json::to_value(stop)?);
        }
        match request.max_completion_tokens.filter(|_| self.keeps_developer_role()) {
            Some(n) => {
                body.insert("max_completion_tokens".into(), json!(n));
            }
            None => {
                if let Some(n) = request.output_token_limit() {
                    body.insert("max_tokens".into(), json!(n));
                }
            }
        }
        if let Some(seed) = request.seed {
            body.insert("seed".into(), json!(seed));
        }
        if let Some(format) = &request.response_format {
            body.insert("response_format".into(), format.clone());
        }
        if let Some(user) = &request.user {
            body.insert("user".into(), json!(user));
        }
        if let Some(effort) = request.reasoning() {
            self.apply_reasoning(&mut body, effort);
        }
        body.insert("stream".into(), json!(request.stream));
        if request.stream {
            body.insert("stream_options".into(), json!({"include_usage": true}));
        }
        merge_object(&mut body, &request.extra);
        merge_object(&mut body, &channel.extra_params);

        let key_header = (self.vendor == Vendor::AzureOpenAi).then_some("api-key");
        let http = HttpRequest::json(self.url(channel), &Value::Object(body), request.stream)?;
        Ok(apply_channel_headers(http, channel, key_header))
    }

    fn parse_response(&self, body: &[u8], model: &str) -> Result<CompletionResponse> {
        let value: Value = serde_json::from_slice(body)?;
        if let Some(err) = value.get("error").filter(|e| !e.is_null()) {
            return Err(Error::Channel(embedded_error(err)));
        }
        let mut response = CompletionResponse::new(model);
        response.id = response_id(value.get("id").and_then(|v| v.as_str()));
        if let Some(created) = value.get("created").and_then(|v| v.as_i64()) {
            response.created = created;
        }
        for (i, choice) in value
            .get("choices")
            .and_then(|c| c.as_array())
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .enumerate()
        {
            let mut message: Message = match choice.get("message") {
                Some(m) => serde_json::from_value(m.clone())?,
                None => continue,
            };
            if message.reasoning_content.is_none() {
                message.reasoning_content = choice
                    .pointer("/message/reasoning")
                    .and_then(|r| r.as_str())
                    .map(str::to_string);
            }
            if let Some(calls) = message.tool_calls.as_mut() {
                for (j, call) in calls.iter_mut().enumerate() {
                    call.index = Some(j as u32);
                }
            }
            let finish_reason = choice
                .get("finish_reason")
                .and_then(|r| r.as_str())
                .map(FinishReason::from_openai)
                .unwrap_or(FinishReason::Stop);
            response.choices.push(Choice {
                index: choice
                    .get("index")
                    .and_then(|v| v.as_u64())
                    .map(|v| v as u32)
                    .unwrap_or(i as u32),
                message,
                finish_reason: Some(finish_reason),
            });
        }
        response.usage = value.get("usage").and_then(openai_usage);
        Ok(response)
    }

    fn stream_decoder(&self) -> Box<dyn Decoder> {
        Box::new(SseDecoder::new())
    }

    fn stream_normalizer(&self, model: &str) -> Box<dyn StreamNormalizer> {
        Box::new(OpenAiNormalizer::new(self.vendor, model))
    }
}
