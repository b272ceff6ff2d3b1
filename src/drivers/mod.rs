//! 厂商驱动抽象层：通过 trait 实现规范请求/响应与各厂商协议之间的双向转换。
//!
//! # Vendor Drivers
//!
//! One [`VendorDriver`] per vendor family, selected by [`Vendor`] through the
//! [`DriverRegistry`]. A driver is stateless: it converts a canonical request
//! into a vendor HTTP call, a vendor reply into a canonical response, and
//! hands out a fresh decoder and stream normalizer for every streaming call.
//!
//! | Driver | Vendors | Wire format |
//! |--------|---------|-------------|
//! | [`OpenAiDriver`] | openai, azure_openai, deepseek, qwen, zhipu, doubao, moonshot | chat completions + SSE |
//! | [`BedrockDriver`] | bedrock | Converse / ConverseStream + AWS event-stream |
//! | [`GeminiDriver`] | gemini, vertex | generateContent / streamGenerateContent SSE |
//! | [`ResponsesDriver`] | responses | OpenAI Responses API + named SSE events |
//!
//! Shared contracts live here: system-instruction splitting, turn coalescing,
//! data-URI image decoding, tool-argument validation and vendor error
//! wrapping.

pub mod bedrock;
pub mod gemini;
pub mod openai;
pub mod responses;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::channel::{ChannelConfig, Vendor};
use crate::error::ChannelError;
use crate::error_code::ErrorKind;
use crate::pipeline::{Decoder, StreamNormalizer};
use crate::transport::HttpRequest;
use crate::types::{CompletionRequest, CompletionResponse, Message, ToolCall};
use crate::{Error, ErrorContext, Result};

pub use bedrock::BedrockDriver;
pub use gemini::GeminiDriver;
pub use openai::OpenAiDriver;
pub use responses::ResponsesDriver;

/// Canonical ⇄ vendor conversion for one vendor family.
pub trait VendorDriver: Send + Sync + fmt::Debug {
    fn vendor(&self) -> Vendor;

    /// Build the vendor HTTP call. Fails with [`Error::Argument`] before any
    /// network traffic when the request cannot be expressed for this vendor.
    fn build_request(&self, request: &CompletionRequest, channel: &ChannelConfig) -> Result<HttpRequest>;

    /// Convert a successful vendor body. `model` is the canonical model id
    /// reported back to the caller.
    fn parse_response(&self, body: &[u8], model: &str) -> Result<CompletionResponse>;

    /// Wrap a non-2xx vendor reply.
    fn parse_error(&self, status: u16, body: &[u8]) -> ChannelError {
        error_from_body(status, body)
    }

    fn stream_decoder(&self) -> Box<dyn Decoder>;

    /// Fresh per-call normalizer.
    fn stream_normalizer(&self, model: &str) -> Box<dyn StreamNormalizer>;
}

/// Driver for a vendor key. Adding a vendor means adding a variant here.
pub fn create_driver(vendor: Vendor) -> Arc<dyn VendorDriver> {
    match vendor {
        Vendor::Bedrock => Arc::new(BedrockDriver::new()),
        Vendor::Gemini | Vendor::Vertex => Arc::new(GeminiDriver::new(vendor)),
        Vendor::Responses => Arc::new(ResponsesDriver::new()),
        Vendor::OpenAi
        | Vendor::AzureOpenAi
        | Vendor::DeepSeek
        | Vendor::Qwen
        | Vendor::Zhipu
        | Vendor::Doubao
        | Vendor::Moonshot => Arc::new(OpenAiDriver::new(vendor)),
    }
}

/// Vendor key → driver lookup.
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<Vendor, Arc<dyn VendorDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in driver for every known vendor.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for vendor in [
            Vendor::OpenAi,
            Vendor::AzureOpenAi,
            Vendor::DeepSeek,
            Vendor::Qwen,
            Vendor::Zhipu,
            Vendor::Doubao,
            Vendor::Moonshot,
            Vendor::Bedrock,
            Vendor::Gemini,
            Vendor::Vertex,
            Vendor::Responses,
        ] {
            registry.register(create_driver(vendor));
        }
        registry
    }

    /// Register (or replace) the driver for its vendor.
    pub fn register(&mut self, driver: Arc<dyn VendorDriver>) {
        self.drivers.insert(driver.vendor(), driver);
    }

    pub fn get(&self, vendor: Vendor) -> Result<Arc<dyn VendorDriver>> {
        self.drivers.get(&vendor).cloned().ok_or_else(|| {
            Error::configuration_with_context(
                format!("no driver registered for vendor '{}'", vendor),
                ErrorContext::new()
                    .with_field_path("vendor")
                    .with_source("driver_registry"),
            )
        })
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Shared conversion helpers
// ---------------------------------------------------------------------------

/// Percent-encode one URL path segment; model ids may carry `:` or `/`.
pub(crate) fn path_segment(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

static DATA_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^data:(?P<mime>[A-Za-z0-9.+-]+/[A-Za-z0-9.+-]+)(?:;[A-Za-z0-9-]+=[^;,]*)*;base64,(?P<data>.*)$")
        .expect("data URI pattern compiles")
});

/// Image decoded from a `data:<mime>;base64,<payload>` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl InlineImage {
    /// Short format name (`png`, `jpeg`, ...), as Bedrock expects it.
    pub fn format(&self) -> &str {
        let sub = self.mime_type.rsplit('/').next().unwrap_or("");
        match sub {
            "jpg" => "jpeg",
            other => other,
        }
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }
}

/// Decode a base64 data URI. Any other URL form is a client argument error.
pub fn decode_data_uri(url: &str, field_path: &str) -> Result<InlineImage> {
    let invalid = |details: &str| {
        Error::argument_with_context(
            "image content must be a base64 data URI",
            ErrorContext::new()
                .with_field_path(field_path)
                .with_details(details.to_string()),
        )
    };
    let caps = DATA_URI.captures(url).ok_or_else(|| {
        let shown: String = url.chars().take(32).collect();
        invalid(&format!("unsupported image reference '{}'", shown))
    })?;
    let data: String = caps["data"].chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.as_bytes())
        .map_err(|e| invalid(&format!("bad base64 payload: {}", e)))?;
    Ok(InlineImage {
        mime_type: caps["mime"].to_ascii_lowercase(),
        bytes,
    })
}

/// Validated tool-call arguments; an empty string is `{}`.
pub fn tool_arguments(call: &ToolCall, field_path: &str) -> Result<Value> {
    call.function.parsed_arguments().map_err(|e| {
        Error::argument_with_context(
            format!("tool call '{}' has arguments that are not valid JSON", call.id),
            ErrorContext::new()
                .with_field_path(field_path)
                .with_details(e.to_string()),
        )
    })
}

/// System and developer messages joined into one instruction block, in order.
pub fn instruction_text(messages: &[Message]) -> Option<String> {
    let parts: Vec<String> = messages
        .iter()
        .filter(|m| m.role.is_instruction())
        .map(|m| m.text())
        .filter(|t| !t.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// A vendor conversation turn under construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: &'static str,
    pub parts: Vec<Value>,
}

/// Append `parts` as a `role` turn, merging into the previous turn when it has
/// the same role. Part order is preserved.
pub fn push_turn(turns: &mut Vec<Turn>, role: &'static str, parts: Vec<Value>) {
    if parts.is_empty() {
        return;
    }
    match turns.last_mut() {
        Some(last) if last.role == role => last.parts.extend(parts),
        _ => turns.push(Turn { role, parts }),
    }
}

/// Apply the credential and channel extra headers to a built request.
/// `key_header` names the header an API key goes in; `None` sends it as a
/// bearer token.
pub fn apply_channel_headers(mut request: HttpRequest, channel: &ChannelConfig, key_header: Option<&str>) -> HttpRequest {
    use crate::channel::Credential;
    request = match (&channel.credential, key_header) {
        (Credential::Bearer { token }, _) | (Credential::ApiKey { key: token }, None) => {
            request.with_header("authorization", format!("Bearer {}", token))
        }
        (Credential::ApiKey { key }, Some(header)) => request.with_header(header, key.clone()),
        (Credential::None, _) => request,
    };
    for (k, v) in &channel.extra_headers {
        request = request.with_header(k.clone(), v.clone());
    }
    request
}

/// Shallow-merge `extra` into a JSON object body; later keys win.
pub fn merge_object(body: &mut Map<String, Value>, extra: &Map<String, Value>) {
    for (k, v) in extra {
        body.insert(k.clone(), v.clone());
    }
}

/// Wrap a vendor error type and message, normalizing AWS-style lower camel
/// exception names (`throttlingException` → `ThrottlingException`).
pub fn vendor_error(status: Option<u16>, vendor_type: &str, message: impl Into<String>) -> ChannelError {
    let mut error_type = vendor_type.to_string();
    if error_type.ends_with("Exception") {
        if let Some(first) = error_type.get(..1) {
            error_type = format!("{}{}", first.to_ascii_uppercase(), &error_type[1..]);
        }
    }
    let kind = ErrorKind::from_vendor_type(&error_type);
    let status = status
        .or_else(|| kind.map(|k| k.http_status()))
        .unwrap_or(502);
    if error_type.is_empty() {
        error_type = ErrorKind::from_http_status(status).name().to_string();
    }
    ChannelError::new(status, error_type, message)
}

/// Error object embedded in an otherwise successful body or stream frame.
pub fn embedded_error(err: &Value) -> ChannelError {
    match err {
        Value::Object(map) => {
            let status = map
                .get("code")
                .and_then(|c| c.as_u64())
                .filter(|c| (400..600).contains(c))
                .map(|c| c as u16);
            let kind = ["type", "status", "code"]
                .iter()
                .find_map(|k| map.get(*k).and_then(json_label))
                .unwrap_or_default();
            let message = map
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("vendor reported an error");
            vendor_error(status, &kind, message)
        }
        Value::String(s) => vendor_error(None, "", s.clone()),
        other => vendor_error(None, "", other.to_string()),
    }
}

/// Best-effort parse of a vendor error body. Understands
/// `{"error": {"message", "type" | "code" | "status"}}`, `{"error": "..."}`,
/// AWS `{"message", "__type"}` and falls back to the raw text.
pub fn error_from_body(status: u16, body: &[u8]) -> ChannelError {
    let fallback_type = ErrorKind::from_http_status(status).name();
    let value: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => {
            let text = String::from_utf8_lossy(body);
            let text = text.trim();
            let message = if text.is_empty() {
                format!("vendor returned HTTP {}", status)
            } else {
                text.chars().take(2048).collect()
            };
            return ChannelError::new(status, fallback_type, message);
        }
    };
    let value = match value {
        Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
        other => other,
    };
    let (error_type, message) = match value.get("error") {
        Some(Value::Object(err)) => {
            let kind = ["type", "status", "code"]
                .iter()
                .find_map(|k| err.get(*k).and_then(json_label));
            let message = err.get("message").and_then(|m| m.as_str()).map(str::to_string);
            (kind, message)
        }
        Some(Value::String(s)) => (None, Some(s.clone())),
        _ => {
            let kind = value
                .get("__type")
                .and_then(|t| t.as_str())
                .map(|t| t.rsplit('#').next().unwrap_or(t).to_string())
                .or_else(|| value.get("code").and_then(json_label));
            let message = value
                .get("message")
                .or_else(|| value.get("Message"))
                .and_then(|m| m.as_str())
                .map(str::to_string);
            (kind, message)
        }
    };
    let message = message.unwrap_or_else(|| format!("vendor returned HTTP {}", status));
    vendor_error(Some(status), error_type.as_deref().unwrap_or(fallback_type), message)
}

fn json_label(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Response id from the vendor body, or a fresh canonical one.
pub(crate) fn response_id(vendor_id: Option<&str>) -> String {
    match vendor_id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => crate::types::response::new_completion_id(),
    }
}

pub(crate) fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}
