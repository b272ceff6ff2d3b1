//! Canonical completion responses and stream chunks

use serde::{Deserialize, Deserializer, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use super::message::{Message, MessageRole};
use super::tool::ToolCallChunk;
use super::usage::TokenUsage;
use crate::error::ChannelError;

pub(crate) fn now_epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub(crate) fn new_completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

/// Canonical finish reasons. Unknown vendor strings collapse to `Stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
    Cancelled,
}

impl FinishReason {
    pub fn from_openai(reason: &str) -> Self {
        match reason {
            "length" => Self::Length,
            "tool_calls" | "function_call" => Self::ToolCalls,
            "content_filter" | "sensitive" => Self::ContentFilter,
            "error" => Self::Error,
            "cancelled" | "canceled" => Self::Cancelled,
            _ => Self::Stop,
        }
    }
}

impl<'de> Deserialize<'de> for FinishReason {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(FinishReason::from_openai(&s))
    }
}

/// Error body carried by canonical responses (`{"error": {...}}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_code: Option<u16>,
}

impl From<&ChannelError> for ApiError {
    fn from(e: &ChannelError) -> Self {
        Self {
            message: e.message.clone(),
            error_type: e.error_type.clone(),
            code: None,
            http_code: Some(e.status),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default = "completion_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

fn completion_object() -> String {
    "chat.completion".to_string()
}

fn chunk_object() -> String {
    "chat.completion.chunk".to_string()
}

impl CompletionResponse {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: new_completion_id(),
            object: completion_object(),
            created: now_epoch_secs(),
            model: model.into(),
            choices: Vec::new(),
            usage: None,
            error: None,
        }
    }

    /// Failed call: error populated, no choices.
    pub fn from_error(model: impl Into<String>, error: &ChannelError) -> Self {
        Self {
            error: Some(ApiError::from(error)),
            ..Self::new(model)
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn first_message(&self) -> Option<&Message> {
        self.choices.first().map(|c| &c.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: Message,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamCompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default = "chunk_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl StreamCompletionResponse {
    pub fn new(id: impl Into<String>, created: i64, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: chunk_object(),
            created,
            model: model.into(),
            choices: Vec::new(),
            usage: None,
            error: None,
        }
    }

    pub fn with_delta(mut self, delta: Delta) -> Self {
        self.choices = vec![StreamChoice {
            index: 0,
            delta,
            finish_reason: None,
        }];
        self
    }

    pub fn with_finish(mut self, reason: FinishReason) -> Self {
        self.choices = vec![StreamChoice {
            index: 0,
            delta: Delta::default(),
            finish_reason: Some(reason),
        }];
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.choices.clear();
        self.usage = Some(usage);
        self
    }

    /// SSE `data:` line for this chunk.
    pub fn to_sse(&self) -> crate::Result<String> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Delta,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<MessageRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacted_reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallChunk>>,
}

impl Delta {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            reasoning_content: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn tool_call(chunk: ToolCallChunk) -> Self {
        Self {
            tool_calls: Some(vec![chunk]),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Delta::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_finish_reasons_collapse_to_stop() {
        let c: StreamChoice = serde_json::from_value(serde_json::json!({
            "index": 0, "delta": {}, "finish_reason": "eos_token"
        }))
        .unwrap();
        assert_eq!(c.finish_reason, Some(FinishReason::Stop));
        let c: StreamChoice = serde_json::from_value(serde_json::json!({
            "index": 0, "delta": {}, "finish_reason": null
        }))
        .unwrap();
        assert_eq!(c.finish_reason, None);
    }

    #[test]
    fn error_response_has_no_choices() {
        let err = ChannelError::new(429, "rate_limit_error", "slow down");
        let resp = CompletionResponse::from_error("gpt-4o", &err);
        assert!(resp.choices.is_empty());
        assert_eq!(resp.error.as_ref().unwrap().http_code, Some(429));
        assert_eq!(resp.model, "gpt-4o");
    }
}
