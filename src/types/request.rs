//! Canonical completion request

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::message::Message;
use super::tool::{Tool, ToolChoice};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    /// Raw policy; read through [`CompletionRequest::tool_choice`].
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "tool_choice")]
    pub tool_choice_raw: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    /// `low` / `medium` / `high`, or a vendor-native object such as
    /// `{"type": "enabled", "budget_tokens": 4096}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Vendor extension fields, forwarded untouched by OpenAI-compatible dialects.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: None,
            tool_choice_raw: None,
            temperature: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop: None,
            max_tokens: None,
            max_completion_tokens: None,
            seed: None,
            stream: false,
            stream_options: None,
            reasoning_effort: None,
            response_format: None,
            user: None,
            extra: Map::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_tool_choice(mut self, choice: Value) -> Self {
        self.tool_choice_raw = Some(choice);
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_reasoning_effort(mut self, effort: Value) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }

    /// Parsed tool-choice policy; `None` when no policy was given.
    pub fn tool_choice(&self) -> Option<ToolChoice> {
        self.tool_choice_raw.as_ref().map(ToolChoice::from_value)
    }

    pub fn has_tools(&self) -> bool {
        self.tools.as_ref().map(|t| !t.is_empty()).unwrap_or(false)
    }

    /// Effective output token cap (`max_completion_tokens` wins).
    pub fn output_token_limit(&self) -> Option<u32> {
        self.max_completion_tokens.or(self.max_tokens)
    }

    pub fn stop_sequences(&self) -> Vec<String> {
        match &self.stop {
            None => Vec::new(),
            Some(StopSequences::Single(s)) => vec![s.clone()],
            Some(StopSequences::Many(v)) => v.clone(),
        }
    }

    pub fn reasoning(&self) -> Option<ReasoningEffort> {
        self.reasoning_effort
            .as_ref()
            .and_then(ReasoningEffort::from_value)
    }

    /// Clear inline media once the vendor request holds its own copy.
    pub fn release_media(&mut self) {
        for m in self.messages.iter_mut() {
            m.release_media();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    Single(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: bool,
}

/// Normalized reasoning hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
    Budget(u32),
    Disabled,
}

impl ReasoningEffort {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "low" | "minimal" => Some(Self::Low),
                "medium" => Some(Self::Medium),
                "high" => Some(Self::High),
                "none" | "disabled" => Some(Self::Disabled),
                _ => None,
            },
            Value::Object(map) => {
                if map.get("type").and_then(|t| t.as_str()) == Some("disabled") {
                    return Some(Self::Disabled);
                }
                map.get("budget_tokens")
                    .or_else(|| map.get("budgetTokens"))
                    .and_then(|b| b.as_u64())
                    .map(|b| Self::Budget(u32::try_from(b).unwrap_or(u32::MAX)))
                    .or_else(|| {
                        map.get("effort")
                            .and_then(|e| Self::from_value(e))
                    })
            }
            _ => None,
        }
    }

    /// Thinking budget in tokens for vendors that take an explicit budget.
    pub fn budget_tokens(&self) -> Option<u32> {
        match self {
            Self::Low => Some(2048),
            Self::Medium => Some(8192),
            Self::High => Some(24576),
            Self::Budget(n) => Some(*n),
            Self::Disabled => None,
        }
    }

    pub fn effort_name(&self) -> Option<&'static str> {
        match self {
            Self::Low => Some("low"),
            Self::Medium => Some("medium"),
            Self::High => Some("high"),
            Self::Budget(n) if *n <= 2048 => Some("low"),
            Self::Budget(n) if *n <= 8192 => Some("medium"),
            Self::Budget(_) => Some("high"),
            Self::Disabled => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_fields_land_in_extra() {
        let req: CompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "stop": "END",
            "enable_search": true
        }))
        .unwrap();
        assert_eq!(req.extra.get("enable_search"), Some(&json!(true)));
        assert_eq!(req.stop_sequences(), vec!["END".to_string()]);
        assert!(!req.stream);
    }

    #[test]
    fn reasoning_hint_forms() {
        assert_eq!(ReasoningEffort::from_value(&json!("HIGH")), Some(ReasoningEffort::High));
        assert_eq!(
            ReasoningEffort::from_value(&json!({"type": "enabled", "budget_tokens": 1500})),
            Some(ReasoningEffort::Budget(1500))
        );
        assert_eq!(
            ReasoningEffort::from_value(&json!({"type": "disabled"})),
            Some(ReasoningEffort::Disabled)
        );
        assert_eq!(ReasoningEffort::from_value(&json!("extreme")), None);
        assert_eq!(ReasoningEffort::Budget(1500).effort_name(), Some("low"));
    }
}
