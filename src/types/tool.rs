//! Tool calling definitions (OpenAI function-calling shape)

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool definition (for function calling)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type", default = "function_type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

fn function_type() -> String {
    "function".to_string()
}

impl Tool {
    pub fn function(name: impl Into<String>, description: Option<String>, parameters: Value) -> Self {
        Self {
            tool_type: function_type(),
            function: FunctionDefinition {
                name: name.into(),
                description,
                parameters: Some(parameters),
                strict: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
}

impl FunctionDefinition {
    /// Parameters schema, defaulting to an empty object schema.
    pub fn schema(&self) -> Value {
        self.parameters
            .clone()
            .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}}))
    }
}

/// Complete tool call carried by an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: function_type(),
            index: None,
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    pub fn at_index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments
    #[serde(default)]
    pub arguments: String,
}

impl FunctionCall {
    /// Parse the JSON-encoded arguments. An empty string is an empty object.
    pub fn parsed_arguments(&self) -> serde_json::Result<Value> {
        if self.arguments.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&self.arguments)
    }
}

/// Tool call fragment inside a stream delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallChunk {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionCallChunk>,
}

impl ToolCallChunk {
    /// First fragment of a call: id and name, empty arguments.
    pub fn started(index: u32, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            index,
            id: Some(id.into()),
            call_type: Some(function_type()),
            function: Some(FunctionCallChunk {
                name: Some(name.into()),
                arguments: Some(String::new()),
            }),
        }
    }

    /// Subsequent fragment: arguments only, no name.
    pub fn arguments(index: u32, fragment: impl Into<String>) -> Self {
        Self {
            index,
            id: None,
            call_type: None,
            function: Some(FunctionCallChunk {
                name: None,
                arguments: Some(fragment.into()),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Parsed tool-choice policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    None,
    Auto,
    Required,
    Function(String),
}

impl ToolChoice {
    /// Interpret a raw `tool_choice` value. Anything unrecognised is `Auto`.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => match s.as_str() {
                "none" => ToolChoice::None,
                "required" | "any" => ToolChoice::Required,
                _ => ToolChoice::Auto,
            },
            Value::Object(map) => {
                let name = map
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .or_else(|| map.get("name"))
                    .and_then(|n| n.as_str());
                match (map.get("type").and_then(|t| t.as_str()), name) {
                    (Some("function"), Some(name)) => ToolChoice::Function(name.to_string()),
                    _ => ToolChoice::Auto,
                }
            }
            _ => ToolChoice::Auto,
        }
    }
}
