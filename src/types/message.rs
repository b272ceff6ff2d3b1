//! Canonical chat messages (OpenAI chat-completion compatible)

use serde::{Deserialize, Serialize};

use super::tool::ToolCall;

/// Canonical chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Vendor signature over `reasoning_content`, replayed verbatim on the next turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacted_reasoning_content: Option<String>,
}

impl Message {
    pub fn with_content(role: MessageRole, content: MessageContent) -> Self {
        Self {
            role,
            content: Some(content),
            name: None,
            tool_call_id: None,
            tool_calls: None,
            reasoning_content: None,
            reasoning_content_signature: None,
            redacted_reasoning_content: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::with_content(MessageRole::System, MessageContent::Text(text.into()))
    }

    pub fn developer(text: impl Into<String>) -> Self {
        Self::with_content(MessageRole::Developer, MessageContent::Text(text.into()))
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_content(MessageRole::User, MessageContent::Text(text.into()))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_content(MessageRole::Assistant, MessageContent::Text(text.into()))
    }

    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: None,
            tool_calls: Some(tool_calls),
            ..Self::with_content(MessageRole::Assistant, MessageContent::Text(String::new()))
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_content(MessageRole::Tool, MessageContent::Text(text.into()))
        }
    }

    /// Ordered content parts; a plain string content is one text part.
    pub fn parts(&self) -> Vec<ContentPart> {
        match &self.content {
            None => Vec::new(),
            Some(MessageContent::Text(s)) if s.is_empty() => Vec::new(),
            Some(MessageContent::Text(s)) => vec![ContentPart::text(s.clone())],
            Some(MessageContent::Parts(parts)) => parts.clone(),
        }
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        match &self.content {
            None => String::new(),
            Some(MessageContent::Text(s)) => s.clone(),
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text, .. } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn contains_image(&self) -> bool {
        match &self.content {
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .any(|p| matches!(p, ContentPart::ImageUrl { .. })),
            _ => false,
        }
    }

    /// Drop inline image payloads once they have been copied into a vendor request.
    pub fn release_media(&mut self) {
        if let Some(MessageContent::Parts(parts)) = &mut self.content {
            for part in parts.iter_mut() {
                if let ContentPart::ImageUrl { image_url, .. } = part {
                    if image_url.url.starts_with("data:") {
                        image_url.url = String::new();
                    }
                }
            }
        }
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    Developer,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    /// System and developer messages become vendor system instructions.
    pub fn is_instruction(&self) -> bool {
        matches!(self, MessageRole::System | MessageRole::Developer)
    }
}

/// Message content (plain string or ordered typed parts)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// Typed content part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ImageUrl {
        image_url: ImageUrl,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
    ToolCall {
        id: String,
        function: super::tool::FunctionCall,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text {
            text: text.into(),
            cache_control: None,
        }
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: url.into(),
                detail: None,
            },
            cache_control: None,
        }
    }

    /// Mark this part as a prompt-cache boundary.
    pub fn cached(mut self) -> Self {
        match &mut self {
            ContentPart::Text { cache_control, .. } | ContentPart::ImageUrl { cache_control, .. } => {
                *cache_control = Some(CacheControl::ephemeral());
            }
            _ => {}
        }
        self
    }

    pub fn is_cacheable(&self) -> bool {
        matches!(
            self,
            ContentPart::Text {
                cache_control: Some(_),
                ..
            } | ContentPart::ImageUrl {
                cache_control: Some(_),
                ..
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub kind: String,
}

impl CacheControl {
    pub fn ephemeral() -> Self {
        Self {
            kind: "ephemeral".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_and_part_content_deserialize() {
        let m: Message = serde_json::from_value(serde_json::json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "look", "cache_control": {"type": "ephemeral"}},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
            ]
        }))
        .unwrap();
        assert!(m.contains_image());
        assert!(m.parts()[0].is_cacheable());
        assert_eq!(m.text(), "look");

        let m: Message =
            serde_json::from_value(serde_json::json!({"role": "developer", "content": "rules"}))
                .unwrap();
        assert!(m.role.is_instruction());
        assert_eq!(m.parts().len(), 1);
    }

    #[test]
    fn release_media_clears_only_inline_payloads() {
        let mut m = Message::with_content(
            MessageRole::User,
            MessageContent::Parts(vec![
                ContentPart::image_url("data:image/png;base64,AAAA"),
                ContentPart::image_url("https://example.com/cat.png"),
            ]),
        );
        m.release_media();
        let parts = m.parts();
        match (&parts[0], &parts[1]) {
            (ContentPart::ImageUrl { image_url: a, .. }, ContentPart::ImageUrl { image_url: b, .. }) => {
                assert!(a.url.is_empty());
                assert_eq!(b.url, "https://example.com/cat.png");
            }
            _ => panic!("expected image parts"),
        }
    }
}
