//! 规范数据模型：所有厂商适配器共享的请求/响应/消息/工具调用/用量类型。
//!
//! # Canonical Model
//!
//! The vendor-neutral, OpenAI-chat-completion-compatible shapes the gateway
//! standardizes on. Every driver converts into and out of these types.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`CompletionRequest`] | Inbound request: model, messages, tools, sampling, stream flag |
//! | [`Message`] | Chat message with role and string or typed-part content |
//! | [`ToolCall`] / [`ToolCallChunk`] | Complete tool call / streamed fragment |
//! | [`CompletionResponse`] | Synchronous response with choices, usage or error |
//! | [`StreamCompletionResponse`] | One streamed chunk carrying a [`Delta`] |
//! | [`TokenUsage`] | Prompt/completion/total counts plus informational details |
//!
//! ## Example
//!
//! ```rust
//! use llm_gateway_core::types::{CompletionRequest, Message, Tool};
//!
//! let request = CompletionRequest::new(
//!     "gpt-4o",
//!     vec![Message::system("Be brief."), Message::user("Weather in Paris?")],
//! )
//! .with_tools(vec![Tool::function(
//!     "get_weather",
//!     Some("Current weather".to_string()),
//!     serde_json::json!({"type": "object", "properties": {"city": {"type": "string"}}}),
//! )]);
//! assert!(request.has_tools());
//! ```

pub mod message;
pub mod request;
pub mod response;
pub mod tool;
pub mod usage;

pub use message::{CacheControl, ContentPart, ImageUrl, Message, MessageContent, MessageRole};
pub use request::{CompletionRequest, ReasoningEffort, StopSequences, StreamOptions};
pub use response::{
    ApiError, Choice, CompletionResponse, Delta, FinishReason, StreamChoice,
    StreamCompletionResponse,
};
pub use tool::{
    FunctionCall, FunctionCallChunk, FunctionDefinition, Tool, ToolCall, ToolCallChunk,
    ToolChoice,
};
pub use usage::{TokenUsage, TokensDetail};
