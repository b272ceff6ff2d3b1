//! # llm-gateway-core
//!
//! 这是 LLM API 网关的协议核心：把统一的 OpenAI 兼容请求转换为各厂商协议，并把厂商响应与流式事件还原为统一格式。
//!
//! Protocol core of an LLM API gateway. Callers speak one canonical,
//! OpenAI-chat-completion-compatible format; the core compiles it into each
//! vendor's wire protocol, dispatches it, and normalizes responses and
//! streams back.
//!
//! ## Overview
//!
//! ```text
//! CompletionRequest ─► Dispatcher ─► VendorDriver::build_request ─► HttpTransport ─► vendor
//!                                                                                     │
//! CompletionResponse ◄── VendorDriver::parse_response ◄──────────────────────────────┤
//! StreamListener ◄── forward() ◄── StreamNormalizer ◄── Decoder (SSE / event-stream) ◄┘
//!                                        │
//!                               detached logging task ─► PriceBook ─► MetricsSink
//! ```
//!
//! ## Core Philosophy
//!
//! - **One canonical shape**: every vendor converts into and out of [`types`]
//! - **Streaming-first**: vendor frames become canonical chunks in arrival order
//! - **Typed failures**: each failure maps onto one OpenAI-style error body
//! - **Accounting off the hot path**: usage and cost are reported from detached tasks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use llm_gateway_core::channel::{ChannelConfig, Credential, Vendor};
//! use llm_gateway_core::dispatch::{DirectDispatcher, Dispatcher};
//! use llm_gateway_core::drivers::DriverRegistry;
//! use llm_gateway_core::transport::TransportPool;
//! use llm_gateway_core::types::{CompletionRequest, Message};
//!
//! #[tokio::main]
//! async fn main() {
//!     let dispatcher = DirectDispatcher::new(
//!         Arc::new(TransportPool::from_env()),
//!         Arc::new(DriverRegistry::with_defaults()),
//!     );
//!     let channel = ChannelConfig::new(
//!         Vendor::DeepSeek,
//!         "https://api.deepseek.com/v1",
//!         Credential::Bearer { token: "sk-...".into() },
//!     );
//!     let request = CompletionRequest::new("deepseek-chat", vec![Message::user("Hello")]);
//!     let response = dispatcher.complete(request, &channel).await;
//!     println!("{:?}", response.choices.first().map(|c| c.message.text()));
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`types`] | Canonical request, response, message, tool and usage types |
//! | [`channel`] | Vendor channel configuration: endpoint, credential, features, timeouts, retries |
//! | [`drivers`] | Per-vendor request compilation and response parsing |
//! | [`pipeline`] | Stream decoding, per-vendor normalization, listener forwarding |
//! | [`dispatch`] | Direct, queued and passthrough call strategies |
//! | [`transport`] | Cached HTTP clients with explicit timeouts |
//! | [`tokens`] | Tiered price tables and exact cost computation |
//! | [`telemetry`] | Per-call usage records and metrics sinks |
//! | [`error`] / [`error_code`] | Typed errors and their OpenAI-style mapping |

pub mod channel;
pub mod dispatch;
pub mod drivers;
pub mod error_code;
pub mod pipeline;
pub mod telemetry;
pub mod tokens;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use channel::{ChannelConfig, Credential, Vendor};
pub use dispatch::{DirectDispatcher, DispatchMode, Dispatcher, PassthroughDispatcher, QueueDispatcher};
pub use pipeline::{StreamAccumulator, StreamListener};
pub use tokens::PriceBook;
pub use types::{
    CompletionRequest, CompletionResponse, Message, MessageRole, StreamCompletionResponse, TokenUsage,
    ToolCall,
};

use futures::Stream;
use std::pin::Pin;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// A specialized Result for pipeline operations
pub type PipeResult<T> = std::result::Result<T, Error>;

/// A unified pinned, boxed stream that emits `PipeResult<T>`
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = PipeResult<T>> + Send + 'a>>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
