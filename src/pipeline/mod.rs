//! 流式归一化模块：将厂商的 SSE / 二进制事件流解码并逐帧转换为规范的流式分块。
//!
//! # Streaming Pipeline
//!
//! Turns a vendor's raw response bytes into an ordered stream of canonical
//! [`StreamCompletionResponse`] chunks, and drives a caller's
//! [`StreamListener`] from that stream.
//!
//! ## Pipeline Stages
//!
//! ```text
//! Raw Bytes → Decoder → VendorEvent → StreamNormalizer → canonical chunks → forward() → StreamListener
//!     │           │                          │                                  │
//!   HTTP     SSE / AWS event-stream    per-call state machine            tee to logging task
//! ```
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Decoder`] | Byte framing: [`decode::SseDecoder`], [`eventstream::EventStreamDecoder`] |
//! | [`StreamNormalizer`] | Per-vendor state machine (one instance per call) |
//! | [`StreamState`] | Shared bookkeeping: tool-call indices, finish reason, completion flag |
//! | [`normalize`] | Decoder + normalizer → ordered `BoxStream` of chunks |
//! | [`forward`] | Deliver chunks to a listener, optionally teeing them to a logging channel |
//! | [`accumulate::StreamAccumulator`] | Fold chunks back into a `CompletionResponse` |
//!
//! ## Guarantees
//!
//! - Chunks are emitted in vendor arrival order; nothing is buffered for reordering.
//! - A stream ends successfully only after a completion or usage event; a bare
//!   close, decode error or transport error yields exactly one `Err` and ends.
//! - Tool calls receive canonical indices `0, 1, 2, ...` in start order; the
//!   first fragment carries id and name with empty arguments, later fragments
//!   carry argument text only.

pub mod accumulate;
pub mod bedrock;
pub mod decode;
pub mod eventstream;
pub mod gemini;
pub mod openai;
pub mod responses;

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::ChannelError;
use crate::error_code::ErrorKind;
use crate::types::{
    Delta, FinishReason, MessageRole, StreamCompletionResponse, TokenUsage, ToolCallChunk,
};
use crate::{BoxStream, Error, PipeResult};

pub use accumulate::StreamAccumulator;

/// One decoded vendor frame.
#[derive(Debug, Clone, PartialEq)]
pub enum VendorEvent {
    /// `event` is the SSE event name or the event-stream `:event-type`.
    Frame { event: Option<String>, data: Value },
    /// Explicit end-of-stream sentinel (`data: [DONE]`).
    Done,
}

impl VendorEvent {
    pub fn data(data: Value) -> Self {
        VendorEvent::Frame { event: None, data }
    }

    pub fn named(event: impl Into<String>, data: Value) -> Self {
        VendorEvent::Frame {
            event: Some(event.into()),
            data,
        }
    }
}

/// Byte framing: raw body bytes to vendor events.
#[async_trait::async_trait]
pub trait Decoder: Send + Sync {
    async fn decode_stream(
        &self,
        input: BoxStream<'static, Bytes>,
    ) -> PipeResult<BoxStream<'static, VendorEvent>>;
}

/// Per-call vendor state machine. Never shared between calls.
pub trait StreamNormalizer: Send {
    /// Canonical chunks for one vendor event, in emission order.
    fn on_event(&mut self, event: VendorEvent) -> PipeResult<Vec<StreamCompletionResponse>>;

    /// Called once when the byte stream closes. Fails unless a completion or
    /// usage event has been seen.
    fn on_end(&mut self) -> PipeResult<Vec<StreamCompletionResponse>> {
        self.state().ensure_finished()?;
        Ok(Vec::new())
    }

    fn state(&self) -> &StreamState;

    fn is_finished(&self) -> bool {
        self.state().finished
    }
}

/// Call-scoped bookkeeping shared by every normalizer.
#[derive(Debug, Clone)]
pub struct StreamState {
    pub id: String,
    pub created: i64,
    pub model: String,
    next_tool_index: u32,
    /// Vendor-side tool key (block index, item id, ...) -> canonical index and id.
    tool_slots: HashMap<String, (u32, String)>,
    pub saw_tool_call: bool,
    role_sent: bool,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<TokenUsage>,
    /// Completion or usage observed.
    pub finished: bool,
}

impl StreamState {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: crate::types::response::new_completion_id(),
            created: crate::types::response::now_epoch_secs(),
            model: model.into(),
            next_tool_index: 0,
            tool_slots: HashMap::new(),
            saw_tool_call: false,
            role_sent: false,
            finish_reason: None,
            usage: None,
            finished: false,
        }
    }

    fn chunk(&self) -> StreamCompletionResponse {
        StreamCompletionResponse::new(self.id.clone(), self.created, self.model.clone())
    }

    /// Chunk carrying `delta`; the first one also carries `role: assistant`.
    pub fn delta(&mut self, mut delta: Delta) -> StreamCompletionResponse {
        if !self.role_sent {
            self.role_sent = true;
            delta.role = Some(MessageRole::Assistant);
        }
        self.chunk().with_delta(delta)
    }

    pub fn text(&mut self, text: impl Into<String>) -> StreamCompletionResponse {
        self.delta(Delta::content(text))
    }

    pub fn reasoning(&mut self, text: impl Into<String>) -> StreamCompletionResponse {
        self.delta(Delta::reasoning(text))
    }

    /// Allocate the next canonical index for a new tool call.
    pub fn start_tool(
        &mut self,
        key: impl Into<String>,
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> StreamCompletionResponse {
        let index = self.next_tool_index;
        self.next_tool_index += 1;
        self.saw_tool_call = true;
        let id = id.into();
        self.tool_slots.insert(key.into(), (index, id.clone()));
        self.delta(Delta::tool_call(ToolCallChunk::started(index, id, name)))
    }

    pub fn tool_index(&self, key: &str) -> Option<u32> {
        self.tool_slots.get(key).map(|(i, _)| *i)
    }

    pub fn tool_id(&self, key: &str) -> Option<&str> {
        self.tool_slots.get(key).map(|(_, id)| id.as_str())
    }

    /// Argument fragment for an already started call; `None` for unknown keys
    /// or empty fragments.
    pub fn tool_arguments(&mut self, key: &str, fragment: &str) -> Option<StreamCompletionResponse> {
        if fragment.is_empty() {
            return None;
        }
        let index = self.tool_index(key)?;
        Some(self.delta(Delta::tool_call(ToolCallChunk::arguments(index, fragment))))
    }

    /// Finish chunk. A plain stop after tool calls is reported as `tool_calls`.
    pub fn finish(&mut self, reason: FinishReason) -> StreamCompletionResponse {
        let reason = if reason == FinishReason::Stop && self.saw_tool_call {
            FinishReason::ToolCalls
        } else {
            reason
        };
        self.finish_reason = Some(reason);
        self.finished = true;
        self.chunk().with_finish(reason)
    }

    /// Terminal usage chunk: no choices, only usage.
    pub fn usage_chunk(&mut self, usage: TokenUsage) -> StreamCompletionResponse {
        self.usage = Some(usage.clone());
        self.finished = true;
        self.chunk().with_usage(usage)
    }

    pub fn ensure_finished(&self) -> PipeResult<()> {
        if self.finished {
            Ok(())
        } else {
            Err(Error::Channel(ChannelError::new(
                502,
                ErrorKind::BadGateway.name(),
                "vendor stream closed before completion",
            )))
        }
    }
}

struct NormalizeState {
    events: BoxStream<'static, VendorEvent>,
    normalizer: Box<dyn StreamNormalizer>,
    pending: VecDeque<StreamCompletionResponse>,
    done: bool,
}

/// Decode and normalize a vendor byte stream into canonical chunks.
pub async fn normalize(
    bytes: BoxStream<'static, Bytes>,
    decoder: Box<dyn Decoder>,
    normalizer: Box<dyn StreamNormalizer>,
) -> PipeResult<BoxStream<'static, StreamCompletionResponse>> {
    let events = decoder.decode_stream(bytes).await?;
    let init = NormalizeState {
        events,
        normalizer,
        pending: VecDeque::new(),
        done: false,
    };
    let stream = stream::unfold(init, |mut st| async move {
        loop {
            if let Some(chunk) = st.pending.pop_front() {
                return Some((Ok(chunk), st));
            }
            if st.done {
                return None;
            }
            let step = match st.events.next().await {
                Some(Ok(event)) => st.normalizer.on_event(event),
                Some(Err(e)) => Err(e),
                None => {
                    st.done = true;
                    st.normalizer.on_end()
                }
            };
            match step {
                Ok(chunks) => st.pending.extend(chunks),
                Err(e) => {
                    st.done = true;
                    st.pending.clear();
                    return Some((Err(e), st));
                }
            }
        }
    });
    Ok(Box::pin(stream))
}

/// Caller-side sink for one canonical stream.
#[async_trait::async_trait]
pub trait StreamListener: Send {
    /// Called once, right before the first chunk.
    async fn on_open(&mut self) {}

    async fn on_chunk(&mut self, chunk: StreamCompletionResponse);

    async fn on_complete(&mut self) {}

    async fn on_error(&mut self, error: ChannelError);
}

/// What the logging side of a tee receives.
#[derive(Debug, Clone)]
pub enum TapEvent {
    Chunk(StreamCompletionResponse),
    End(Option<ChannelError>),
}

#[derive(Debug, Clone, Default)]
pub struct ForwardOutcome {
    pub chunks: usize,
    pub time_to_first_chunk: Option<Duration>,
    pub error: Option<ChannelError>,
}

/// Deliver every chunk to `listener` in order, then exactly one of
/// `on_complete` / `on_error`. When `tap` is set, each chunk is cloned onto it
/// after the listener has received it.
pub async fn forward(
    mut stream: BoxStream<'static, StreamCompletionResponse>,
    listener: &mut dyn StreamListener,
    tap: Option<&UnboundedSender<TapEvent>>,
) -> ForwardOutcome {
    let started = Instant::now();
    let mut outcome = ForwardOutcome::default();
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                if outcome.chunks == 0 {
                    outcome.time_to_first_chunk = Some(started.elapsed());
                    listener.on_open().await;
                }
                outcome.chunks += 1;
                match tap {
                    Some(tap) => {
                        listener.on_chunk(chunk.clone()).await;
                        // A closed tap only means the logging side went away.
                        let _ = tap.send(TapEvent::Chunk(chunk));
                    }
                    None => listener.on_chunk(chunk).await,
                }
            }
            Err(e) => {
                outcome.error = Some(e.to_channel_error());
                break;
            }
        }
    }
    match &outcome.error {
        Some(err) => listener.on_error(err.clone()).await,
        None => listener.on_complete().await,
    }
    if let Some(tap) = tap {
        let _ = tap.send(TapEvent::End(outcome.error.clone()));
    }
    outcome
}

/// Parse a JSON object out of a frame, for normalizers.
pub(crate) fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(|v| v.as_str())
}

pub(crate) fn u64_at(value: &Value, pointer: &str) -> Option<u64> {
    value.pointer(pointer).and_then(|v| v.as_u64())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Listener that records every callback in order.
    #[derive(Default)]
    pub struct Recorder {
        pub calls: Vec<String>,
        pub chunks: Vec<StreamCompletionResponse>,
        pub error: Option<ChannelError>,
    }

    #[async_trait::async_trait]
    impl StreamListener for Recorder {
        async fn on_open(&mut self) {
            self.calls.push("open".into());
        }
        async fn on_chunk(&mut self, chunk: StreamCompletionResponse) {
            self.calls.push("chunk".into());
            self.chunks.push(chunk);
        }
        async fn on_complete(&mut self) {
            self.calls.push("complete".into());
        }
        async fn on_error(&mut self, error: ChannelError) {
            self.calls.push("error".into());
            self.error = Some(error);
        }
    }

    pub fn byte_stream(parts: Vec<&'static str>) -> BoxStream<'static, Bytes> {
        Box::pin(stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p.as_bytes())))))
    }
}
