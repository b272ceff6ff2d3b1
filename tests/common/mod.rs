//! Mock HTTP server setup for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use llm_gateway_core::channel::{ChannelConfig, Credential, RetryBudget, Vendor};
use llm_gateway_core::dispatch::{DirectDispatcher, PassthroughDispatcher};
use llm_gateway_core::drivers::DriverRegistry;
use llm_gateway_core::error::ChannelError;
use llm_gateway_core::pipeline::eventstream::EventStreamMessage;
use llm_gateway_core::pipeline::StreamListener;
use llm_gateway_core::telemetry::InMemoryMetricsSink;
use llm_gateway_core::transport::{PoolConfig, TransportPool};
use llm_gateway_core::types::StreamCompletionResponse;
use mockito::{Server, ServerGuard};
use serde_json::Value;

/// Test fixture that owns a mock vendor endpoint.
pub struct MockServerFixture {
    pub server: ServerGuard,
    pub base_url: String,
}

impl MockServerFixture {
    pub async fn new() -> Self {
        let server = Server::new_async().await;
        let base_url = server.url();
        Self { server, base_url }
    }

    /// Channel pointed at the mock server, with fast retries.
    pub fn channel(&self, vendor: Vendor) -> ChannelConfig {
        ChannelConfig::new(vendor, self.base_url.as_str(), Credential::Bearer { token: "sk-test".into() })
            .with_retry(RetryBudget {
                max_retries: vendor.default_max_retries(),
                min_delay_ms: 1,
                max_delay_ms: 5,
            })
    }
}

pub fn pool() -> Arc<TransportPool> {
    Arc::new(TransportPool::new(PoolConfig {
        cache_capacity: 16,
        cache_ttl: Duration::from_secs(60),
        max_concurrent_streams: 8,
    }))
}

pub fn direct(sink: Arc<InMemoryMetricsSink>) -> DirectDispatcher {
    DirectDispatcher::new(pool(), Arc::new(DriverRegistry::with_defaults())).with_metrics(sink)
}

pub fn passthrough() -> PassthroughDispatcher {
    PassthroughDispatcher::new(pool(), Arc::new(DriverRegistry::with_defaults()))
}

/// SSE body from JSON payloads; `[DONE]` is appended when `done` is set.
pub fn sse(frames: &[Value], done: bool) -> String {
    let mut body: String = frames.iter().map(|f| format!("data: {}\n\n", f)).collect();
    if done {
        body.push_str("data: [DONE]\n\n");
    }
    body
}

/// AWS event-stream body from `(event type, payload)` pairs.
pub fn event_stream(frames: &[(&str, Value)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (kind, payload) in frames {
        body.extend_from_slice(&EventStreamMessage::encode(
            &[(":event-type", kind), (":content-type", "application/json"), (":message-type", "event")],
            payload.to_string().as_bytes(),
        ));
    }
    body
}

pub fn bytes_of(chunks: Vec<Bytes>) -> Vec<u8> {
    chunks.into_iter().flat_map(|b| b.to_vec()).collect()
}

/// Listener that records every callback in order.
#[derive(Default)]
pub struct Recorder {
    pub calls: Vec<&'static str>,
    pub chunks: Vec<StreamCompletionResponse>,
    pub error: Option<ChannelError>,
}

#[async_trait::async_trait]
impl StreamListener for Recorder {
    async fn on_open(&mut self) {
        self.calls.push("open");
    }

    async fn on_chunk(&mut self, chunk: StreamCompletionResponse) {
        self.calls.push("chunk");
        self.chunks.push(chunk);
    }

    async fn on_complete(&mut self) {
        self.calls.push("complete");
    }

    async fn on_error(&mut self, error: ChannelError) {
        self.calls.push("error");
        self.error = Some(error);
    }
}
