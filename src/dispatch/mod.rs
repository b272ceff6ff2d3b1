//! 调度模块：直连、队列中转与透传三种调用策略，共享同一“发送规范请求、得到规范响应或流”的契约。
//!
//! # Dispatch Strategies
//!
//! | Strategy | Description |
//! |----------|-------------|
//! | [`DirectDispatcher`] | HTTP straight to the vendor: cached transport, per-vendor retry budget |
//! | [`QueueDispatcher`] | Serialises the request into a [`QueueJob`] for an external [`QueueService`] |
//! | [`PassthroughDispatcher`] | Forwards bytes unchanged; decodes a buffered copy afterwards for accounting |
//!
//! ## Failure contract
//!
//! - [`Dispatcher::complete`] never returns both choices and an error: failures
//!   come back as a canonical response whose `error` field is set.
//! - [`Dispatcher::stream`] ends with exactly one `on_complete` or `on_error`
//!   on the listener and never retries after the first byte.
//!
//! ## Accounting
//!
//! Every call produces one [`UsageRecord`] for the configured
//! [`MetricsSink`]. Streams are teed: the listener receives each chunk first,
//! then a clone goes over an unbounded channel to a detached task that folds
//! the stream and reports it, so a slow sink never delays the caller.

mod direct;
mod passthrough;
pub(crate) mod policy;
mod queue;

pub use direct::DirectDispatcher;
pub use passthrough::{PassthroughDispatcher, PassthroughReply};
pub use queue::{QueueDispatcher, QueueJob, QueueService};

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

use crate::channel::ChannelConfig;
use crate::drivers::{DriverRegistry, VendorDriver};
use crate::pipeline::{ForwardOutcome, StreamAccumulator, StreamListener, TapEvent};
use crate::telemetry::{millis, noop_sink, MetricsSink, UsageRecord};
use crate::tokens::{PriceBook, ToolInvocations};
use crate::transport::HttpRequest;
use crate::types::{CompletionRequest, CompletionResponse};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchMode {
    Direct,
    Queued,
    Passthrough,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Direct => "direct",
            DispatchMode::Queued => "queued",
            DispatchMode::Passthrough => "passthrough",
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Send one canonical request and get a canonical response or stream.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    fn mode(&self) -> DispatchMode;

    /// Non-streaming call. Errors are typed; see [`Dispatcher::complete`] for
    /// the canonical-body form.
    async fn try_complete(&self, request: CompletionRequest, channel: &ChannelConfig) -> Result<CompletionResponse>;

    /// Non-streaming call; a failure is a response with only `error` set.
    async fn complete(&self, request: CompletionRequest, channel: &ChannelConfig) -> CompletionResponse {
        let model = request.model.clone();
        match self.try_complete(request, channel).await {
            Ok(response) => response,
            Err(e) => CompletionResponse::from_error(model, &e.to_channel_error()),
        }
    }

    /// Streaming call. The listener sees `on_open` before the first chunk,
    /// every chunk in order, then exactly one of `on_complete` / `on_error`.
    async fn stream(
        &self,
        request: CompletionRequest,
        channel: &ChannelConfig,
        listener: &mut dyn StreamListener,
    ) -> ForwardOutcome;
}

/// Price lookup and metrics reporting shared by the dispatchers.
#[derive(Clone)]
pub struct Accounting {
    metrics: Arc<dyn MetricsSink>,
    prices: Option<Arc<PriceBook>>,
}

impl Accounting {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self { metrics, prices: None }
    }

    pub fn with_price_book(mut self, prices: Arc<PriceBook>) -> Self {
        self.prices = Some(prices);
        self
    }

    /// Fill `cost`, or `cost_error` when usage cannot be priced.
    pub fn price(&self, record: &mut UsageRecord) {
        let (Some(usage), Some(book)) = (record.usage.as_ref(), self.prices.as_ref()) else {
            return;
        };
        match book.cost(&record.model, usage, &ToolInvocations::new()) {
            Ok(cost) => record.cost = Some(cost),
            Err(e) => {
                tracing::warn!(model = %record.model, error = %e, "usage could not be priced");
                record.cost_error = Some(e.to_string());
            }
        }
    }

    /// Price and report from a detached task.
    pub fn emit(&self, mut record: UsageRecord) {
        let this = self.clone();
        tokio::spawn(async move {
            this.price(&mut record);
            this.report(record).await;
        });
    }

    async fn report(&self, record: UsageRecord) {
        if let Err(e) = self.metrics.report(record).await {
            tracing::warn!(error = %e, "metrics sink rejected a usage record");
        }
    }

    /// Logging side of a stream tee. The returned sender is handed to
    /// [`crate::pipeline::forward`]; the task folds every chunk and reports
    /// one record once the stream ends.
    pub fn tap(&self, mut record: UsageRecord, started: Instant) -> (UnboundedSender<TapEvent>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<TapEvent>();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut acc = StreamAccumulator::new();
            let mut ended = false;
            while let Some(event) = rx.recv().await {
                match event {
                    TapEvent::Chunk(chunk) => {
                        if acc.chunks() == 0 {
                            record.time_to_first_chunk_ms = Some(millis(started.elapsed()));
                        }
                        acc.push(&chunk);
                    }
                    TapEvent::End(error) => {
                        record.error = error;
                        ended = true;
                        break;
                    }
                }
            }
            if !ended {
                tracing::debug!(model = %record.model, "stream tap closed without an end event");
            }
            record.chunks = acc.chunks();
            record.duration_ms = millis(started.elapsed());
            let response = acc.finish();
            if record.request_id.is_empty() {
                record.request_id = response.id.clone();
            }
            record.usage = response.usage;
            record.finish_reason = response.choices.first().and_then(|c| c.finish_reason);
            this.price(&mut record);
            this.report(record).await;
        });
        (tx, handle)
    }
}

impl Default for Accounting {
    fn default() -> Self {
        Self::new(noop_sink())
    }
}

impl fmt::Debug for Accounting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accounting")
            .field("priced", &self.prices.is_some())
            .finish()
    }
}

/// Build the vendor call for `request`, then clear the request's inline
/// media. The returned body is the only copy of the payload from here on.
pub(crate) fn compile(
    drivers: &DriverRegistry,
    request: &mut CompletionRequest,
    channel: &ChannelConfig,
) -> Result<(Arc<dyn VendorDriver>, HttpRequest)> {
    channel.validate()?;
    let driver = drivers.get(channel.vendor)?;
    let http = driver.build_request(request, channel)?;
    request.release_media();
    Ok((driver, http))
}

/// Usage record for a finished non-streaming call.
pub(crate) fn completion_record(
    channel: &ChannelConfig,
    mode: DispatchMode,
    model: &str,
    outcome: &Result<CompletionResponse>,
    started: Instant,
    retries: u32,
) -> UsageRecord {
    let mut record = UsageRecord::new(channel.vendor, model, mode.as_str(), false);
    record.duration_ms = millis(started.elapsed());
    record.retries = retries;
    match outcome {
        Ok(response) => {
            record.request_id = response.id.clone();
            record.usage = response.usage.clone();
            record.finish_reason = response.choices.first().and_then(|c| c.finish_reason);
            record.chunks = 1;
        }
        Err(e) => record.error = Some(e.to_channel_error()),
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Credential, Vendor};
    use crate::telemetry::InMemoryMetricsSink;
    use crate::types::{
        ContentPart, Delta, FinishReason, Message, MessageContent, MessageRole, StreamCompletionResponse, TokenUsage,
    };
    use std::time::Duration;

    const PNG: &str = "data:image/png;base64,iVBORw0KGgo=";

    fn image_url(request: &CompletionRequest) -> &str {
        match &request.messages[0].content {
            Some(MessageContent::Parts(parts)) => match &parts[1] {
                ContentPart::ImageUrl { image_url, .. } => image_url.url.as_str(),
                other => panic!("unexpected part {other:?}"),
            },
            other => panic!("unexpected content {other:?}"),
        }
    }

    #[test]
    fn compiled_call_owns_the_only_copy_of_inline_media() {
        let drivers = DriverRegistry::with_defaults();
        let channel = ChannelConfig::new(Vendor::Gemini, "https://g.example/v1beta", Credential::ApiKey { key: "k".into() });
        let mut request = CompletionRequest::new(
            "gemini-2.5-flash",
            vec![Message::with_content(
                MessageRole::User,
                MessageContent::Parts(vec![ContentPart::text("what is this?"), ContentPart::image_url(PNG)]),
            )],
        );

        let (_, http) = compile(&drivers, &mut request, &channel).unwrap();

        assert_eq!(image_url(&request), "");
        assert_eq!(request.messages[0].text(), "what is this?");
        let body: serde_json::Value = serde_json::from_slice(&http.body).unwrap();
        assert_eq!(body["contents"][0]["parts"][1]["inlineData"]["data"], "iVBORw0KGgo=");
    }

    #[tokio::test]
    async fn tap_folds_and_prices_the_stream() {
        let sink = Arc::new(InMemoryMetricsSink::default());
        let book = Arc::new(PriceBook::new());
        book.load_json(r#"{"gpt-4o": {"mode": "fixed", "input": 1.0, "output": 3.0}}"#)
            .unwrap();
        let accounting = Accounting::new(sink.clone()).with_price_book(book);
        let record = UsageRecord::new(Vendor::OpenAi, "gpt-4o", "direct", true);
        let (tx, handle) = accounting.tap(record, Instant::now());

        let chunk = StreamCompletionResponse::new("chatcmpl-t", 1, "gpt-4o");
        tx.send(TapEvent::Chunk(chunk.clone().with_delta(Delta::content("hi")))).unwrap();
        tx.send(TapEvent::Chunk(chunk.clone().with_finish(FinishReason::Stop))).unwrap();
        tx.send(TapEvent::Chunk(chunk.with_usage(TokenUsage::new(1000, 1000)))).unwrap();
        tx.send(TapEvent::End(None)).unwrap();
        handle.await.unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!((r.chunks, r.request_id.as_str()), (3, "chatcmpl-t"));
        assert_eq!(r.finish_reason, Some(FinishReason::Stop));
        assert_eq!(r.cost.as_ref().unwrap().total, rust_decimal::Decimal::new(4, 0));
        assert!(r.time_to_first_chunk_ms.is_some());
    }

    #[tokio::test]
    async fn unpriced_model_is_noted_not_fatal() {
        let sink = Arc::new(InMemoryMetricsSink::default());
        let accounting = Accounting::new(sink.clone()).with_price_book(Arc::new(PriceBook::new()));
        let channel = ChannelConfig::new(Vendor::Qwen, "https://q.example", Credential::None);
        let mut response = CompletionResponse::new("qwen-max");
        response.usage = Some(TokenUsage::new(1, 1));
        let record = completion_record(&channel, DispatchMode::Direct, "qwen-max", &Ok(response), Instant::now(), 0);
        accounting.emit(record);
        assert!(sink.wait_for(1, Duration::from_secs(2)).await);
        let r = &sink.records()[0];
        assert!(r.cost.is_none());
        assert!(r.cost_error.as_deref().unwrap().contains("qwen-max"));
    }
}
