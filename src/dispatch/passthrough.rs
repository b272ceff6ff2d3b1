//! Passthrough dispatch: caller bytes go to the vendor unchanged and the
//! vendor's bytes come back unchanged. Usage is recovered afterwards from a
//! bounded copy of the reply.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{stream, StreamExt};
use tokio::sync::OwnedSemaphorePermit;

use crate::channel::ChannelConfig;
use crate::drivers::{DriverRegistry, VendorDriver};
use crate::error::ChannelError;
use crate::pipeline::{self, ForwardOutcome, StreamAccumulator, StreamListener};
use crate::telemetry::{millis, UsageRecord};
use crate::transport::{HttpRequest, StreamReply, TransportPool};
use crate::types::{CompletionRequest, CompletionResponse};
use crate::{BoxStream, Error, Result};

use super::{compile, completion_record, Accounting, DispatchMode, Dispatcher};

const DEFAULT_MAX_CAPTURE: usize = 16 * 1024 * 1024;

/// Upstream reply handed back unchanged.
pub struct PassthroughReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: BoxStream<'static, Bytes>,
}

impl PassthroughReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_event_stream(&self) -> bool {
        is_event_stream(self.content_type.as_deref())
    }
}

fn is_event_stream(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| {
        let ct = ct.to_ascii_lowercase();
        ct.contains("event-stream") || ct.contains("eventstream")
    })
}

/// Forwards request bodies byte-for-byte and relays the vendor's bytes back.
///
/// A copy of the reply is buffered while the caller reads it. Once the body
/// is finished or dropped, a detached task decodes the copy through the
/// vendor driver and reports one [`UsageRecord`]. Decode failures there are
/// logged and the record is dropped; the caller's bytes are never affected.
pub struct PassthroughDispatcher {
    pool: Arc<TransportPool>,
    drivers: Arc<DriverRegistry>,
    accounting: Accounting,
    max_capture: usize,
}

impl PassthroughDispatcher {
    pub fn new(pool: Arc<TransportPool>, drivers: Arc<DriverRegistry>) -> Self {
        Self {
            pool,
            drivers,
            accounting: Accounting::default(),
            max_capture: DEFAULT_MAX_CAPTURE,
        }
    }

    pub fn with_accounting(mut self, accounting: Accounting) -> Self {
        self.accounting = accounting;
        self
    }

    /// Replies larger than this are relayed but not accounted.
    pub fn with_max_capture(mut self, bytes: usize) -> Self {
        self.max_capture = bytes;
        self
    }

    /// Send `body` to the channel's endpoint for `model` unchanged.
    ///
    /// URL and headers are the ones the vendor driver would use for a call of
    /// the same shape; only the body is swapped for the caller's bytes.
    pub async fn forward(
        &self,
        body: Bytes,
        model: &str,
        channel: &ChannelConfig,
        stream: bool,
    ) -> Result<PassthroughReply> {
        channel.validate()?;
        let driver = self.drivers.get(channel.vendor)?;
        let shape = CompletionRequest::new(model, Vec::new()).with_stream(stream);
        let mut http = driver.build_request(&shape, channel)?;
        http.body = body;
        self.relay(driver, http, model, channel).await
    }

    async fn relay(
        &self,
        driver: Arc<dyn VendorDriver>,
        http: HttpRequest,
        model: &str,
        channel: &ChannelConfig,
    ) -> Result<PassthroughReply> {
        let started = Instant::now();
        let transport = self.pool.transport(channel)?;
        let permit = if http.stream {
            Some(self.pool.acquire_stream().await?)
        } else {
            None
        };
        let stream = http.stream;
        let StreamReply {
            status,
            content_type,
            body,
        } = transport.open_stream(&http).await?;
        tracing::debug!(
            vendor = %channel.vendor,
            model = %model,
            http_status = status,
            content_type = ?content_type,
            "passthrough reply opened"
        );

        let capture = Capture {
            inner: Some(Captured {
                driver,
                accounting: self.accounting.clone(),
                record: UsageRecord::new(channel.vendor, model, DispatchMode::Passthrough.as_str(), stream),
                status,
                content_type: content_type.clone(),
                buffer: BytesMut::new(),
                max_capture: self.max_capture,
                overflowed: false,
                started,
                first_chunk_ms: None,
                failure: None,
                _permit: permit,
            }),
        };

        let relayed: BoxStream<'static, Bytes> = Box::pin(stream::unfold(
            (body, capture, false),
            |(mut body, mut capture, done)| async move {
                if done {
                    return None;
                }
                match body.next().await {
                    Some(Ok(bytes)) => {
                        capture.push(&bytes);
                        Some((Ok(bytes), (body, capture, false)))
                    }
                    Some(Err(e)) => {
                        capture.fail(e.to_channel_error());
                        Some((Err(e), (body, capture, true)))
                    }
                    None => None,
                }
            },
        ));

        Ok(PassthroughReply {
            status,
            content_type,
            body: relayed,
        })
    }
}

/// Buffered copy of one reply. Dropping it starts the accounting task.
struct Capture {
    inner: Option<Captured>,
}

struct Captured {
    driver: Arc<dyn VendorDriver>,
    accounting: Accounting,
    record: UsageRecord,
    status: u16,
    content_type: Option<String>,
    buffer: BytesMut,
    max_capture: usize,
    overflowed: bool,
    started: Instant,
    first_chunk_ms: Option<u64>,
    failure: Option<ChannelError>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Capture {
    fn push(&mut self, bytes: &Bytes) {
        let Some(c) = self.inner.as_mut() else { return };
        if c.first_chunk_ms.is_none() {
            c.first_chunk_ms = Some(millis(c.started.elapsed()));
        }
        if c.overflowed {
            return;
        }
        if c.buffer.len() + bytes.len() > c.max_capture {
            c.overflowed = true;
            c.buffer.clear();
            return;
        }
        c.buffer.extend_from_slice(bytes);
    }

    fn fail(&mut self, err: ChannelError) {
        if let Some(c) = self.inner.as_mut() {
            c.failure = Some(err);
        }
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        let Some(captured) = self.inner.take() else { return };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(captured.settle());
            }
            Err(_) => tracing::warn!(
                model = %captured.record.model,
                "passthrough reply dropped outside a runtime; usage not recorded"
            ),
        }
    }
}

impl Captured {
    async fn settle(self) {
        let Captured {
            driver,
            accounting,
            mut record,
            status,
            content_type,
            buffer,
            overflowed,
            started,
            first_chunk_ms,
            failure,
            _permit,
            ..
        } = self;
        drop(_permit);
        record.time_to_first_chunk_ms = first_chunk_ms;
        record.duration_ms = millis(started.elapsed());

        if let Some(err) = failure {
            record.error = Some(err);
            accounting.emit(record);
            return;
        }
        let body = buffer.freeze();
        if !(200..300).contains(&status) {
            record.error = Some(driver.parse_error(status, &body));
            accounting.emit(record);
            return;
        }
        if overflowed {
            tracing::warn!(model = %record.model, "passthrough reply exceeded the capture limit; usage not recorded");
            return;
        }

        let decoded = if is_event_stream(content_type.as_deref()) {
            decode_stream(driver.as_ref(), body, &record.model).await
        } else {
            driver.parse_response(&body, &record.model).map(|r| (r, 1))
        };
        match decoded {
            Ok((response, chunks)) => {
                record.chunks = chunks;
                record.request_id = response.id.clone();
                record.usage = response.usage;
                record.finish_reason = response.choices.first().and_then(|c| c.finish_reason);
                accounting.emit(record);
            }
            Err(e) => tracing::warn!(
                vendor = %record.vendor,
                model = %record.model,
                error = %e,
                "passthrough reply could not be decoded; usage dropped"
            ),
        }
    }
}

async fn decode_stream(driver: &dyn VendorDriver, body: Bytes, model: &str) -> Result<(CompletionResponse, usize)> {
    let bytes: BoxStream<'static, Bytes> = Box::pin(stream::iter([Ok(body)]));
    let mut chunks = pipeline::normalize(bytes, driver.stream_decoder(), driver.stream_normalizer(model)).await?;
    let mut acc = StreamAccumulator::new();
    while let Some(chunk) = chunks.next().await {
        acc.push(&chunk?);
    }
    let count = acc.chunks();
    Ok((acc.finish(), count))
}

#[async_trait]
impl Dispatcher for PassthroughDispatcher {
    fn mode(&self) -> DispatchMode {
        DispatchMode::Passthrough
    }

    /// The canonical request is compiled once by the vendor driver, then
    /// relayed without retries.
    async fn try_complete(&self, mut request: CompletionRequest, channel: &ChannelConfig) -> Result<CompletionResponse> {
        request.stream = false;
        let started = Instant::now();
        let reply = async {
            let (driver, http) = compile(&self.drivers, &mut request, channel)?;
            let reply = self.relay(driver.clone(), http, &request.model, channel).await?;
            Ok::<_, Error>((driver, reply))
        }
        .await;
        let (driver, reply) = match reply {
            Ok(opened) => opened,
            Err(e) => {
                let outcome = Err(e);
                self.accounting.emit(completion_record(
                    channel,
                    DispatchMode::Passthrough,
                    &request.model,
                    &outcome,
                    started,
                    0,
                ));
                return outcome;
            }
        };
        let status = reply.status;
        let body = StreamReply {
            status,
            content_type: reply.content_type,
            body: reply.body,
        }
        .collect()
        .await?;
        if !(200..300).contains(&status) {
            return Err(Error::Channel(driver.parse_error(status, &body)));
        }
        driver.parse_response(&body, &request.model)
    }

    async fn stream(
        &self,
        mut request: CompletionRequest,
        channel: &ChannelConfig,
        listener: &mut dyn StreamListener,
    ) -> ForwardOutcome {
        request.stream = true;
        let started = Instant::now();
        let mut relayed = false;
        let opened = async {
            let (driver, http) = compile(&self.drivers, &mut request, channel)?;
            let reply = self.relay(driver.clone(), http, &request.model, channel).await?;
            relayed = true;
            if !reply.is_success() {
                let status = reply.status;
                let body = StreamReply {
                    status,
                    content_type: reply.content_type,
                    body: reply.body,
                }
                .collect()
                .await
                .unwrap_or_default();
                return Err(Error::Channel(driver.parse_error(status, &body)));
            }
            pipeline::normalize(reply.body, driver.stream_decoder(), driver.stream_normalizer(&request.model)).await
        }
        .await;

        match opened {
            Ok(chunks) => pipeline::forward(chunks, listener, None).await,
            Err(e) => {
                let err = e.to_channel_error();
                tracing::warn!(
                    vendor = %channel.vendor,
                    model = %request.model,
                    http_status = err.status,
                    error = %e,
                    "passthrough stream failed to open"
                );
                listener.on_error(err.clone()).await;
                // Replies from the vendor are accounted by their capture.
                if !relayed {
                    let mut record =
                        UsageRecord::new(channel.vendor, request.model.clone(), DispatchMode::Passthrough.as_str(), true);
                    record.error = Some(err.clone());
                    record.duration_ms = millis(started.elapsed());
                    self.accounting.emit(record);
                }
                ForwardOutcome {
                    error: Some(err),
                    ..ForwardOutcome::default()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Credential, Vendor};
    use crate::pipeline::test_support::Recorder;
    use crate::telemetry::InMemoryMetricsSink;
    use crate::transport::PoolConfig;
    use std::time::Duration;

    fn dispatcher(sink: Arc<InMemoryMetricsSink>) -> PassthroughDispatcher {
        let pool = Arc::new(TransportPool::new(PoolConfig {
            cache_capacity: 8,
            cache_ttl: Duration::from_secs(60),
            max_concurrent_streams: 4,
        }));
        PassthroughDispatcher::new(pool, Arc::new(DriverRegistry::with_defaults()))
            .with_accounting(Accounting::new(sink))
    }

    #[test]
    fn event_stream_content_types() {
        assert!(is_event_stream(Some("text/event-stream; charset=utf-8")));
        assert!(is_event_stream(Some("application/vnd.amazon.eventstream")));
        assert!(!is_event_stream(Some("application/json")));
        assert!(!is_event_stream(None));
    }

    #[tokio::test]
    async fn buffered_sse_copy_is_accounted_after_drop() {
        let sink = Arc::new(InMemoryMetricsSink::default());
        let captured = Captured {
            driver: crate::drivers::create_driver(Vendor::OpenAi),
            accounting: Accounting::new(sink.clone()),
            record: UsageRecord::new(Vendor::OpenAi, "gpt-4o", "passthrough", true),
            status: 200,
            content_type: Some("text/event-stream".into()),
            buffer: BytesMut::new(),
            max_capture: DEFAULT_MAX_CAPTURE,
            overflowed: false,
            started: Instant::now(),
            first_chunk_ms: None,
            failure: None,
            _permit: None,
        };
        let mut capture = Capture { inner: Some(captured) };
        for part in [
            "data: {\"id\":\"chatcmpl-p\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"}}]}\n\n",
            "data: {\"id\":\"chatcmpl-p\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"id\":\"chatcmpl-p\",\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2,\"total_tokens\":7}}\n\n",
            "data: [DONE]\n\n",
        ] {
            capture.push(&Bytes::from_static(part.as_bytes()));
        }
        drop(capture);

        assert!(sink.wait_for(1, Duration::from_secs(2)).await);
        let r = &sink.records()[0];
        assert_eq!(r.mode, "passthrough");
        assert_eq!(r.total_tokens(), 7);
        assert!(r.time_to_first_chunk_ms.is_some());
        assert!(r.is_success());
    }

    #[tokio::test]
    async fn oversized_reply_is_not_accounted() {
        let sink = Arc::new(InMemoryMetricsSink::default());
        let mut capture = Capture {
            inner: Some(Captured {
                driver: crate::drivers::create_driver(Vendor::OpenAi),
                accounting: Accounting::new(sink.clone()),
                record: UsageRecord::new(Vendor::OpenAi, "gpt-4o", "passthrough", false),
                status: 200,
                content_type: Some("application/json".into()),
                buffer: BytesMut::new(),
                max_capture: 4,
                overflowed: false,
                started: Instant::now(),
                first_chunk_ms: None,
                failure: None,
                _permit: None,
            }),
        };
        capture.push(&Bytes::from_static(b"{\"id\":\"x\"}"));
        drop(capture);
        assert!(!sink.wait_for(1, Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn unreachable_vendor_is_one_on_error() {
        let sink = Arc::new(InMemoryMetricsSink::default());
        let d = dispatcher(sink.clone());
        let channel = ChannelConfig::new(Vendor::DeepSeek, "http://127.0.0.1:9", Credential::None);
        let mut rec = Recorder::default();
        let outcome = d
            .stream(
                CompletionRequest::new("deepseek-chat", vec![crate::types::Message::user("hi")]),
                &channel,
                &mut rec,
            )
            .await;
        assert!(outcome.error.is_some());
        assert_eq!(rec.calls, vec!["error"]);
        assert!(sink.wait_for(1, Duration::from_secs(2)).await);
        assert_eq!(sink.records()[0].mode, "passthrough");
    }
}
