//! Queued dispatch: the canonical request travels as a [`QueueJob`] to an
//! external admission queue, which answers with a response or a chunk feed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::channel::{ChannelConfig, Vendor};
use crate::error::ChannelError;
use crate::error_code::ErrorKind;
use crate::pipeline::{self, ForwardOutcome, StreamListener};
use crate::telemetry::{millis, UsageRecord};
use crate::types::{CompletionRequest, CompletionResponse, StreamCompletionResponse};
use crate::{BoxStream, Error, PipeResult, Result};

use super::{completion_record, Accounting, DispatchMode, Dispatcher};

/// A canonical request serialised for an external queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub job_id: String,
    /// Vendor endpoint the job is bound for (the channel's base URL).
    pub endpoint: String,
    pub vendor: Vendor,
    pub model: String,
    pub stream: bool,
    /// The canonical request as JSON.
    pub payload: Value,
}

impl QueueJob {
    pub fn new(request: &CompletionRequest, channel: &ChannelConfig) -> Result<Self> {
        Ok(Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            endpoint: channel.base().to_string(),
            vendor: channel.vendor,
            model: request.model.clone(),
            stream: request.stream,
            payload: serde_json::to_value(request)?,
        })
    }

    /// Serialise `request` and clear its inline media, leaving the payload
    /// with the only copy.
    pub fn detach(request: &mut CompletionRequest, channel: &ChannelConfig) -> Result<Self> {
        let job = Self::new(request, channel)?;
        request.release_media();
        Ok(job)
    }

    /// The canonical request back out of the payload, for the consuming side.
    pub fn request(&self) -> Result<CompletionRequest> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// External admission-control queue. The core only enqueues; running the job
/// is the service's business.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Wait for the job's canonical response.
    async fn enqueue_blocking(&self, job: QueueJob, identity: &str, timeout: Duration) -> Result<CompletionResponse>;

    /// Resolve once the job has started streaming. Chunks go to `sink`; a
    /// dropped sender without a terminal chunk is a truncated stream.
    async fn enqueue_streaming(
        &self,
        job: QueueJob,
        identity: &str,
        timeout: Duration,
        sink: mpsc::Sender<PipeResult<StreamCompletionResponse>>,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relay {
    Open,
    /// A finish or usage chunk has been relayed.
    Terminated,
    Closed,
}

/// Routes calls through a [`QueueService`] under a fixed caller identity.
pub struct QueueDispatcher {
    queue: Arc<dyn QueueService>,
    identity: String,
    wait_timeout: Duration,
    buffer: usize,
    accounting: Accounting,
}

impl QueueDispatcher {
    pub fn new(queue: Arc<dyn QueueService>, identity: impl Into<String>, wait_timeout: Duration) -> Self {
        Self {
            queue,
            identity: identity.into(),
            wait_timeout,
            buffer: 64,
            accounting: Accounting::default(),
        }
    }

    pub fn with_accounting(mut self, accounting: Accounting) -> Self {
        self.accounting = accounting;
        self
    }

    /// Chunks the queue may deliver ahead of the listener.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    fn timed_out(&self) -> Error {
        Error::queue(format!(
            "queue '{}' did not answer within {}ms",
            self.identity,
            self.wait_timeout.as_millis()
        ))
    }
}

#[async_trait]
impl Dispatcher for QueueDispatcher {
    fn mode(&self) -> DispatchMode {
        DispatchMode::Queued
    }

    async fn try_complete(&self, mut request: CompletionRequest, channel: &ChannelConfig) -> Result<CompletionResponse> {
        request.stream = false;
        let started = Instant::now();
        let outcome = async {
            let job = QueueJob::detach(&mut request, channel)?;
            tracing::debug!(job_id = %job.job_id, identity = %self.identity, "enqueueing blocking job");
            tokio::time::timeout(
                self.wait_timeout,
                self.queue.enqueue_blocking(job, &self.identity, self.wait_timeout),
            )
            .await
            .map_err(|_| self.timed_out())?
        }
        .await;
        if let Err(e) = &outcome {
            tracing::warn!(identity = %self.identity, error = %e, "queued call failed");
        }
        self.accounting.emit(completion_record(
            channel,
            DispatchMode::Queued,
            &request.model,
            &outcome,
            started,
            0,
        ));
        outcome
    }

    async fn stream(
        &self,
        mut request: CompletionRequest,
        channel: &ChannelConfig,
        listener: &mut dyn StreamListener,
    ) -> ForwardOutcome {
        request.stream = true;
        let started = Instant::now();
        let mut record = UsageRecord::new(channel.vendor, request.model.clone(), DispatchMode::Queued.as_str(), true);
        let (tx, rx) = mpsc::channel(self.buffer);

        let enqueued = async {
            let job = QueueJob::detach(&mut request, channel)?;
            tracing::debug!(job_id = %job.job_id, identity = %self.identity, "enqueueing streaming job");
            tokio::time::timeout(
                self.wait_timeout,
                self.queue.enqueue_streaming(job, &self.identity, self.wait_timeout, tx),
            )
            .await
            .map_err(|_| self.timed_out())?
        }
        .await;

        if let Err(e) = enqueued {
            let err = e.to_channel_error();
            tracing::warn!(identity = %self.identity, error = %e, "queued stream failed to start");
            listener.on_error(err.clone()).await;
            record.error = Some(err.clone());
            record.duration_ms = millis(started.elapsed());
            self.accounting.emit(record);
            return ForwardOutcome {
                error: Some(err),
                ..ForwardOutcome::default()
            };
        }

        let chunks: BoxStream<'static, StreamCompletionResponse> = Box::pin(stream::unfold(
            (rx, Relay::Open),
            |(mut rx, relay): (mpsc::Receiver<PipeResult<StreamCompletionResponse>>, Relay)| async move {
                if relay == Relay::Closed {
                    return None;
                }
                match rx.recv().await {
                    Some(Ok(chunk)) => {
                        let terminal = chunk.usage.is_some() || chunk.choices.iter().any(|c| c.finish_reason.is_some());
                        let next = if terminal || relay == Relay::Terminated {
                            Relay::Terminated
                        } else {
                            Relay::Open
                        };
                        Some((Ok(chunk), (rx, next)))
                    }
                    Some(Err(e)) => Some((Err(e), (rx, Relay::Closed))),
                    None if relay == Relay::Terminated => None,
                    None => Some((
                        Err(Error::Channel(ChannelError::new(
                            502,
                            ErrorKind::BadGateway.name(),
                            "queued stream ended before completion",
                        ))),
                        (rx, Relay::Closed),
                    )),
                }
            },
        ));
        let (tap, _logging) = self.accounting.tap(record, started);
        pipeline::forward(chunks, listener, Some(&tap)).await
    }
}
