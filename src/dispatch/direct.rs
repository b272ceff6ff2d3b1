//! Direct vendor calls over HTTP, with a per-vendor retry budget.
//!
//! The vendor body is compiled once per call and reused by every attempt.
//! Each attempt looks its transport up in the pool again.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::channel::ChannelConfig;
use crate::drivers::{DriverRegistry, VendorDriver};
use crate::pipeline::{self, ForwardOutcome, StreamListener};
use crate::telemetry::{millis, MetricsSink, UsageRecord};
use crate::tokens::PriceBook;
use crate::transport::{HttpReply, HttpRequest, StreamReply, TransportPool};
use crate::types::{CompletionRequest, CompletionResponse};
use crate::{Error, Result};

use super::policy::{Decision, RetryPolicy};
use super::{compile, completion_record, Accounting, DispatchMode, Dispatcher};

/// Calls the vendor over HTTP from this process.
pub struct DirectDispatcher {
    pool: Arc<TransportPool>,
    drivers: Arc<DriverRegistry>,
    accounting: Accounting,
}

impl DirectDispatcher {
    pub fn new(pool: Arc<TransportPool>, drivers: Arc<DriverRegistry>) -> Self {
        Self {
            pool,
            drivers,
            accounting: Accounting::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        let prices = self.accounting.prices.take();
        self.accounting = Accounting { metrics, prices };
        self
    }

    pub fn with_price_book(mut self, prices: Arc<PriceBook>) -> Self {
        self.accounting = self.accounting.with_price_book(prices);
        self
    }

    /// One attempt on whatever transport the pool currently holds.
    async fn attempt(&self, channel: &ChannelConfig, http: &HttpRequest) -> Result<HttpReply> {
        self.pool.transport(channel)?.send(http).await
    }

    async fn attempt_stream(&self, channel: &ChannelConfig, http: &HttpRequest) -> Result<StreamReply> {
        self.pool.transport(channel)?.open_stream(http).await
    }

    /// Send with retries. Returns the successful reply; `retries` counts the
    /// attempts after the first.
    async fn send(
        &self,
        driver: &dyn VendorDriver,
        channel: &ChannelConfig,
        http: &HttpRequest,
        policy: &RetryPolicy,
        retries: &mut u32,
    ) -> Result<HttpReply> {
        loop {
            let err = match self.attempt(channel, http).await {
                Ok(reply) if reply.is_success() => return Ok(reply),
                Ok(reply) => Error::Channel(driver.parse_error(reply.status, &reply.body)),
                Err(e) => e,
            };
            match policy.decide(&err, *retries) {
                Decision::Retry { delay } => {
                    *retries += 1;
                    tokio::time::sleep(delay).await;
                }
                Decision::Fail => return Err(err),
            }
        }
    }

    /// Open the stream with retries. Nothing has reached the listener yet, so
    /// every failure here is still retryable.
    async fn open(
        &self,
        driver: &dyn VendorDriver,
        channel: &ChannelConfig,
        http: &HttpRequest,
        policy: &RetryPolicy,
        retries: &mut u32,
    ) -> Result<StreamReply> {
        loop {
            let err = match self.attempt_stream(channel, http).await {
                Ok(reply) if reply.is_success() => return Ok(reply),
                Ok(reply) => {
                    let status = reply.status;
                    let body = reply.collect().await.unwrap_or_default();
                    Error::Channel(driver.parse_error(status, &body))
                }
                Err(e) => e,
            };
            match policy.decide(&err, *retries) {
                Decision::Retry { delay } => {
                    *retries += 1;
                    tokio::time::sleep(delay).await;
                }
                Decision::Fail => return Err(err),
            }
        }
    }

    async fn call(&self, request: &mut CompletionRequest, channel: &ChannelConfig, retries: &mut u32) -> Result<CompletionResponse> {
        let (driver, http) = compile(&self.drivers, request, channel)?;
        let policy = RetryPolicy::for_channel(channel);
        let reply = self.send(driver.as_ref(), channel, &http, &policy, retries).await?;
        driver.parse_response(&reply.body, &request.model)
    }
}

#[async_trait]
impl Dispatcher for DirectDispatcher {
    fn mode(&self) -> DispatchMode {
        DispatchMode::Direct
    }

    async fn try_complete(&self, mut request: CompletionRequest, channel: &ChannelConfig) -> Result<CompletionResponse> {
        request.stream = false;
        let started = Instant::now();
        let mut retries = 0;
        let outcome = self.call(&mut request, channel, &mut retries).await;
        match &outcome {
            Ok(_) => tracing::debug!(
                vendor = %channel.vendor,
                model = %request.model,
                duration_ms = millis(started.elapsed()),
                "vendor call completed"
            ),
            Err(e) => tracing::warn!(
                vendor = %channel.vendor,
                model = %request.model,
                http_status = e.to_channel_error().status,
                error = %e,
                "vendor call failed"
            ),
        }
        self.accounting.emit(completion_record(
            channel,
            DispatchMode::Direct,
            &request.model,
            &outcome,
            started,
            retries,
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
        let mut record = UsageRecord::new(channel.vendor, request.model.clone(), DispatchMode::Direct.as_str(), true);
        let mut retries = 0;

        let opened = async {
            let (driver, http) = compile(&self.drivers, &mut request, channel)?;
            let permit = self.pool.acquire_stream().await?;
            let policy = RetryPolicy::for_channel(channel);
            let reply = self.open(driver.as_ref(), channel, &http, &policy, &mut retries).await?;
            let chunks = pipeline::normalize(
                reply.body,
                driver.stream_decoder(),
                driver.stream_normalizer(&request.model),
            )
            .await?;
            Ok::<_, Error>((chunks, permit))
        }
        .await;
        record.retries = retries;

        let (chunks, _permit) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                let err = e.to_channel_error();
                tracing::warn!(
                    vendor = %channel.vendor,
                    model = %request.model,
                    http_status = err.status,
                    error = %e,
                    "vendor stream failed to open"
                );
                listener.on_error(err.clone()).await;
                record.error = Some(err.clone());
                record.duration_ms = millis(started.elapsed());
                self.accounting.emit(record);
                return ForwardOutcome {
                    error: Some(err),
                    ..ForwardOutcome::default()
                };
            }
        };

        let (tap, _logging) = self.accounting.tap(record, started);
        let outcome = pipeline::forward(chunks, listener, Some(&tap)).await;
        tracing::debug!(
            vendor = %channel.vendor,
            model = %request.model,
            chunks = outcome.chunks,
            ttfc_ms = ?outcome.time_to_first_chunk.map(millis),
            failed = outcome.error.is_some(),
            "vendor stream finished"
        );
        outcome
    }
}
