//! 遥测模块：每次调用结束后生成用量与延迟记录，并交给外部指标收集方。
//!
//! # Usage Metrics
//!
//! After every call the dispatchers build one [`UsageRecord`] (token counts,
//! billed cost, time to first chunk, total latency, outcome) and hand it to a
//! [`MetricsSink`]. Shipping, formatting and storage belong to the sink's
//! owner; the core never blocks a caller on it.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`UsageRecord`] | One record per canonical call |
//! | [`MetricsSink`] | Destination trait |
//! | [`NoopMetricsSink`] | Default, drops everything |
//! | [`InMemoryMetricsSink`] | Bounded in-memory sink for tests and debugging |
//! | [`TracingMetricsSink`] | Emits each record as a structured `tracing` event |
//! | [`CompositeMetricsSink`] | Fans out to several sinks |

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::channel::Vendor;
use crate::error::ChannelError;
use crate::tokens::CostBreakdown;
use crate::types::{FinishReason, TokenUsage};
use crate::Result;

/// Usage and latency for one canonical call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub vendor: Vendor,
    pub model: String,
    /// `direct`, `queued` or `passthrough`.
    pub mode: String,
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostBreakdown>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_first_chunk_ms: Option<u64>,
    pub duration_ms: u64,
    pub chunks: usize,
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ChannelError>,
    /// Why `cost` is missing when usage is present (no price table, no
    /// matching range, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_error: Option<String>,
}

impl UsageRecord {
    pub fn new(vendor: Vendor, model: impl Into<String>, mode: impl Into<String>, stream: bool) -> Self {
        Self {
            request_id: String::new(),
            vendor,
            model: model.into(),
            mode: mode.into(),
            stream,
            usage: None,
            cost: None,
            finish_reason: None,
            time_to_first_chunk_ms: None,
            duration_ms: 0,
            chunks: 0,
            retries: 0,
            error: None,
            cost_error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn total_tokens(&self) -> u64 {
        self.usage.as_ref().map_or(0, |u| u.total_tokens)
    }
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Destination for usage records.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn report(&self, record: UsageRecord) -> Result<()>;

    async fn report_batch(&self, records: Vec<UsageRecord>) -> Result<()> {
        for r in records {
            self.report(r).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct NoopMetricsSink;

#[async_trait]
impl MetricsSink for NoopMetricsSink {
    async fn report(&self, _: UsageRecord) -> Result<()> {
        Ok(())
    }
}

pub fn noop_sink() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetricsSink)
}

/// Keeps the most recent `max_records` records.
pub struct InMemoryMetricsSink {
    records: Mutex<VecDeque<UsageRecord>>,
    max_records: usize,
    reported: Notify,
}

impl InMemoryMetricsSink {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            max_records: max_records.max(1),
            reported: Notify::new(),
        }
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Wait until at least `count` records are held or `timeout` passes.
    /// Records are reported from detached tasks, so tests need a way to wait.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.reported.notified();
            if self.len() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.len() >= count;
            }
        }
    }
}

impl Default for InMemoryMetricsSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl MetricsSink for InMemoryMetricsSink {
    async fn report(&self, record: UsageRecord) -> Result<()> {
        {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            records.push_back(record);
            while records.len() > self.max_records {
                records.pop_front();
            }
        }
        self.reported.notify_waiters();
        Ok(())
    }
}

/// One `tracing` event per record, under the `llm_gateway::usage` target.
#[derive(Debug, Default)]
pub struct TracingMetricsSink;

#[async_trait]
impl MetricsSink for TracingMetricsSink {
    async fn report(&self, r: UsageRecord) -> Result<()> {
        let (prompt, completion) = r
            .usage
            .as_ref()
            .map_or((0, 0), |u| (u.prompt_tokens, u.completion_tokens));
        let cost = r.cost.as_ref().map(|c| c.total.to_string());
        match &r.error {
            None => tracing::info!(
                target: "llm_gateway::usage",
                request_id = %r.request_id,
                vendor = %r.vendor,
                model = %r.model,
                mode = %r.mode,
                stream = r.stream,
                prompt_tokens = prompt,
                completion_tokens = completion,
                cost = cost.as_deref().unwrap_or("-"),
                ttfc_ms = ?r.time_to_first_chunk_ms,
                duration_ms = r.duration_ms,
                retries = r.retries,
                "call completed"
            ),
            Some(err) => tracing::warn!(
                target: "llm_gateway::usage",
                request_id = %r.request_id,
                vendor = %r.vendor,
                model = %r.model,
                mode = %r.mode,
                http_status = err.status,
                error_type = %err.error_type,
                duration_ms = r.duration_ms,
                retries = r.retries,
                "call failed"
            ),
        }
        Ok(())
    }
}

pub struct CompositeMetricsSink {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl CompositeMetricsSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn add_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl Default for CompositeMetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsSink for CompositeMetricsSink {
    async fn report(&self, record: UsageRecord) -> Result<()> {
        for s in &self.sinks {
            if let Err(e) = s.report(record.clone()).await {
                tracing::warn!(error = %e, "metrics sink rejected a record");
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        for s in &self.sinks {
            let _ = s.close().await;
        }
        Ok(())
    }
}
