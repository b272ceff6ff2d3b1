//! Retry decisions for direct vendor calls.

use std::time::Duration;

use crate::channel::{ChannelConfig, RetryBudget, Vendor};
use crate::Error;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    Retry { delay: Duration },
    Fail,
}

/// Retry decisions for one call against one channel.
///
/// - Only transport errors and retryable vendor statuses (429, 5xx) are retried.
/// - A stream is never retried once its first byte has been handed on; the
///   caller enforces that by only consulting the policy before then.
/// - The budget is per vendor, so long-running vendors can be set to zero.
#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    vendor: Vendor,
    budget: RetryBudget,
}

impl RetryPolicy {
    pub fn for_channel(channel: &ChannelConfig) -> Self {
        Self {
            vendor: channel.vendor,
            budget: channel.retry_budget(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.budget.max_retries
    }

    /// `attempt` is 0-based: the first failure is attempt 0.
    pub fn decide(&self, err: &Error, attempt: u32) -> Decision {
        if !err.retryable() {
            return Decision::Fail;
        }
        if attempt >= self.budget.max_retries {
            if self.budget.max_retries == 0 {
                tracing::debug!(vendor = %self.vendor, "retries disabled for vendor");
            }
            return Decision::Fail;
        }
        let delay = self.budget.backoff(attempt);
        tracing::warn!(
            vendor = %self.vendor,
            attempt = attempt + 1,
            max_retries = self.budget.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying vendor call"
        );
        Decision::Retry { delay }
    }
}
