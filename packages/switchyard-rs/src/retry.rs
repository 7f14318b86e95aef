//! Retry and dead-letter policy for failed deliveries.
//!
//! A failed delivery with retry counter `n` is redelivered after
//! `schedule[n]` while `n < schedule.len()`, and refused afterwards. A
//! refused message is never redelivered; it goes to the endpoint's error
//! handler with a `RejectReason` header.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::envelope::{offset, IntegrationMessage};
use crate::headers::Header;

/// What to do with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Deliver again at `due_at` as attempt number `attempt`.
    Redeliver {
        /// New retry counter value.
        attempt: u32,
        /// Earliest redelivery time.
        due_at: DateTime<Utc>,
    },
    /// The retry budget is spent.
    Refuse,
}

/// Backoff schedule applied to failed deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    schedule: Vec<Duration>,
}

impl Default for RetryPolicy {
    /// Three retries: immediately, after one second, after two seconds.
    fn default() -> Self {
        Self::new(vec![
            Duration::ZERO,
            Duration::from_secs(1),
            Duration::from_secs(2),
        ])
    }
}

impl RetryPolicy {
    /// Policy retrying once per schedule entry.
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self { schedule }
    }

    /// Policy that refuses on the first failure.
    pub fn no_retries() -> Self {
        Self::new(Vec::new())
    }

    pub fn schedule(&self) -> &[Duration] {
        &self.schedule
    }

    /// Maximum number of redeliveries.
    pub fn max_retries(&self) -> u32 {
        u32::try_from(self.schedule.len()).unwrap_or(u32::MAX)
    }

    /// Decide the fate of a delivery that failed with `retry_counter`.
    pub fn decide(&self, retry_counter: u32, now: DateTime<Utc>) -> RetryDecision {
        match self.schedule.get(retry_counter as usize) {
            Some(delay) => RetryDecision::Redeliver {
                attempt: retry_counter.saturating_add(1),
                due_at: offset(now, *delay),
            },
            None => RetryDecision::Refuse,
        }
    }

    /// Decide and record the decision in `message`'s headers.
    ///
    /// Redelivery bumps `RetryCounter` and sets `DeferredUntil`; refusal sets
    /// `RejectReason` from the error chain.
    pub fn apply(
        &self,
        message: &mut IntegrationMessage,
        error: &anyhow::Error,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        let decision = self.decide(message.headers().retry_counter(), now);
        let headers = message.headers_mut();
        match decision {
            RetryDecision::Redeliver { attempt, due_at } => {
                headers.set(Header::RetryCounter(attempt));
                headers.set(Header::DeferredUntil(due_at));
            }
            RetryDecision::Refuse => {
                headers.set(Header::RejectReason(format!("{error:#}")));
            }
        }
        decision
    }
}
