//! Request/reply correlation.
//!
//! A requester enrolls a reply slot under its request's message id. The
//! first matching reply completes the slot; an expiry task completes it with
//! [`ReplyCancelled::TimedOut`] if no reply arrives in time, so a requester
//! never waits forever. Each entry is consumed exactly once, and whoever
//! consumes it aborts its expiry task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::core::MessageId;
use crate::envelope::IntegrationMessage;

/// Why a reply slot completed without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReplyCancelled {
    /// The deadline passed first.
    #[error("reply timed out")]
    TimedOut,
    /// The transport shut down.
    #[error("transport stopped")]
    TransportStopped,
}

/// Outcome delivered to a reply slot.
pub type ReplyOutcome = Result<IntegrationMessage, ReplyCancelled>;

/// Sending half of a reply slot.
pub type ReplySlot = oneshot::Sender<ReplyOutcome>;

struct PendingReply {
    slot: ReplySlot,
    deadline: Instant,
    generation: u64,
    expiry: AbortHandle,
}

/// Map of request id → pending reply slot.
///
/// Cheap to clone; clones share the same map.
#[derive(Clone, Default)]
pub struct CorrelationRegistry {
    pending: Arc<DashMap<MessageId, PendingReply>>,
    generation: Arc<AtomicU64>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enroll `slot` for `request_id` with a `timeout`.
    ///
    /// Returns false if the id already has a pending entry; the slot is
    /// dropped in that case. Must be called inside a tokio runtime.
    pub fn try_enroll(&self, request_id: MessageId, slot: ReplySlot, timeout: Duration) -> bool {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let Entry::Vacant(vacant) = self.pending.entry(request_id) else {
            return false;
        };

        // The vacant entry holds the shard lock, so the task cannot look
        // for the entry before it is inserted.
        let pending = Arc::clone(&self.pending);
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // Only expire the entry this task was spawned for
            if let Some((_, entry)) =
                pending.remove_if(&request_id, |_, entry| entry.generation == generation)
            {
                debug!(%request_id, ?timeout, "request timed out");
                let _ = entry.slot.send(Err(ReplyCancelled::TimedOut));
            }
        })
        .abort_handle();

        vacant.insert(PendingReply {
            slot,
            deadline: deadline_after(timeout),
            generation,
            expiry,
        });
        true
    }

    /// Complete the slot of `request_id` with `reply`.
    ///
    /// Returns false for unknown, already completed or expired entries.
    pub fn try_set_result(&self, request_id: MessageId, reply: IntegrationMessage) -> bool {
        let Some((_, entry)) = self.pending.remove(&request_id) else {
            return false;
        };
        entry.expiry.abort();
        if Instant::now() >= entry.deadline {
            let _ = entry.slot.send(Err(ReplyCancelled::TimedOut));
            return false;
        }
        if entry.slot.send(Ok(reply)).is_err() {
            debug!(%request_id, "requester gave up before the reply arrived");
        }
        true
    }

    /// Drop the entry for a request that could not be sent.
    pub fn abandon(&self, request_id: MessageId) -> bool {
        match self.pending.remove(&request_id) {
            Some((_, entry)) => {
                entry.expiry.abort();
                true
            }
            None => false,
        }
    }

    /// Complete every pending slot with [`ReplyCancelled::TransportStopped`].
    ///
    /// Returns how many slots were cancelled.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<MessageId> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                entry.expiry.abort();
                let _ = entry.slot.send(Err(ReplyCancelled::TransportStopped));
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Returns true if `request_id` awaits a reply.
    pub fn is_pending(&self, request_id: &MessageId) -> bool {
        self.pending.contains_key(request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}
