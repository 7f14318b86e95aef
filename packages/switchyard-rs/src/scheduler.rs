//! Immediate and deferred delivery queues.
//!
//! Messages without a future `DeferredUntil` go straight to a FIFO channel.
//! Deferred messages wait in a min-heap ordered by due time, ties broken by
//! insertion order. A pump promotes matured entries into the FIFO channel.
//! It sleeps until the earliest due time, or until an earlier entry is
//! pushed and wakes it.
//!
//! Heap access is a short synchronous critical section that never spans an
//! `.await`, so cancelling the pump between operations is always safe.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::envelope::IntegrationMessage;
use crate::error::SwitchyardError;
use crate::headers::Header;

type ImmediateReceiver = mpsc::UnboundedReceiver<IntegrationMessage>;

/// Where an enqueued message was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Ready for dispatch now.
    Immediate,
    /// Held back until `due_at`.
    Deferred {
        /// When the message matures.
        due_at: DateTime<Utc>,
    },
}

struct DeferredEntry {
    due_at: DateTime<Utc>,
    sequence: u64,
    message: IntegrationMessage,
}

impl PartialEq for DeferredEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due_at == other.due_at && self.sequence == other.sequence
    }
}

impl Eq for DeferredEntry {}

impl PartialOrd for DeferredEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeferredEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max heap; reverse so the earliest entry is on top
        match other.due_at.cmp(&self.due_at) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ordering => ordering,
        }
    }
}

/// Two-queue delivery scheduler.
pub struct DeliveryScheduler {
    immediate_tx: mpsc::UnboundedSender<IntegrationMessage>,
    immediate_rx: Mutex<Option<ImmediateReceiver>>,
    deferred: Mutex<BinaryHeap<DeferredEntry>>,
    sequence: AtomicU64,
    wake: Notify,
}

impl Default for DeliveryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryScheduler {
    pub fn new() -> Self {
        let (immediate_tx, immediate_rx) = mpsc::unbounded_channel();
        Self {
            immediate_tx,
            immediate_rx: Mutex::new(Some(immediate_rx)),
            deferred: Mutex::new(BinaryHeap::new()),
            sequence: AtomicU64::new(0),
            wake: Notify::new(),
        }
    }

    /// Place `message` on the immediate or the deferred queue.
    ///
    /// A message is deferred iff its `DeferredUntil` header lies in the
    /// future. Immediate messages are stamped with `ActualDeliveryDate`.
    pub fn enqueue(&self, message: IntegrationMessage) -> Result<Placement, SwitchyardError> {
        let now = Utc::now();
        if let Some(due_at) = message.headers().deferred_until() {
            if due_at > now {
                let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
                let message_id = message.id();
                let earliest = {
                    let mut heap = self.lock_deferred();
                    let earliest = heap.peek().map_or(true, |top| due_at < top.due_at);
                    heap.push(DeferredEntry {
                        due_at,
                        sequence,
                        message,
                    });
                    earliest
                };
                if earliest {
                    self.wake.notify_one();
                }
                trace!(%message_id, %due_at, "message deferred");
                return Ok(Placement::Deferred { due_at });
            }
        }

        self.push_immediate(message, now)?;
        Ok(Placement::Immediate)
    }

    /// Number of messages waiting in the deferred queue.
    pub fn deferred_len(&self) -> usize {
        self.lock_deferred().len()
    }

    /// Returns true while a `run` call owns the immediate queue.
    pub fn is_running(&self) -> bool {
        self.immediate_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Drain both queues, handing every due message to `deliver`, until
    /// `cancel` fires.
    ///
    /// Messages still queued at cancellation stay queued; the scheduler can
    /// be run again afterwards.
    pub async fn run<F, Fut>(
        &self,
        deliver: F,
        cancel: CancellationToken,
    ) -> Result<(), SwitchyardError>
    where
        F: Fn(IntegrationMessage) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut lease = ReceiverLease::take(&self.immediate_rx)
            .ok_or(SwitchyardError::SchedulerAlreadyRunning)?;

        debug!("delivery scheduler running");
        tokio::join!(
            self.pump(&cancel),
            consume(&mut lease.receiver, &deliver, &cancel)
        );
        debug!(deferred = self.deferred_len(), "delivery scheduler stopped");
        Ok(())
    }

    async fn pump(&self, cancel: &CancellationToken) {
        loop {
            let wait = self
                .promote_matured()
                .map(|due_at| (due_at - Utc::now()).to_std().unwrap_or(Duration::ZERO));

            match wait {
                Some(wait) => tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(wait) => {}
                },
                None => tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = self.wake.notified() => {}
                },
            }
        }
    }

    /// Move every matured entry to the immediate queue and return the due
    /// time of the next pending one.
    fn promote_matured(&self) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        let mut heap = self.lock_deferred();
        while let Some(top) = heap.peek() {
            if top.due_at > now {
                return Some(top.due_at);
            }
            if let Some(entry) = heap.pop() {
                let message_id = entry.message.id();
                if let Err(e) = self.push_immediate(entry.message, now) {
                    warn!(%message_id, error = %e, "dropping matured message");
                }
            }
        }
        None
    }

    fn push_immediate(
        &self,
        mut message: IntegrationMessage,
        now: DateTime<Utc>,
    ) -> Result<(), SwitchyardError> {
        message.set_header(Header::ActualDeliveryDate(now));
        self.immediate_tx
            .send(message)
            .map_err(|_| SwitchyardError::TransportStopped)
    }

    fn lock_deferred(&self) -> MutexGuard<'_, BinaryHeap<DeferredEntry>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn consume<F, Fut>(
    receiver: &mut Option<ImmediateReceiver>,
    deliver: &F,
    cancel: &CancellationToken,
) where
    F: Fn(IntegrationMessage) -> Fut,
    Fut: Future<Output = ()>,
{
    let Some(receiver) = receiver.as_mut() else {
        return;
    };
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = receiver.recv() => match next {
                Some(message) => deliver(message).await,
                None => return,
            },
        }
    }
}

/// Exclusive use of the immediate receiver for one `run`; handed back on drop.
struct ReceiverLease<'a> {
    slot: &'a Mutex<Option<ImmediateReceiver>>,
    receiver: Option<ImmediateReceiver>,
}

impl<'a> ReceiverLease<'a> {
    fn take(slot: &'a Mutex<Option<ImmediateReceiver>>) -> Option<Self> {
        let receiver = slot.lock().unwrap_or_else(PoisonError::into_inner).take()?;
        Some(Self {
            slot,
            receiver: Some(receiver),
        })
    }
}

impl Drop for ReceiverLease<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = self.receiver.take();
    }
}
