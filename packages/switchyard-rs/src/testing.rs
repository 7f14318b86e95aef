//! Testing utilities for switchyard endpoints and handlers.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! switchyard = { version = "0.1", features = ["testing"] }
//! ```
//!
//! ## Using `DeliveryLatch` for Fan-Out Tests
//!
//! ```ignore
//! use switchyard::testing::shared_latch;
//!
//! let latch = shared_latch();
//! let handler = handler_fn({
//!     let latch = latch.clone();
//!     move |_e: OrderPlaced, _ctx| {
//!         let latch = latch.clone();
//!         async move {
//!             latch.record();
//!             Ok(())
//!         }
//!     }
//! });
//!
//! ctx.publish(OrderPlaced { order_id })?;
//!
//! // Wait for all 3 subscriber groups (no sleep!)
//! latch.wait_for(3, Duration::from_secs(5)).await?;
//! ```
//!
//! ## Using `RecordingErrorHandler` for Dead-Letter Assertions
//!
//! ```ignore
//! use switchyard::testing::RecordingErrorHandler;
//!
//! let refused = RecordingErrorHandler::new();
//! transport.bind_error_handler(&identity, Arc::new(refused.clone()))?;
//!
//! // ... a handler exhausts its retries ...
//!
//! assert_eq!(refused.refused().len(), 1);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::error::Elapsed;

use crate::envelope::IntegrationMessage;
use crate::handler::ErrorHandler;

/// Counts deliveries and lets a test wait until enough have happened.
///
/// # Example
///
/// ```ignore
/// #[tokio::test]
/// async fn test_round_robin() {
///     let latch = shared_latch();
///
///     // bind handlers that call latch.record()
///
///     for n in 0..9 {
///         ctx.send(Reserve(n))?;
///     }
///
///     latch.wait_for(9, Duration::from_secs(5)).await.unwrap();
/// }
/// ```
#[derive(Debug, Default)]
pub struct DeliveryLatch {
    count: AtomicUsize,
    notify: Notify,
}

impl DeliveryLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one delivery and wake waiters.
    pub fn record(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    /// Deliveries recorded so far.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until at least `expected` deliveries have been recorded.
    ///
    /// Returns immediately if the count is already there.
    pub async fn wait_for(&self, expected: usize, within: Duration) -> Result<(), Elapsed> {
        tokio::time::timeout(within, async {
            loop {
                // Register for notification BEFORE checking count
                let notified = self.notify.notified();
                if self.count() >= expected {
                    return;
                }
                notified.await;
            }
        })
        .await
    }
}

/// Arc-wrapped [`DeliveryLatch`] for sharing across handler closures.
pub type SharedDeliveryLatch = Arc<DeliveryLatch>;

/// Create a shared delivery latch.
pub fn shared_latch() -> SharedDeliveryLatch {
    Arc::new(DeliveryLatch::new())
}

/// Error handler that records refused messages for test assertions.
///
/// Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct RecordingErrorHandler {
    refused: Arc<Mutex<Vec<IntegrationMessage>>>,
    latch: SharedDeliveryLatch,
}

impl RecordingErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages refused so far, oldest first.
    pub fn refused(&self) -> Vec<IntegrationMessage> {
        self.refused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until at least `expected` messages have been refused.
    pub async fn wait_for(&self, expected: usize, within: Duration) -> Result<(), Elapsed> {
        self.latch.wait_for(expected, within).await
    }
}

#[async_trait]
impl ErrorHandler for RecordingErrorHandler {
    async fn on_refused(&self, message: IntegrationMessage) -> Result<()> {
        self.refused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        self.latch.record();
        Ok(())
    }
}
