//! The in-memory transport.
//!
//! An [`InMemoryTransport`] owns one complete, isolated delivery pipeline:
//! topology, scheduler, correlation registry, dispatcher. Nothing is global,
//! so any number of transports can live in one process.
//!
//! # Lifecycle
//!
//! ```text
//! Initializing ──start──► Running ──stop──► Stopped
//! ```
//!
//! - Messages may be enqueued while initializing; they are delivered once
//!   the transport starts.
//! - `start` verifies the topology before the first delivery.
//! - `stop` rejects new messages, stops the pump, waits for in-flight
//!   deliveries up to the shutdown timeout, then cancels pending requests.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::TransportConfig;
use crate::context::IntegrationContext;
use crate::core::{EndpointIdentity, MessageType};
use crate::dispatcher::Dispatcher;
use crate::envelope::IntegrationMessage;
use crate::error::SwitchyardError;
use crate::handler::{AnyHandler, ErrorHandler};
use crate::lifecycle::StopOutcome;
use crate::rpc::CorrelationRegistry;
use crate::scheduler::{DeliveryScheduler, Placement};
use crate::selector::{InstanceSelector, RoundRobinSelector};
use crate::topology::Topology;

/// Transport lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Initializing,
    Running,
    Stopped,
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportStatus::Initializing => "initializing",
            TransportStatus::Running => "running",
            TransportStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// State shared by the transport, its dispatcher and every context.
pub(crate) struct TransportCore {
    pub(crate) topology: Topology,
    pub(crate) scheduler: DeliveryScheduler,
    pub(crate) rpc: CorrelationRegistry,
    pub(crate) config: TransportConfig,
    accepting: AtomicBool,
}

impl TransportCore {
    fn new(config: TransportConfig) -> Self {
        Self {
            topology: Topology::new(),
            scheduler: DeliveryScheduler::new(),
            rpc: CorrelationRegistry::new(),
            config,
            accepting: AtomicBool::new(true),
        }
    }

    /// Validate routing and hand `message` to the scheduler.
    pub(crate) fn enqueue(
        &self,
        message: IntegrationMessage,
        cancel: &CancellationToken,
    ) -> Result<Placement, SwitchyardError> {
        if cancel.is_cancelled() {
            return Err(SwitchyardError::Cancelled);
        }
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SwitchyardError::TransportStopped);
        }
        // Routing faults surface to the producer, not the dispatch loop
        self.topology.resolve(&message.message_type())?;
        self.scheduler.enqueue(message)
    }
}

struct TransportInner {
    core: Arc<TransportCore>,
    dispatcher: Arc<Dispatcher>,
    status: watch::Sender<TransportStatus>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    deliveries: Arc<Semaphore>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Process-local transport. Cheap to clone; clones share one pipeline.
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<TransportInner>,
}

impl InMemoryTransport {
    /// Transport with round-robin instance selection.
    pub fn new(config: TransportConfig) -> Self {
        Self::with_selector(config, Arc::new(RoundRobinSelector::new()))
    }

    /// Transport with a custom instance selector.
    pub fn with_selector(config: TransportConfig, selector: Arc<dyn InstanceSelector>) -> Self {
        let deliveries = Arc::new(Semaphore::new(config.max_concurrent_deliveries.max(1)));
        let core = Arc::new(TransportCore::new(config));
        let cancel = CancellationToken::new();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&core),
            selector,
            cancel.child_token(),
        ));
        Self {
            inner: Arc::new(TransportInner {
                core,
                dispatcher,
                status: watch::Sender::new(TransportStatus::Initializing),
                cancel,
                tracker: TaskTracker::new(),
                deliveries,
                pump: Mutex::new(None),
            }),
        }
    }

    /// Transport configured from the environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::new(TransportConfig::from_env()?))
    }

    /// Cancelled when the transport stops.
    pub(crate) fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub(crate) fn core(&self) -> Arc<TransportCore> {
        Arc::clone(&self.inner.core)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.core.config
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.core.topology
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Bind `handler` on `endpoint` for `message_type`.
    pub fn bind(
        &self,
        message_type: MessageType,
        endpoint: &EndpointIdentity,
        handler: Arc<dyn AnyHandler>,
    ) -> Result<(), SwitchyardError> {
        self.inner.core.topology.bind(message_type, endpoint, handler)
    }

    /// Bind the handler for messages `endpoint` refuses.
    pub fn bind_error_handler(
        &self,
        endpoint: &EndpointIdentity,
        handler: Arc<dyn ErrorHandler>,
    ) -> Result<(), SwitchyardError> {
        self.inner.core.topology.bind_error_handler(endpoint, handler)
    }

    /// Freeze registration for `endpoint`.
    pub fn lock_topology_configuration(&self, endpoint: &EndpointIdentity) {
        self.inner.core.topology.lock_topology_configuration(endpoint)
    }

    /// Hand a message to the scheduler.
    ///
    /// Routing faults are returned synchronously; handler outcomes are never
    /// observed here.
    pub fn enqueue(
        &self,
        message: IntegrationMessage,
        cancel: &CancellationToken,
    ) -> Result<Placement, SwitchyardError> {
        self.inner.core.enqueue(message, cancel)
    }

    /// Producer context outside any endpoint.
    pub fn context(&self) -> IntegrationContext {
        IntegrationContext::new(self.core(), self.inner.cancel.child_token())
    }

    pub fn status(&self) -> TransportStatus {
        *self.inner.status.borrow()
    }

    /// Observe status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<TransportStatus> {
        self.inner.status.subscribe()
    }

    /// Wait until the transport reaches `status`.
    pub async fn wait_for_status(&self, status: TransportStatus) {
        let mut rx = self.subscribe_status();
        loop {
            if *rx.borrow_and_update() == status {
                return;
            }
            // The sender lives as long as `self`
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Verify the topology and begin delivering.
    pub async fn start(&self) -> Result<(), SwitchyardError> {
        match self.status() {
            TransportStatus::Initializing => {}
            TransportStatus::Running => return Err(SwitchyardError::TransportAlreadyStarted),
            TransportStatus::Stopped => return Err(SwitchyardError::TransportStopped),
        }
        self.inner.core.topology.verify()?;

        let mut pump = self.inner.pump.lock().unwrap_or_else(PoisonError::into_inner);
        if pump.is_some() {
            return Err(SwitchyardError::TransportAlreadyStarted);
        }

        let core = Arc::clone(&self.inner.core);
        let dispatcher = Arc::clone(&self.inner.dispatcher);
        let tracker = self.inner.tracker.clone();
        let deliveries = Arc::clone(&self.inner.deliveries);
        let cancel = self.inner.cancel.clone();

        *pump = Some(tokio::spawn(async move {
            let run_cancel = cancel.clone();
            let deliver = move |message: IntegrationMessage| {
                let dispatcher = Arc::clone(&dispatcher);
                let tracker = tracker.clone();
                let deliveries = Arc::clone(&deliveries);
                let cancel = cancel.clone();
                async move {
                    let message_id = message.id();
                    let permit = tokio::select! {
                        _ = cancel.cancelled() => None,
                        permit = deliveries.acquire_owned() => permit.ok(),
                    };
                    let Some(permit) = permit else {
                        debug!(%message_id, "transport stopping, delivery dropped");
                        return;
                    };
                    tracker.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = dispatcher.dispatch(message).await {
                            error!(error = %e, "dispatch failed");
                        }
                    });
                }
            };
            if let Err(e) = core.scheduler.run(deliver, run_cancel).await {
                error!(error = %e, "delivery scheduler failed");
            }
        }));
        drop(pump);

        self.inner.status.send_replace(TransportStatus::Running);
        info!(
            bound_types = self.inner.core.topology.len(),
            max_concurrent_deliveries = self.inner.core.config.max_concurrent_deliveries,
            "transport started"
        );
        Ok(())
    }

    /// Stop delivering and drain in-flight deliveries.
    ///
    /// Idempotent; a second call returns `Drained` immediately.
    pub async fn stop(&self) -> StopOutcome {
        if self.status() == TransportStatus::Stopped {
            return StopOutcome::Drained;
        }
        self.inner.core.accepting.store(false, Ordering::Release);
        self.inner.cancel.cancel();

        let pump = self
            .inner
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                error!(error = %e, "delivery pump task failed");
            }
        }

        self.inner.tracker.close();
        let deadline = self.inner.core.config.shutdown_timeout;
        let outcome = match tokio::time::timeout(deadline, self.inner.tracker.wait()).await {
            Ok(()) => StopOutcome::Drained,
            Err(_) => {
                warn!(
                    inflight = self.inner.tracker.len(),
                    ?deadline,
                    "shutdown timeout elapsed with deliveries in flight"
                );
                StopOutcome::DeadlineElapsed
            }
        };

        let cancelled = self.inner.core.rpc.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "pending requests cancelled");
        }
        self.inner.status.send_replace(TransportStatus::Stopped);
        info!(?outcome, "transport stopped");
        outcome
    }
}
