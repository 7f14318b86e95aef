//! Endpoint runtime lifecycle: start/stop gating and in-flight tracking.
//!
//! Every handler invocation on an endpoint goes through
//! [`EndpointRuntime::invoke`]. Invocations wait behind a readiness gate
//! until the endpoint has started, and are counted while they run so that
//! `stop` can wait for them to drain.
//!
//! ```text
//! NotStarted ──start──► Running ──stop──► Stopping ──drained / deadline──► Stopped
//! ```
//!
//! `Stopped` is terminal.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::EndpointIdentity;
use crate::error::SwitchyardError;

/// Endpoint lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

impl EndpointState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointState::NotStarted => "not started",
            EndpointState::Running => "running",
            EndpointState::Stopping => "stopping",
            EndpointState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How `stop` finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Every in-flight invocation completed.
    Drained,
    /// The deadline elapsed with invocations still running.
    DeadlineElapsed,
}

/// Startup hook run before an endpoint accepts deliveries.
#[async_trait]
pub trait EndpointInitializer: Send + Sync + 'static {
    /// Name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Prepare the endpoint. An error aborts `start`.
    async fn initialize(&self, endpoint: &EndpointIdentity) -> anyhow::Result<()>;
}

/// Per-endpoint gate, in-flight counter and cancellation.
pub struct EndpointRuntime {
    identity: EndpointIdentity,
    state: watch::Sender<EndpointState>,
    ready: watch::Sender<bool>,
    inflight: AtomicUsize,
    drained: Notify,
    cancel: CancellationToken,
    initializers: Vec<Arc<dyn EndpointInitializer>>,
}

impl EndpointRuntime {
    pub fn new(identity: EndpointIdentity) -> Self {
        Self::with_initializers(identity, Vec::new())
    }

    /// Runtime whose `start` runs `initializers` in order.
    pub fn with_initializers(
        identity: EndpointIdentity,
        initializers: Vec<Arc<dyn EndpointInitializer>>,
    ) -> Self {
        Self::with_cancellation(identity, initializers, CancellationToken::new())
    }

    /// Runtime that is also cancelled whenever `parent` is.
    pub fn with_parent(
        identity: EndpointIdentity,
        initializers: Vec<Arc<dyn EndpointInitializer>>,
        parent: &CancellationToken,
    ) -> Self {
        Self::with_cancellation(identity, initializers, parent.child_token())
    }

    fn with_cancellation(
        identity: EndpointIdentity,
        initializers: Vec<Arc<dyn EndpointInitializer>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            identity,
            state: watch::Sender::new(EndpointState::NotStarted),
            ready: watch::Sender::new(false),
            inflight: AtomicUsize::new(0),
            drained: Notify::new(),
            cancel,
            initializers,
        }
    }

    pub fn identity(&self) -> &EndpointIdentity {
        &self.identity
    }

    pub fn state(&self) -> EndpointState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<EndpointState> {
        self.state.subscribe()
    }

    /// Returns true once the readiness gate is open.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Number of invocations currently running.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Cancelled when the endpoint stops, or when its parent token is.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run the initializers, then open the readiness gate.
    pub async fn start(&self) -> Result<(), SwitchyardError> {
        self.transition(EndpointState::NotStarted, EndpointState::Running, "start")?;

        for initializer in &self.initializers {
            debug!(endpoint = %self.identity, initializer = initializer.name(), "running initializer");
            if let Err(source) = initializer.initialize(&self.identity).await {
                warn!(
                    endpoint = %self.identity,
                    initializer = initializer.name(),
                    error = %source,
                    "initializer failed, endpoint stopped"
                );
                self.cancel.cancel();
                self.state.send_replace(EndpointState::Stopped);
                return Err(SwitchyardError::InitializerFailed {
                    endpoint: self.identity.to_string(),
                    name: initializer.name(),
                    source,
                });
            }
            if self.cancel.is_cancelled() {
                debug!(endpoint = %self.identity, "endpoint stopped during initialization");
                return Err(self.stopped_error());
            }
        }

        // Open the gate under the state lock so a concurrent stop either
        // sees it open and closes it, or keeps it shut.
        let mut opened = false;
        self.state.send_if_modified(|state| {
            if *state == EndpointState::Running && !self.cancel.is_cancelled() {
                self.ready.send_replace(true);
                opened = true;
            }
            false
        });
        if !opened {
            debug!(endpoint = %self.identity, "endpoint stopped before its gate opened");
            return Err(self.stopped_error());
        }
        info!(endpoint = %self.identity, "endpoint started");
        Ok(())
    }

    /// Run `f` once the endpoint is ready, counting it as in flight.
    ///
    /// Fails with [`SwitchyardError::EndpointStopped`] when the endpoint
    /// stops before the gate opens.
    pub async fn invoke<F, Fut, T>(&self, f: F) -> Result<T, SwitchyardError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        loop {
            if let Some(_guard) = self.try_enter() {
                return Ok(f().await);
            }
            self.wait_ready().await?;
        }
    }

    /// Count an invocation, then confirm the gate is still open.
    ///
    /// `stop` closes the gate before it reads the in-flight count, so an
    /// invocation admitted here is always waited for.
    fn try_enter(&self) -> Option<InflightGuard<'_>> {
        let guard = InflightGuard::new(self);
        let open = *self.ready.borrow() && !self.cancel.is_cancelled();
        open.then_some(guard)
    }

    async fn wait_ready(&self) -> Result<(), SwitchyardError> {
        let mut ready = self.ready.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return Err(self.stopped_error());
            }
            if *ready.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(self.stopped_error()),
                changed = ready.changed() => {
                    if changed.is_err() {
                        return Err(self.stopped_error());
                    }
                }
            }
        }
    }

    /// Close the gate, cancel the endpoint and wait up to `deadline` for
    /// in-flight invocations to finish.
    pub async fn stop(&self, deadline: Duration) -> Result<StopOutcome, SwitchyardError> {
        let previous = self.state.send_replace(EndpointState::Stopping);
        if matches!(previous, EndpointState::Stopping | EndpointState::Stopped) {
            self.state.send_replace(previous);
            return Err(SwitchyardError::InvalidEndpointState {
                endpoint: self.identity.to_string(),
                operation: "stop",
                state: previous.as_str(),
            });
        }

        self.ready.send_replace(false);
        self.cancel.cancel();

        let outcome = match tokio::time::timeout(deadline, self.wait_drained()).await {
            Ok(()) => StopOutcome::Drained,
            Err(_) => {
                warn!(
                    endpoint = %self.identity,
                    inflight = self.inflight(),
                    ?deadline,
                    "stop deadline elapsed before in-flight handlers finished"
                );
                StopOutcome::DeadlineElapsed
            }
        };

        self.state.send_replace(EndpointState::Stopped);
        info!(endpoint = %self.identity, ?outcome, "endpoint stopped");
        Ok(outcome)
    }

    async fn wait_drained(&self) {
        loop {
            // Register before checking so a concurrent drain is not missed
            let notified = self.drained.notified();
            if self.inflight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn transition(
        &self,
        from: EndpointState,
        to: EndpointState,
        operation: &'static str,
    ) -> Result<(), SwitchyardError> {
        let mut observed = from;
        let moved = self.state.send_if_modified(|state| {
            observed = *state;
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            Ok(())
        } else {
            Err(SwitchyardError::InvalidEndpointState {
                endpoint: self.identity.to_string(),
                operation,
                state: observed.as_str(),
            })
        }
    }

    fn stopped_error(&self) -> SwitchyardError {
        SwitchyardError::EndpointStopped {
            endpoint: self.identity.to_string(),
        }
    }
}

struct InflightGuard<'a> {
    runtime: &'a EndpointRuntime,
}

impl<'a> InflightGuard<'a> {
    fn new(runtime: &'a EndpointRuntime) -> Self {
        runtime.inflight.fetch_add(1, Ordering::AcqRel);
        Self { runtime }
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.runtime.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.runtime.drained.notify_waiters();
        }
    }
}
