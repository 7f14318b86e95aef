//! Dispatch of one matured message to its handlers.
//!
//! # Dispatch steps
//!
//! 1. A reply carrying `InitiatorMessageId` is offered to the correlation
//!    registry first; a waiting requester consumes it.
//! 2. The topology resolves the logical groups; no subscribers is a no-op.
//! 3. A redelivery carrying `HandledBy` only goes back to that logical group.
//! 4. One instance per group is selected, stamped as `HandledBy`, and
//!    invoked. All groups run concurrently and are joined.
//! 5. Each failed target goes through the retry policy on its own.
//!
//! Handler failures and panics never escape `dispatch`; only routing faults
//! are returned.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::context::IntegrationContext;
use crate::core::{EndpointIdentity, MessageKind};
use crate::envelope::IntegrationMessage;
use crate::error::{extract_panic_message, SwitchyardError};
use crate::headers::Header;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::selector::InstanceSelector;
use crate::topology::{LogicalGroup, Route};
use crate::transport::TransportCore;

/// What happened to a dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A waiting requester received the reply.
    ReplyCorrelated,
    /// No group subscribes to the message.
    NoSubscribers,
    /// Handlers ran on `targets` instances, `failed` of which failed.
    Delivered { targets: usize, failed: usize },
}

/// Routes matured messages to handlers and applies the retry policy.
pub struct Dispatcher {
    core: Arc<TransportCore>,
    selector: Arc<dyn InstanceSelector>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub(crate) fn new(
        core: Arc<TransportCore>,
        selector: Arc<dyn InstanceSelector>,
        cancel: CancellationToken,
    ) -> Self {
        let retry = core.config.retry_policy();
        Self {
            core,
            selector,
            retry,
            cancel,
        }
    }

    /// Deliver `message` to every target group.
    pub async fn dispatch(
        &self,
        message: IntegrationMessage,
    ) -> Result<DispatchOutcome, SwitchyardError> {
        let span = info_span!(
            "dispatch",
            message_id = %message.id(),
            conversation_id = ?message.conversation_id(),
            message_type = message.message_type().name(),
            kind = %message.kind(),
            attempt = message.headers().retry_counter(),
        );
        self.dispatch_inner(message).instrument(span).await
    }

    async fn dispatch_inner(
        &self,
        message: IntegrationMessage,
    ) -> Result<DispatchOutcome, SwitchyardError> {
        if message.kind() == MessageKind::Reply {
            if let Some(request_id) = message.headers().initiator_message_id() {
                if self.core.rpc.try_set_result(request_id, message.clone()) {
                    debug!(%request_id, "reply correlated");
                    return Ok(DispatchOutcome::ReplyCorrelated);
                }
            }
        }

        let groups = match self.core.topology.resolve(&message.message_type())? {
            Route::Targets(groups) => groups,
            Route::NoSubscribers => {
                debug!("no subscribers");
                return Ok(DispatchOutcome::NoSubscribers);
            }
        };

        let pinned = message.headers().handled_by().map(|e| e.logical().to_string());
        let groups: Vec<LogicalGroup> = match &pinned {
            Some(logical) => groups
                .into_iter()
                .filter(|group| group.logical() == logical)
                .collect(),
            None => groups.into_iter().collect(),
        };
        if groups.is_empty() {
            warn!(pinned_group = ?pinned, "redelivery target group is no longer bound");
            return Ok(DispatchOutcome::Delivered {
                targets: 0,
                failed: 0,
            });
        }

        let mut deliveries = Vec::with_capacity(groups.len());
        for group in &groups {
            let instance = match self.selector.select(&message, group) {
                Ok(instance) => instance,
                Err(e) => {
                    error!(group = group.logical(), error = %e, "cannot select instance");
                    continue;
                }
            };
            let identity = instance.identity().clone();
            let handler = Arc::clone(instance.handler());

            let mut attempt = message.clone();
            attempt.set_header(Header::HandledBy(identity.clone()));
            let ctx = IntegrationContext::for_incoming(
                Arc::clone(&self.core),
                identity.clone(),
                attempt.clone(),
                self.cancel.child_token(),
            );

            deliveries.push(async move {
                let result = AssertUnwindSafe(handler.handle_any(&attempt, ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(anyhow::anyhow!(
                            "handler panicked: {}",
                            extract_panic_message(&panic)
                        ))
                    });
                (identity, attempt, result)
            });
        }

        let targets = deliveries.len();
        let mut failed = 0;
        for (identity, attempt, result) in join_all(deliveries).await {
            match result {
                Ok(()) => debug!(endpoint = %identity, "handled"),
                Err(error) => {
                    failed += 1;
                    self.handle_failure(identity, attempt, error).await;
                }
            }
        }

        Ok(DispatchOutcome::Delivered { targets, failed })
    }

    async fn handle_failure(
        &self,
        endpoint: EndpointIdentity,
        mut attempt: IntegrationMessage,
        error: anyhow::Error,
    ) {
        let failed_attempt = attempt.headers().retry_counter();
        match self.retry.apply(&mut attempt, &error, Utc::now()) {
            RetryDecision::Redeliver {
                attempt: next,
                due_at,
            } => {
                warn!(
                    endpoint = %endpoint,
                    attempt = failed_attempt,
                    next_attempt = next,
                    %due_at,
                    error = %format!("{error:#}"),
                    "handler failed, redelivery scheduled"
                );
                if let Err(e) = self.core.enqueue(attempt, &CancellationToken::new()) {
                    error!(endpoint = %endpoint, error = %e, "could not schedule redelivery");
                }
            }
            RetryDecision::Refuse => {
                error!(
                    endpoint = %endpoint,
                    attempt = failed_attempt,
                    error = ?error,
                    "retries exhausted, message refused"
                );
                match self.core.topology.error_handler(&endpoint) {
                    Some(handler) => {
                        let outcome = AssertUnwindSafe(handler.on_refused(attempt))
                            .catch_unwind()
                            .await;
                        match outcome {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                error!(endpoint = %endpoint, error = %e, "error handler failed")
                            }
                            Err(panic) => error!(
                                endpoint = %endpoint,
                                panic = %extract_panic_message(&panic),
                                "error handler panicked"
                            ),
                        }
                    }
                    None => error!(
                        endpoint = %endpoint,
                        message_id = %attempt.id(),
                        reject_reason = attempt.headers().reject_reason().unwrap_or_default(),
                        "no error handler bound, refused message dropped"
                    ),
                }
            }
        }
    }
}
