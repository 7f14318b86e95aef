//! Producer API used by handlers and by code outside any handler.
//!
//! An [`IntegrationContext`] stamps every outgoing message before handing it
//! to the transport:
//!
//! - `SentFrom` is the endpoint the context belongs to, if any
//! - the `ConversationId` and `TraceContext` of the message being handled
//!   are carried over, so a whole causal chain shares one conversation
//!
//! A context is cheap to clone; clones are interchangeable.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::{Command, ConversationId, EndpointIdentity, Event, MessageId, Query, Reply};
use crate::envelope::IntegrationMessage;
use crate::error::SwitchyardError;
use crate::headers::Header;
use crate::rpc::ReplyCancelled;
use crate::scheduler::Placement;
use crate::transport::TransportCore;

/// Handle for sending, publishing and requesting messages.
#[derive(Clone)]
pub struct IntegrationContext {
    core: Arc<TransportCore>,
    origin: Option<EndpointIdentity>,
    incoming: Option<IntegrationMessage>,
    cancel: CancellationToken,
}

impl IntegrationContext {
    pub(crate) fn new(core: Arc<TransportCore>, cancel: CancellationToken) -> Self {
        Self {
            core,
            origin: None,
            incoming: None,
            cancel,
        }
    }

    /// Context of a handler running on `handled_by` for `incoming`.
    pub(crate) fn for_incoming(
        core: Arc<TransportCore>,
        handled_by: EndpointIdentity,
        incoming: IntegrationMessage,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            core,
            origin: Some(handled_by),
            incoming: Some(incoming),
            cancel,
        }
    }

    /// Same context, sending on behalf of `origin`.
    pub(crate) fn with_origin(mut self, origin: EndpointIdentity) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Same context, observing `cancel` instead.
    pub(crate) fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The endpoint this context sends from.
    pub fn origin(&self) -> Option<&EndpointIdentity> {
        self.origin.as_ref()
    }

    /// The message being handled, if any.
    pub fn incoming(&self) -> Option<&IntegrationMessage> {
        self.incoming.as_ref()
    }

    /// The conversation outgoing messages join, if any.
    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.incoming.as_ref().and_then(|m| m.conversation_id())
    }

    /// Cancelled when the owning endpoint or transport stops.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Send a command to its owner.
    pub fn send<C: Command>(&self, command: C) -> Result<MessageId, SwitchyardError> {
        self.enqueue(IntegrationMessage::command(command))
    }

    /// Send a command that is delivered no earlier than `at`.
    pub fn send_at<C: Command>(
        &self,
        command: C,
        at: DateTime<Utc>,
    ) -> Result<MessageId, SwitchyardError> {
        self.enqueue(IntegrationMessage::command(command).deferred_until(at))
    }

    /// Send a command that is delivered after `delay`.
    pub fn send_after<C: Command>(
        &self,
        command: C,
        delay: Duration,
    ) -> Result<MessageId, SwitchyardError> {
        self.enqueue(IntegrationMessage::command(command).deferred_for(delay))
    }

    /// Publish an event to every subscriber group.
    pub fn publish<E: Event>(&self, event: E) -> Result<MessageId, SwitchyardError> {
        self.enqueue(IntegrationMessage::event(event))
    }

    /// Publish an event that is delivered no earlier than `at`.
    pub fn publish_at<E: Event>(
        &self,
        event: E,
        at: DateTime<Utc>,
    ) -> Result<MessageId, SwitchyardError> {
        self.enqueue(IntegrationMessage::event(event).deferred_until(at))
    }

    /// Send a query without waiting; the reply is routed to reply handlers.
    pub fn send_query<Q: Query>(&self, query: Q) -> Result<MessageId, SwitchyardError> {
        self.enqueue(IntegrationMessage::query(query))
    }

    /// Send a query and wait for its reply, using the configured RPC timeout.
    pub async fn request<Q: Query>(&self, query: Q) -> Result<Q::Reply, SwitchyardError> {
        let timeout = self.core.config.rpc_timeout;
        self.request_with_timeout(query, timeout).await
    }

    /// Send a query and wait up to `timeout` for its reply.
    pub async fn request_with_timeout<Q: Query>(
        &self,
        query: Q,
        timeout: Duration,
    ) -> Result<Q::Reply, SwitchyardError> {
        let message = self.stamp(IntegrationMessage::query(query));
        let request_id = message.id();

        let (slot, reply) = oneshot::channel();
        if !self.core.rpc.try_enroll(request_id, slot, timeout) {
            return Err(SwitchyardError::DuplicateRequest { request_id });
        }
        if let Err(e) = self.core.enqueue(message, &self.cancel) {
            self.core.rpc.abandon(request_id);
            return Err(e);
        }
        debug!(%request_id, ?timeout, "awaiting reply");

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.core.rpc.abandon(request_id);
                return Err(SwitchyardError::RequestCancelled { request_id });
            }
            outcome = reply => outcome,
        };

        match outcome {
            Ok(Ok(reply)) => reply.downcast_ref::<Q::Reply>().cloned().ok_or(
                SwitchyardError::ReplyTypeMismatch {
                    request_id,
                    expected: std::any::type_name::<Q::Reply>(),
                },
            ),
            Ok(Err(ReplyCancelled::TimedOut)) => {
                Err(SwitchyardError::RequestTimedOut { request_id, timeout })
            }
            Ok(Err(ReplyCancelled::TransportStopped)) | Err(_) => {
                Err(SwitchyardError::RequestCancelled { request_id })
            }
        }
    }

    /// Reply to the query being handled.
    pub fn reply<R: Reply>(&self, reply: R) -> Result<MessageId, SwitchyardError> {
        let incoming = self
            .incoming
            .as_ref()
            .ok_or(SwitchyardError::NoIncomingMessage)?;
        self.enqueue(IntegrationMessage::reply(reply, incoming.id()))
    }

    /// Stamp and enqueue a prepared message.
    pub fn enqueue(&self, message: IntegrationMessage) -> Result<MessageId, SwitchyardError> {
        let message = self.stamp(message);
        let id = message.id();
        let placement = self.core.enqueue(message, &self.cancel)?;
        if let Placement::Deferred { due_at } = placement {
            debug!(message_id = %id, %due_at, "message scheduled");
        }
        Ok(id)
    }

    fn stamp(&self, mut message: IntegrationMessage) -> IntegrationMessage {
        if let Some(origin) = &self.origin {
            message.set_header(Header::SentFrom(origin.clone()));
        }
        if let Some(incoming) = &self.incoming {
            if let Some(conversation_id) = incoming.conversation_id() {
                message.set_header(Header::ConversationId(conversation_id));
            }
            if let Some(trace) = incoming.headers().trace_context() {
                message.set_header(Header::TraceContext(trace.clone()));
            }
        }
        message
    }
}
