//! The integration message envelope.
//!
//! An [`IntegrationMessage`] pairs a type-erased payload with its routing key
//! ([`MessageType`]) and a [`Headers`] bag. The payload is shared behind an
//! `Arc`, so cloning a message for fan-out or redelivery is cheap and every
//! attempt carries the very same payload value. Only the headers change
//! between attempts.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::{
    Command, ConversationId, Event, Message, MessageId, MessageKind, MessageType, Query, Reply,
};
use crate::headers::{Header, Headers};

/// Type-erased, serializable message payload.
///
/// This trait is automatically implemented for every [`Message`]. It lets the
/// envelope hold any payload while still supporting downcasts and
/// serialization through `erased_serde`.
pub trait Payload: Any + fmt::Debug + erased_serde::Serialize + Send + Sync {
    /// Downcast support.
    fn as_any(&self) -> &dyn Any;
}

impl<M: Message> Payload for M {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

// Enable serialization of a shared payload
impl serde::Serialize for dyn Payload {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        erased_serde::serialize(self, serializer)
    }
}

/// A message travelling through the transport.
#[derive(Debug, Clone)]
pub struct IntegrationMessage {
    id: MessageId,
    payload: Arc<dyn Payload>,
    message_type: MessageType,
    headers: Headers,
}

impl IntegrationMessage {
    fn new(payload: Arc<dyn Payload>, message_type: MessageType) -> Self {
        let id = MessageId::new();
        let mut headers = Headers::new();
        headers.set(Header::Id(id));
        headers.set(Header::ConversationId(ConversationId::new()));
        Self {
            id,
            payload,
            message_type,
            headers,
        }
    }

    /// Wrap a command.
    pub fn command<C: Command>(command: C) -> Self {
        Self::new(Arc::new(command), MessageType::command::<C>())
    }

    /// Wrap an event.
    pub fn event<E: Event>(event: E) -> Self {
        Self::new(Arc::new(event), MessageType::event::<E>())
    }

    /// Wrap a query.
    pub fn query<Q: Query>(query: Q) -> Self {
        Self::new(Arc::new(query), MessageType::query::<Q>())
    }

    /// Wrap a reply to the query with id `initiator`.
    pub fn reply<R: Reply>(reply: R, initiator: MessageId) -> Self {
        let mut message = Self::new(Arc::new(reply), MessageType::reply::<R>());
        message.headers.set(Header::InitiatorMessageId(initiator));
        message
    }

    /// Reassemble a message from decoded parts.
    ///
    /// The id is taken from the `Id` header; a fresh id is stamped when the
    /// header is missing.
    pub(crate) fn from_parts(
        payload: Arc<dyn Payload>,
        message_type: MessageType,
        mut headers: Headers,
    ) -> Self {
        let id = match headers.id() {
            Some(id) => id,
            None => {
                let id = MessageId::new();
                headers.set(Header::Id(id));
                id
            }
        };
        Self {
            id,
            payload,
            message_type,
            headers,
        }
    }

    /// Join an existing conversation.
    pub fn with_conversation(mut self, conversation_id: ConversationId) -> Self {
        self.headers.set(Header::ConversationId(conversation_id));
        self
    }

    /// Hold delivery back until `at`.
    pub fn deferred_until(mut self, at: DateTime<Utc>) -> Self {
        self.headers.set(Header::DeferredUntil(at));
        self
    }

    /// Hold delivery back for `delay` from now.
    pub fn deferred_for(self, delay: Duration) -> Self {
        let at = offset(Utc::now(), delay);
        self.deferred_until(at)
    }

    /// Attach an extra header.
    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.set(header);
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn kind(&self) -> MessageKind {
        self.message_type.kind()
    }

    /// The conversation this message belongs to.
    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.headers.conversation_id()
    }

    pub fn payload(&self) -> &dyn Payload {
        self.payload.as_ref()
    }

    pub(crate) fn shared_payload(&self) -> Arc<dyn Payload> {
        Arc::clone(&self.payload)
    }

    /// Try to downcast the payload to a concrete type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.payload.as_any().downcast_ref::<T>()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub(crate) fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Set a header, replacing any previous value under the same key.
    pub fn set_header(&mut self, header: Header) {
        self.headers.set(header);
    }

    /// Returns true if both values carry the same payload allocation.
    pub fn shares_payload_with(&self, other: &IntegrationMessage) -> bool {
        Arc::ptr_eq(&self.payload, &other.payload)
    }
}

/// `at + by`, saturating at the largest representable time.
pub(crate) fn offset(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
