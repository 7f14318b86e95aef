//! Core traits and identifiers for switchyard integration messages.
//!
//! # Overview
//!
//! Every payload that crosses the transport is one of four kinds:
//! - [`Command`] = intent, owned by exactly one logical endpoint
//! - [`Event`] = fact, observed by zero or more logical endpoints
//! - [`Query`] = question, owned by exactly one logical endpoint, answered
//!   with a [`Reply`]
//! - [`Reply`] = answer, correlated back to the query that caused it
//!
//! The kind is chosen by the marker trait the payload implements and the
//! constructor used to wrap it. A type used under two kinds is rejected by
//! the topology when it is bound.
//!
//! # Identity
//!
//! Messages carry a [`MessageId`] (unique per logical delivery, stable across
//! retries) and a [`ConversationId`] that ties together every message of one
//! causal chain. Endpoints are addressed by an [`EndpointIdentity`].

use std::any::{Any, TypeId};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Base trait for every integration message payload.
///
/// **Note**: This trait is automatically implemented for any type that is
/// `Clone + Debug + Serialize + Send + Sync + 'static`. Pick the message
/// kind by implementing one of [`Command`], [`Event`], [`Query`] or [`Reply`].
pub trait Message: Any + Clone + fmt::Debug + Serialize + Send + Sync + 'static {}

impl<T> Message for T where T: Any + Clone + fmt::Debug + Serialize + Send + Sync + 'static {}

/// Intent: a request that exactly one logical endpoint must act on.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct PlaceOrder { order_id: Uuid }
///
/// impl Command for PlaceOrder {}
/// ```
pub trait Command: Message {}

/// Fact: something that happened, published to every subscribing group.
pub trait Event: Message {}

/// Question owned by one logical endpoint.
///
/// The associated [`Query::Reply`] type is what [`crate::IntegrationContext::request`]
/// resolves to.
pub trait Query: Message {
    /// The reply type produced by the owning handler.
    type Reply: Reply;
}

/// Answer to a [`Query`].
pub trait Reply: Message {}

/// Message kind, derived from the marker trait a payload is sent as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Exactly one logical owner.
    Command,
    /// Zero or more subscriber groups.
    Event,
    /// Exactly one logical owner, answered with a reply.
    Query,
    /// Correlated answer to a query.
    Reply,
}

impl MessageKind {
    /// Returns true if this kind must have exactly one logical owner.
    pub fn requires_owner(&self) -> bool {
        matches!(self, MessageKind::Command | MessageKind::Query)
    }

    /// Returns true if routing with no bound handlers is a legal no-op.
    pub fn tolerates_no_subscribers(&self) -> bool {
        !self.requires_owner()
    }

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Command => "command",
            MessageKind::Event => "event",
            MessageKind::Query => "query",
            MessageKind::Reply => "reply",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing key of a type-erased message: its concrete type plus its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    type_id: TypeId,
    name: &'static str,
    kind: MessageKind,
}

impl MessageType {
    fn of<M: Message>(kind: MessageKind) -> Self {
        Self {
            type_id: TypeId::of::<M>(),
            name: std::any::type_name::<M>(),
            kind,
        }
    }

    /// Message type of a command.
    pub fn command<C: Command>() -> Self {
        Self::of::<C>(MessageKind::Command)
    }

    /// Message type of an event.
    pub fn event<E: Event>() -> Self {
        Self::of::<E>(MessageKind::Event)
    }

    /// Message type of a query.
    pub fn query<Q: Query>() -> Self {
        Self::of::<Q>(MessageKind::Query)
    }

    /// Message type of a reply.
    pub fn reply<R: Reply>() -> Self {
        Self::of::<R>(MessageKind::Reply)
    }

    /// The payload's `TypeId`.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// The payload's fully qualified type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The message kind.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

/// Unique id of one message.
///
/// Retries reuse the same message value, so the id is stable across every
/// delivery attempt of one logical delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Create a new random message id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<MessageId> for Uuid {
    fn from(id: MessageId) -> Uuid {
        id.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlates every message of one causal chain.
///
/// A message sent from inside a handler inherits the conversation of the
/// message being handled; a message sent from outside any handler starts a
/// new conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(Uuid);

impl ConversationId {
    /// Create a new random conversation id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ConversationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of one physical endpoint instance.
///
/// Instances that share a `logical` name form a redundant, load-balanced
/// group; `instance` distinguishes the replicas.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointIdentity {
    logical: String,
    instance: String,
}

impl EndpointIdentity {
    /// Create an identity from its logical and instance names.
    pub fn new(logical: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            logical: logical.into(),
            instance: instance.into(),
        }
    }

    /// The logical (service) name.
    pub fn logical(&self) -> &str {
        &self.logical
    }

    /// The instance (replica) name.
    pub fn instance(&self) -> &str {
        &self.instance
    }
}

impl fmt::Display for EndpointIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.logical, self.instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize)]
    struct Ping;
    impl Command for Ping {}

    #[derive(Debug, Clone, Serialize)]
    struct Pinged;
    impl Event for Pinged {}

    #[derive(Debug, Clone, Serialize)]
    struct HowMany;
    impl Query for HowMany {
        type Reply = Count;
    }

    #[derive(Debug, Clone, Serialize)]
    struct Count(u32);
    impl Reply for Count {}

    #[test]
    fn test_message_type_carries_kind() {
        assert_eq!(MessageType::command::<Ping>().kind(), MessageKind::Command);
        assert_eq!(MessageType::event::<Pinged>().kind(), MessageKind::Event);
        assert_eq!(MessageType::query::<HowMany>().kind(), MessageKind::Query);
        assert_eq!(MessageType::reply::<Count>().kind(), MessageKind::Reply);
    }

    #[test]
    fn test_message_type_identity_is_type_id_and_kind() {
        assert_eq!(MessageType::command::<Ping>(), MessageType::command::<Ping>());
        assert_ne!(
            MessageType::command::<Ping>().type_id(),
            MessageType::event::<Pinged>().type_id()
        );
        assert!(MessageType::command::<Ping>().name().ends_with("Ping"));
    }

    #[test]
    fn test_kind_ownership_rules() {
        assert!(MessageKind::Command.requires_owner());
        assert!(MessageKind::Query.requires_owner());
        assert!(MessageKind::Event.tolerates_no_subscribers());
        assert!(MessageKind::Reply.tolerates_no_subscribers());
    }

    #[test]
    fn test_message_ids_are_unique() {
        assert_ne!(MessageId::new(), MessageId::new());
        assert_ne!(ConversationId::new(), ConversationId::new());
    }

    #[test]
    fn test_message_id_uuid_roundtrip() {
        let uuid = Uuid::new_v4();
        let id = MessageId::from(uuid);
        assert_eq!(Uuid::from(id), uuid);
        assert_eq!(id.to_string(), uuid.to_string());
    }

    #[test]
    fn test_endpoint_identity_display() {
        let id = EndpointIdentity::new("billing", "billing-0");
        assert_eq!(id.logical(), "billing");
        assert_eq!(id.instance(), "billing-0");
        assert_eq!(id.to_string(), "billing/billing-0");
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&MessageKind::Command).unwrap();
        assert_eq!(json, "\"command\"");
    }
}
