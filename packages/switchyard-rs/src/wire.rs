//! JSON wire format for integration messages.
//!
//! A message travels as a [`WireFrame`]: content type, content encoding and
//! a body holding a JSON [`WireEnvelope`]:
//!
//! ```json
//! {
//!   "message_type": "orders.place_order",
//!   "kind": "command",
//!   "headers": [{ "type": "id", "value": "…" }, …],
//!   "body": { "order_id": 7 }
//! }
//! ```
//!
//! Payload types are registered under a stable wire name in a
//! [`PayloadRegistry`], which owns both directions of the mapping.
//! The content encoding is validated before anything else is read; an
//! encoding the codec does not support is a fatal decode fault.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Command, Event, Message, MessageKind, MessageType, Query, Reply};
use crate::envelope::{IntegrationMessage, Payload};
use crate::headers::Headers;

/// The only content type this codec produces and accepts.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("unsupported content type {0:?}")]
    UnsupportedContentType(String),

    #[error("unsupported content encoding {0:?}")]
    UnsupportedEncoding(String),

    #[error("malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("unknown message type {0:?}")]
    UnknownMessageType(String),

    #[error("{type_name} is not registered for the wire")]
    UnregisteredPayload { type_name: &'static str },

    #[error("wire name {0:?} is already registered")]
    AlreadyRegistered(&'static str),

    #[error("{wire_name} is registered as {registered} but arrived as {received}")]
    KindMismatch {
        wire_name: String,
        registered: MessageKind,
        received: MessageKind,
    },

    #[error("invalid {wire_name} payload: {source}")]
    InvalidPayload {
        wire_name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Content encoding of a frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentEncoding {
    /// Body bytes are the JSON document itself.
    #[default]
    Identity,
}

impl ContentEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentEncoding::Identity => "identity",
        }
    }
}

impl fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentEncoding {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Ok(ContentEncoding::Identity),
            other => Err(WireError::UnsupportedEncoding(other.to_string())),
        }
    }
}

/// JSON document describing one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub message_type: String,
    pub kind: MessageKind,
    pub headers: Headers,
    pub body: serde_json::Value,
}

/// Encoded message as handed to a byte transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub content_type: String,
    pub content_encoding: String,
    pub body: Vec<u8>,
}

type DecodeFn = Box<dyn Fn(serde_json::Value) -> Result<Arc<dyn Payload>, serde_json::Error> + Send + Sync>;

struct Registration {
    message_type: MessageType,
    decode: DecodeFn,
}

/// Maps payload types to wire names and back.
///
/// # Example
///
/// ```ignore
/// let mut registry = PayloadRegistry::new();
/// registry.register_command::<PlaceOrder>("orders.place_order")?;
/// registry.register_event::<OrderPlaced>("orders.order_placed")?;
///
/// let frame = registry.encode(&message)?;
/// let decoded = registry.decode(&frame)?;
/// ```
#[derive(Default)]
pub struct PayloadRegistry {
    by_name: HashMap<&'static str, Registration>,
    names: HashMap<TypeId, &'static str>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_command<C>(&mut self, wire_name: &'static str) -> Result<(), WireError>
    where
        C: Command + DeserializeOwned,
    {
        self.register::<C>(wire_name, MessageType::command::<C>())
    }

    pub fn register_event<E>(&mut self, wire_name: &'static str) -> Result<(), WireError>
    where
        E: Event + DeserializeOwned,
    {
        self.register::<E>(wire_name, MessageType::event::<E>())
    }

    pub fn register_query<Q>(&mut self, wire_name: &'static str) -> Result<(), WireError>
    where
        Q: Query + DeserializeOwned,
    {
        self.register::<Q>(wire_name, MessageType::query::<Q>())
    }

    pub fn register_reply<R>(&mut self, wire_name: &'static str) -> Result<(), WireError>
    where
        R: Reply + DeserializeOwned,
    {
        self.register::<R>(wire_name, MessageType::reply::<R>())
    }

    fn register<M>(&mut self, wire_name: &'static str, message_type: MessageType) -> Result<(), WireError>
    where
        M: Message + DeserializeOwned,
    {
        if self.by_name.contains_key(wire_name) || self.names.contains_key(&message_type.type_id()) {
            return Err(WireError::AlreadyRegistered(wire_name));
        }

        let decode: DecodeFn = Box::new(|body| {
            let payload: M = serde_json::from_value(body)?;
            Ok(Arc::new(payload) as Arc<dyn Payload>)
        });
        self.by_name.insert(
            wire_name,
            Registration {
                message_type,
                decode,
            },
        );
        self.names.insert(message_type.type_id(), wire_name);
        Ok(())
    }

    /// Check if a wire name is registered.
    pub fn is_registered(&self, wire_name: &str) -> bool {
        self.by_name.contains_key(wire_name)
    }

    /// Encode `message` as an identity-encoded JSON frame.
    pub fn encode(&self, message: &IntegrationMessage) -> Result<WireFrame, WireError> {
        let message_type = message.message_type();
        let wire_name = self
            .names
            .get(&message_type.type_id())
            .ok_or(WireError::UnregisteredPayload {
                type_name: message_type.name(),
            })?;

        let envelope = WireEnvelope {
            message_type: (*wire_name).to_string(),
            kind: message_type.kind(),
            headers: message.headers().clone(),
            body: serde_json::to_value(message.payload())?,
        };
        Ok(WireFrame {
            content_type: CONTENT_TYPE_JSON.to_string(),
            content_encoding: ContentEncoding::Identity.to_string(),
            body: serde_json::to_vec(&envelope)?,
        })
    }

    /// Decode a frame back into a message.
    pub fn decode(&self, frame: &WireFrame) -> Result<IntegrationMessage, WireError> {
        let ContentEncoding::Identity = frame.content_encoding.parse::<ContentEncoding>()?;
        if !frame
            .content_type
            .split(';')
            .next()
            .is_some_and(|media| media.trim().eq_ignore_ascii_case(CONTENT_TYPE_JSON))
        {
            return Err(WireError::UnsupportedContentType(frame.content_type.clone()));
        }

        let envelope: WireEnvelope = serde_json::from_slice(&frame.body)?;
        self.decode_envelope(envelope)
    }

    /// Decode an already parsed envelope.
    pub fn decode_envelope(&self, envelope: WireEnvelope) -> Result<IntegrationMessage, WireError> {
        let registration = self
            .by_name
            .get(envelope.message_type.as_str())
            .ok_or_else(|| WireError::UnknownMessageType(envelope.message_type.clone()))?;

        let registered = registration.message_type.kind();
        if registered != envelope.kind {
            return Err(WireError::KindMismatch {
                wire_name: envelope.message_type,
                registered,
                received: envelope.kind,
            });
        }

        let payload =
            (registration.decode)(envelope.body).map_err(|source| WireError::InvalidPayload {
                wire_name: envelope.message_type.clone(),
                source,
            })?;
        Ok(IntegrationMessage::from_parts(
            payload,
            registration.message_type,
            envelope.headers,
        ))
    }
}
