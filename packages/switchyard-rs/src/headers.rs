//! Typed, extensible header bag carried by every integration message.
//!
//! Headers are keyed by name. Setting a header replaces any previous value
//! under the same key; there is no removal. Application-defined headers live
//! in their own namespace and can never shadow a well-known header. Each header renders a string
//! projection through `Display` for logs, and serializes as a tagged entry
//! for the wire format.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{ConversationId, EndpointIdentity, MessageId};

/// Well-known header keys.
pub mod keys {
    /// Message id.
    pub const ID: &str = "id";
    /// Conversation id.
    pub const CONVERSATION_ID: &str = "conversation-id";
    /// The request a reply answers.
    pub const INITIATOR_MESSAGE_ID: &str = "initiator-message-id";
    /// Delivery attempts so far.
    pub const RETRY_COUNTER: &str = "retry-counter";
    /// Earliest delivery time.
    pub const DEFERRED_UNTIL: &str = "deferred-until";
    /// When the message left the scheduler.
    pub const ACTUAL_DELIVERY_DATE: &str = "actual-delivery-date";
    /// Terminal failure cause.
    pub const REJECT_REASON: &str = "reject-reason";
    /// Producing endpoint.
    pub const SENT_FROM: &str = "sent-from";
    /// Consuming endpoint.
    pub const HANDLED_BY: &str = "handled-by";
    /// Transport-specific acknowledgement handle.
    pub const DELIVERY_TAG: &str = "delivery-tag";
    /// Propagated tracing attributes.
    pub const TRACE_CONTEXT: &str = "trace-context";
}

/// One typed header value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Header {
    /// The message id.
    Id(MessageId),
    /// Correlates all messages of one causal chain.
    ConversationId(ConversationId),
    /// The request message this reply answers.
    InitiatorMessageId(MessageId),
    /// Delivery attempts that failed so far (starts at 0).
    RetryCounter(u32),
    /// Earliest time the message may be delivered.
    DeferredUntil(DateTime<Utc>),
    /// Stamped when the message leaves the scheduler.
    ActualDeliveryDate(DateTime<Utc>),
    /// Why the message was refused.
    RejectReason(String),
    /// The endpoint that produced the message.
    SentFrom(EndpointIdentity),
    /// The endpoint instance selected to consume the message.
    HandledBy(EndpointIdentity),
    /// Transport-specific acknowledgement handle.
    DeliveryTag(u64),
    /// Propagated tracing attributes.
    TraceContext(BTreeMap<String, String>),
    /// Application-defined header.
    Custom {
        /// Header key.
        name: String,
        /// Header value.
        value: String,
    },
}

impl Header {
    /// The key this header is stored under.
    pub fn key(&self) -> &str {
        match self {
            Header::Id(_) => keys::ID,
            Header::ConversationId(_) => keys::CONVERSATION_ID,
            Header::InitiatorMessageId(_) => keys::INITIATOR_MESSAGE_ID,
            Header::RetryCounter(_) => keys::RETRY_COUNTER,
            Header::DeferredUntil(_) => keys::DEFERRED_UNTIL,
            Header::ActualDeliveryDate(_) => keys::ACTUAL_DELIVERY_DATE,
            Header::RejectReason(_) => keys::REJECT_REASON,
            Header::SentFrom(_) => keys::SENT_FROM,
            Header::HandledBy(_) => keys::HANDLED_BY,
            Header::DeliveryTag(_) => keys::DELIVERY_TAG,
            Header::TraceContext(_) => keys::TRACE_CONTEXT,
            Header::Custom { name, .. } => name,
        }
    }

    fn is_custom(&self) -> bool {
        matches!(self, Header::Custom { .. })
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Header::Id(id) | Header::InitiatorMessageId(id) => write!(f, "{id}"),
            Header::ConversationId(id) => write!(f, "{id}"),
            Header::RetryCounter(n) => write!(f, "{n}"),
            Header::DeferredUntil(at) | Header::ActualDeliveryDate(at) => {
                f.write_str(&at.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            Header::RejectReason(reason) => f.write_str(reason),
            Header::SentFrom(endpoint) | Header::HandledBy(endpoint) => write!(f, "{endpoint}"),
            Header::DeliveryTag(tag) => write!(f, "{tag}"),
            Header::TraceContext(attrs) => {
                let mut first = true;
                for (k, v) in attrs {
                    if !first {
                        f.write_str(";")?;
                    }
                    write!(f, "{k}={v}")?;
                    first = false;
                }
                Ok(())
            }
            Header::Custom { value, .. } => f.write_str(value),
        }
    }
}

/// Ordered header bag.
///
/// Serializes as a list of tagged header entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: BTreeMap<String, Header>,
    custom: BTreeMap<String, Header>,
}

impl Headers {
    /// Create an empty header bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any previous value under the same key.
    ///
    /// Returns the replaced header, if any.
    pub fn set(&mut self, header: Header) -> Option<Header> {
        let key = header.key().to_string();
        if header.is_custom() {
            self.custom.insert(key, header)
        } else {
            self.entries.insert(key, header)
        }
    }

    /// Look up a well-known header by key. See [`keys`].
    pub fn get(&self, key: &str) -> Option<&Header> {
        self.entries.get(key)
    }

    /// Returns true if a well-known header is stored under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Iterate well-known headers in key order, then custom headers.
    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.entries.values().chain(self.custom.values())
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.entries.len() + self.custom.len()
    }

    /// Returns true if no header is set.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.custom.is_empty()
    }

    pub fn id(&self) -> Option<MessageId> {
        match self.get(keys::ID) {
            Some(Header::Id(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self.get(keys::CONVERSATION_ID) {
            Some(Header::ConversationId(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn initiator_message_id(&self) -> Option<MessageId> {
        match self.get(keys::INITIATOR_MESSAGE_ID) {
            Some(Header::InitiatorMessageId(id)) => Some(*id),
            _ => None,
        }
    }

    /// Failed delivery attempts so far; 0 when the header is absent.
    pub fn retry_counter(&self) -> u32 {
        match self.get(keys::RETRY_COUNTER) {
            Some(Header::RetryCounter(n)) => *n,
            _ => 0,
        }
    }

    pub fn deferred_until(&self) -> Option<DateTime<Utc>> {
        match self.get(keys::DEFERRED_UNTIL) {
            Some(Header::DeferredUntil(at)) => Some(*at),
            _ => None,
        }
    }

    pub fn actual_delivery_date(&self) -> Option<DateTime<Utc>> {
        match self.get(keys::ACTUAL_DELIVERY_DATE) {
            Some(Header::ActualDeliveryDate(at)) => Some(*at),
            _ => None,
        }
    }

    pub fn reject_reason(&self) -> Option<&str> {
        match self.get(keys::REJECT_REASON) {
            Some(Header::RejectReason(reason)) => Some(reason),
            _ => None,
        }
    }

    pub fn sent_from(&self) -> Option<&EndpointIdentity> {
        match self.get(keys::SENT_FROM) {
            Some(Header::SentFrom(endpoint)) => Some(endpoint),
            _ => None,
        }
    }

    pub fn handled_by(&self) -> Option<&EndpointIdentity> {
        match self.get(keys::HANDLED_BY) {
            Some(Header::HandledBy(endpoint)) => Some(endpoint),
            _ => None,
        }
    }

    pub fn delivery_tag(&self) -> Option<u64> {
        match self.get(keys::DELIVERY_TAG) {
            Some(Header::DeliveryTag(tag)) => Some(*tag),
            _ => None,
        }
    }

    pub fn trace_context(&self) -> Option<&BTreeMap<String, String>> {
        match self.get(keys::TRACE_CONTEXT) {
            Some(Header::TraceContext(attrs)) => Some(attrs),
            _ => None,
        }
    }

    /// Value of an application-defined header.
    pub fn custom(&self, name: &str) -> Option<&str> {
        match self.custom.get(name) {
            Some(Header::Custom { value, .. }) => Some(value),
            _ => None,
        }
    }
}

impl FromIterator<Header> for Headers {
    fn from_iter<I: IntoIterator<Item = Header>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for header in iter {
            headers.set(header);
        }
        headers
    }
}

impl Serialize for Headers {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let entries = Vec::<Header>::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_set_replaces_by_key() {
        let mut headers = Headers::new();
        assert!(headers.set(Header::RetryCounter(1)).is_none());

        let replaced = headers.set(Header::RetryCounter(2));
        assert_eq!(replaced, Some(Header::RetryCounter(1)));
        assert_eq!(headers.retry_counter(), 2);
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_retry_counter_defaults_to_zero() {
        assert_eq!(Headers::new().retry_counter(), 0);
    }

    #[test]
    fn test_typed_accessors() {
        let id = MessageId::new();
        let endpoint = EndpointIdentity::new("orders", "orders-1");
        let mut headers = Headers::new();
        headers.set(Header::Id(id));
        headers.set(Header::HandledBy(endpoint.clone()));
        headers.set(Header::RejectReason("boom".into()));
        headers.set(Header::DeliveryTag(7));

        assert_eq!(headers.id(), Some(id));
        assert_eq!(headers.handled_by(), Some(&endpoint));
        assert_eq!(headers.reject_reason(), Some("boom"));
        assert_eq!(headers.delivery_tag(), Some(7));
        assert!(headers.sent_from().is_none());
        assert!(headers.deferred_until().is_none());
    }

    #[test]
    fn test_custom_headers_are_looked_up_by_name() {
        let mut headers = Headers::new();
        headers.set(Header::Custom {
            name: "tenant".into(),
            value: "acme".into(),
        });
        assert_eq!(headers.custom("tenant"), Some("acme"));
        assert!(!headers.contains("tenant"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_custom_header_cannot_shadow_well_known_key() {
        let id = MessageId::new();
        let mut headers = Headers::new();
        headers.set(Header::Id(id));
        headers.set(Header::RetryCounter(2));
        for name in [keys::ID, keys::RETRY_COUNTER, keys::DEFERRED_UNTIL] {
            headers.set(Header::Custom {
                name: name.into(),
                value: "spoofed".into(),
            });
        }

        assert_eq!(headers.id(), Some(id));
        assert_eq!(headers.retry_counter(), 2);
        assert!(headers.deferred_until().is_none());
        assert_eq!(headers.custom(keys::ID), Some("spoofed"));

        let back: Headers = serde_json::from_value(serde_json::to_value(&headers).unwrap()).unwrap();
        assert_eq!(back.id(), Some(id));
        assert_eq!(back.retry_counter(), 2);
        assert_eq!(back, headers);
    }

    #[test]
    fn test_string_projection() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(
            Header::DeferredUntil(at).to_string(),
            "2024-05-01T12:00:00.000Z"
        );
        assert_eq!(
            Header::SentFrom(EndpointIdentity::new("a", "a-0")).to_string(),
            "a/a-0"
        );

        let mut attrs = BTreeMap::new();
        attrs.insert("span".to_string(), "1".to_string());
        attrs.insert("trace".to_string(), "abc".to_string());
        assert_eq!(Header::TraceContext(attrs).to_string(), "span=1;trace=abc");
    }

    #[test]
    fn test_headers_serialize_as_tagged_entries() {
        let mut headers = Headers::new();
        headers.set(Header::RetryCounter(3));
        headers.set(Header::DeliveryTag(9));

        let json = serde_json::to_value(&headers).unwrap();
        let entries = json.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries
            .iter()
            .any(|e| e["type"] == "retry_counter" && e["value"] == 3));

        let back: Headers = serde_json::from_value(json).unwrap();
        assert_eq!(back, headers);
    }
}
