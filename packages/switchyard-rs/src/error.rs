//! Structured error types for switchyard.
//!
//! `SwitchyardError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. Handler code still returns `anyhow::Result`; those
//! failures never cross into this enum. They are recovered by the retry
//! policy and, once the retry budget is spent, surface only to the bound
//! error handler as a `RejectReason` header.
//!
//! # The Error Boundary Rule
//!
//! > **Routing faults are returned, handler faults are retried.**
//!
//! - A routing fault (no owner, several owners, kind conflict) is a
//!   configuration defect and is returned synchronously to whoever tried to
//!   send the message.
//! - A handler fault never propagates to the producer or the dispatch loop.
//!
//! # Example
//!
//! ```ignore
//! use switchyard::SwitchyardError;
//!
//! match ctx.send(ShipOrder { order_id }) {
//!     Ok(id) => tracing::info!(%id, "order shipment requested"),
//!     Err(SwitchyardError::NoOwner { type_name }) => {
//!         eprintln!("nobody owns {type_name}");
//!     }
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::core::{MessageId, MessageKind};

/// Structured error type for switchyard operations.
///
/// Use this for pattern matching on specific error conditions. Errors
/// returned from handlers are plain `anyhow::Error` and never become a
/// `SwitchyardError`.
#[derive(Debug, Error)]
pub enum SwitchyardError {
    /// A command or query was sent but no logical endpoint owns its type.
    #[error("no owner bound for {type_name}")]
    NoOwner {
        /// The message type name.
        type_name: &'static str,
    },

    /// A command or query type is bound to more than one logical endpoint.
    #[error("{type_name} has {} owners ({}), expected exactly one", .owners.len(), .owners.join(", "))]
    MultipleOwners {
        /// The message type name.
        type_name: &'static str,
        /// Logical names of every bound owner.
        owners: Vec<String>,
    },

    /// A message type was used under two different message kinds.
    #[error("{type_name} is bound as {bound} but was used as {requested}")]
    ConflictingMessageKind {
        /// The message type name.
        type_name: &'static str,
        /// The kind the topology recorded first.
        bound: MessageKind,
        /// The kind of the rejected binding or message.
        requested: MessageKind,
    },

    /// The same endpoint instance bound two handlers for one message type.
    #[error("handler for {type_name} already bound on {endpoint}")]
    HandlerAlreadyBound {
        /// The message type name.
        type_name: &'static str,
        /// The endpoint identity (`logical/instance`).
        endpoint: String,
    },

    /// Registration was attempted after the endpoint locked its topology.
    #[error("topology configuration of {endpoint} is locked")]
    TopologyLocked {
        /// The endpoint identity (`logical/instance`).
        endpoint: String,
    },

    /// A logical group had no instances to select from.
    #[error("logical endpoint {logical_name} has no instances")]
    EmptyGroup {
        /// The logical endpoint name.
        logical_name: String,
    },

    /// A type-erased handler received a payload of the wrong type.
    #[error("handler expected {expected}, received {actual}")]
    PayloadTypeMismatch {
        /// The type the handler was bound for.
        expected: &'static str,
        /// The message type that arrived.
        actual: &'static str,
    },

    /// An RPC request with this id is already awaiting its reply.
    #[error("request {request_id} is already awaiting a reply")]
    DuplicateRequest {
        /// The request message id.
        request_id: MessageId,
    },

    /// No reply arrived before the RPC deadline.
    #[error("request {request_id} timed out after {timeout:?}")]
    RequestTimedOut {
        /// The request message id.
        request_id: MessageId,
        /// How long we waited.
        timeout: Duration,
    },

    /// The pending reply was cancelled before a reply or timeout.
    #[error("request {request_id} was cancelled")]
    RequestCancelled {
        /// The request message id.
        request_id: MessageId,
    },

    /// A reply arrived but its payload is not the query's reply type.
    #[error("reply to {request_id} is not a {expected}")]
    ReplyTypeMismatch {
        /// The request message id.
        request_id: MessageId,
        /// The expected reply type name.
        expected: &'static str,
    },

    /// `reply` was called on a context that is not handling a message.
    #[error("no incoming message to reply to")]
    NoIncomingMessage,

    /// The transport no longer accepts messages.
    #[error("transport is stopped")]
    TransportStopped,

    /// `start` was called on a transport that is already running.
    #[error("transport already started")]
    TransportAlreadyStarted,

    /// `run` was called while another run of the scheduler is active.
    #[error("delivery scheduler is already running")]
    SchedulerAlreadyRunning,

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// A lifecycle operation was attempted in the wrong endpoint state.
    #[error("endpoint {endpoint} cannot {operation} while {state}")]
    InvalidEndpointState {
        /// The endpoint identity (`logical/instance`).
        endpoint: String,
        /// What was attempted.
        operation: &'static str,
        /// The state the endpoint was in.
        state: &'static str,
    },

    /// The endpoint stopped before the handler could run.
    #[error("endpoint {endpoint} is stopped")]
    EndpointStopped {
        /// The endpoint identity (`logical/instance`).
        endpoint: String,
    },

    /// An endpoint initializer failed during start.
    #[error("initializer {name} failed on {endpoint}: {source:#}")]
    InitializerFailed {
        /// The endpoint identity (`logical/instance`).
        endpoint: String,
        /// The initializer name.
        name: &'static str,
        /// The underlying error.
        source: anyhow::Error,
    },
}

impl SwitchyardError {
    /// Returns true for configuration defects that must never be retried.
    pub fn is_routing_fault(&self) -> bool {
        matches!(
            self,
            SwitchyardError::NoOwner { .. }
                | SwitchyardError::MultipleOwners { .. }
                | SwitchyardError::ConflictingMessageKind { .. }
                | SwitchyardError::EmptyGroup { .. }
        )
    }

    /// Returns true when an RPC ended without a reply.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            SwitchyardError::RequestTimedOut { .. }
                | SwitchyardError::RequestCancelled { .. }
                | SwitchyardError::Cancelled
        )
    }
}

/// Extract a human-readable message from a panic payload.
pub(crate) fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
