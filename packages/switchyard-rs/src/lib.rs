//! # Switchyard
//!
//! An in-process message dispatch and delivery engine: typed routing of
//! commands, events, queries and replies between logical endpoints, with
//! deferred delivery, retries and request/reply over an asynchronous
//! transport.
//!
//! ## Core Concepts
//!
//! Every payload is sent as one of four kinds:
//! - [`Command`] = Intent, handled by exactly one logical endpoint (its owner)
//! - [`Event`] = Facts, handled by every subscribing logical endpoint
//! - [`Query`] = Request expecting a [`Reply`], owned like a command
//! - [`Reply`] = Answer correlated to the query that caused it
//!
//! A logical endpoint is a group of instances. Each delivery reaches one
//! instance per target group, chosen by an [`InstanceSelector`].
//!
//! ## Architecture
//!
//! ```text
//! IntegrationContext::send/publish/request
//!     │
//!     ▼ stamp headers, resolve route
//! DeliveryScheduler ─── DeferredUntil in the future? ──► deferred heap
//!     │                                                      │
//!     ▼ immediate queue ◄──────────── matured ───────────────┘
//! Dispatcher
//!     │
//!     ├─► reply? ──► CorrelationRegistry ──► waiting request()
//!     │
//!     ├─► Topology.resolve() ──► one instance per logical group
//!     │
//!     └─► handler.handle_any()
//!              │
//!              └─► failed? ──► RetryPolicy ──► redeliver │ ErrorHandler
//! ```
//!
//! ## Guarantees
//!
//! - **Volatile**: messages live in memory; nothing survives a stop
//! - **Never early**: a deferred message is not delivered before its due time
//! - **Isolated failures**: a failing or panicking handler only affects
//!   its own target; other groups still get the message
//! - **Bounded retries**: each failed target is redelivered per the retry
//!   schedule, then refused to its endpoint's [`ErrorHandler`]
//!
//! ## Example
//!
//! ```ignore
//! use switchyard::{handler_fn, query_handler_fn, Command, Endpoint, InMemoryTransport};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct PlaceOrder { order_id: u32 }
//! impl Command for PlaceOrder {}
//!
//! let transport = InMemoryTransport::from_env()?;
//!
//! let orders = Endpoint::builder(&transport, "orders", "orders-0")
//!     .with_command_handler::<PlaceOrder, _>(handler_fn(|cmd: PlaceOrder, ctx| async move {
//!         ctx.publish(OrderPlaced { order_id: cmd.order_id })?;
//!         Ok(())
//!     }))
//!     .build()?;
//!
//! transport.start().await?;
//! orders.start().await?;
//!
//! transport.context().send(PlaceOrder { order_id: 7 })?;
//! ```

// Core modules
mod config;
mod context;
mod core;
mod dispatcher;
mod endpoint;
mod envelope;
mod error;
mod handler;
mod lifecycle;
mod retry;
mod rpc;
mod scheduler;
mod selector;
mod topology;
mod transport;

// Header vocabulary
pub mod headers;

// JSON wire format for byte transports
pub mod wire;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export core traits and identifiers
pub use crate::core::{
    Command, ConversationId, EndpointIdentity, Event, Message, MessageId, MessageKind,
    MessageType, Query, Reply,
};

// Re-export message types
pub use envelope::{IntegrationMessage, Payload};
pub use headers::{Header, Headers};

// Re-export error types
pub use crate::error::SwitchyardError;

// Re-export configuration
pub use config::TransportConfig;

// Re-export handler types
pub use handler::{
    erase_handler, erase_query_handler, error_handler_fn, handler_fn, query_handler_fn,
    AnyHandler, ErrorHandler, FnErrorHandler, FnHandler, FnQueryHandler, MessageHandler,
    QueryHandler,
};

// Re-export routing types
pub use selector::{InstanceSelector, RoundRobinSelector};
pub use topology::{BoundInstance, LogicalGroup, Route, Topology};

// Re-export delivery types
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use retry::{RetryDecision, RetryPolicy};
pub use rpc::{CorrelationRegistry, ReplyCancelled, ReplyOutcome, ReplySlot};
pub use scheduler::{DeliveryScheduler, Placement};

// Re-export transport and endpoint types (primary entry points)
pub use context::IntegrationContext;
pub use endpoint::{Endpoint, EndpointBuilder};
pub use lifecycle::{EndpointInitializer, EndpointRuntime, EndpointState, StopOutcome};
pub use transport::{InMemoryTransport, TransportStatus};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
