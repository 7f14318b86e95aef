//! Endpoint configuration and runtime handle.
//!
//! An endpoint is one instance of a logical service. It is configured with
//! [`EndpointBuilder`], which binds every handler through the endpoint's
//! readiness gate and then locks the endpoint's topology registration.
//!
//! # Example
//!
//! ```ignore
//! let billing = Endpoint::builder(&transport, "billing", "billing-0")
//!     .with_command_handler::<ChargeCard, _>(ChargeCardHandler::new(gateway))
//!     .with_event_handler::<OrderPlaced, _>(handler_fn(|event, ctx| async move {
//!         ctx.send(ChargeCard { order_id: event.order_id })?;
//!         Ok(())
//!     }))
//!     .with_error_handler(DeadLetterLog)
//!     .build()?;
//!
//! transport.start().await?;
//! billing.start().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::context::IntegrationContext;
use crate::core::{Command, EndpointIdentity, Event, MessageType, Query, Reply};
use crate::envelope::IntegrationMessage;
use crate::error::SwitchyardError;
use crate::handler::{
    erase_handler, erase_query_handler, AnyHandler, ErrorHandler, MessageHandler, QueryHandler,
};
use crate::lifecycle::{EndpointInitializer, EndpointRuntime, EndpointState, StopOutcome};
use crate::transport::InMemoryTransport;

/// Runs a bound handler through its endpoint's lifecycle gate.
struct GatedHandler {
    inner: Arc<dyn AnyHandler>,
    runtime: Arc<EndpointRuntime>,
}

#[async_trait]
impl AnyHandler for GatedHandler {
    async fn handle_any(
        &self,
        message: &IntegrationMessage,
        ctx: IntegrationContext,
    ) -> Result<()> {
        let ctx = ctx.with_cancellation(self.runtime.cancellation_token().clone());
        self.runtime
            .invoke(|| self.inner.handle_any(message, ctx))
            .await?
    }
}

/// Collects the handlers of one endpoint instance.
pub struct EndpointBuilder {
    transport: InMemoryTransport,
    identity: EndpointIdentity,
    bindings: Vec<(MessageType, Arc<dyn AnyHandler>)>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    initializers: Vec<Arc<dyn EndpointInitializer>>,
}

impl EndpointBuilder {
    pub fn new(transport: &InMemoryTransport, identity: EndpointIdentity) -> Self {
        Self {
            transport: transport.clone(),
            identity,
            bindings: Vec::new(),
            error_handler: None,
            initializers: Vec::new(),
        }
    }

    /// Own command `C`.
    pub fn with_command_handler<C, H>(mut self, handler: H) -> Self
    where
        C: Command,
        H: MessageHandler<C>,
    {
        self.bindings
            .push((MessageType::command::<C>(), erase_handler::<C, H>(handler)));
        self
    }

    /// Subscribe to event `E`.
    pub fn with_event_handler<E, H>(mut self, handler: H) -> Self
    where
        E: Event,
        H: MessageHandler<E>,
    {
        self.bindings
            .push((MessageType::event::<E>(), erase_handler::<E, H>(handler)));
        self
    }

    /// Own query `Q`; the handler's return value is sent back as the reply.
    pub fn with_query_handler<Q, H>(mut self, handler: H) -> Self
    where
        Q: Query,
        H: QueryHandler<Q>,
    {
        self.bindings.push((
            MessageType::query::<Q>(),
            erase_query_handler::<Q, H>(handler),
        ));
        self
    }

    /// Receive replies of type `R` that no requester is waiting for.
    pub fn with_reply_handler<R, H>(mut self, handler: H) -> Self
    where
        R: Reply,
        H: MessageHandler<R>,
    {
        self.bindings
            .push((MessageType::reply::<R>(), erase_handler::<R, H>(handler)));
        self
    }

    /// Receive this endpoint's refused messages.
    pub fn with_error_handler<H: ErrorHandler>(mut self, handler: H) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Run `initializer` when the endpoint starts, before any delivery.
    pub fn with_initializer<I: EndpointInitializer>(mut self, initializer: I) -> Self {
        self.initializers.push(Arc::new(initializer));
        self
    }

    /// Bind everything and lock the endpoint's topology registration.
    pub fn build(self) -> Result<Endpoint, SwitchyardError> {
        let runtime = Arc::new(EndpointRuntime::with_parent(
            self.identity.clone(),
            self.initializers,
            self.transport.cancellation_token(),
        ));

        for (message_type, handler) in self.bindings {
            let gated = Arc::new(GatedHandler {
                inner: handler,
                runtime: Arc::clone(&runtime),
            });
            self.transport.bind(message_type, &self.identity, gated)?;
        }
        if let Some(handler) = self.error_handler {
            self.transport.bind_error_handler(&self.identity, handler)?;
        }
        self.transport.lock_topology_configuration(&self.identity);

        debug!(endpoint = %self.identity, "endpoint built");
        Ok(Endpoint {
            identity: self.identity,
            runtime,
            transport: self.transport,
        })
    }
}

/// Handle to a configured endpoint instance.
pub struct Endpoint {
    identity: EndpointIdentity,
    runtime: Arc<EndpointRuntime>,
    transport: InMemoryTransport,
}

impl Endpoint {
    /// Start configuring endpoint `logical/instance` on `transport`.
    pub fn builder(
        transport: &InMemoryTransport,
        logical: impl Into<String>,
        instance: impl Into<String>,
    ) -> EndpointBuilder {
        EndpointBuilder::new(transport, EndpointIdentity::new(logical, instance))
    }

    pub fn identity(&self) -> &EndpointIdentity {
        &self.identity
    }

    pub fn state(&self) -> EndpointState {
        self.runtime.state()
    }

    pub fn runtime(&self) -> &Arc<EndpointRuntime> {
        &self.runtime
    }

    /// Run initializers and open the endpoint for deliveries.
    pub async fn start(&self) -> Result<(), SwitchyardError> {
        self.runtime.start().await
    }

    /// Stop within the transport's shutdown timeout.
    pub async fn stop(&self) -> Result<StopOutcome, SwitchyardError> {
        self.stop_within(self.transport.config().shutdown_timeout)
            .await
    }

    /// Stop, waiting at most `deadline` for in-flight handlers.
    pub async fn stop_within(&self, deadline: Duration) -> Result<StopOutcome, SwitchyardError> {
        self.runtime.stop(deadline).await
    }

    /// Producer context that sends on behalf of this endpoint.
    pub fn context(&self) -> IntegrationContext {
        self.transport
            .context()
            .with_origin(self.identity.clone())
            .with_cancellation(self.runtime.cancellation_token().clone())
    }
}
