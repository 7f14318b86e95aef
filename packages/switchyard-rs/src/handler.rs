//! Handler traits and their type-erased wrappers.
//!
//! Handlers are written against concrete payload types. The topology stores
//! them behind [`AnyHandler`], which downcasts the envelope's payload and
//! calls the typed handler. There is no reflection on the dispatch path: the
//! downcast target is fixed when the handler is bound.
//!
//! # Key Properties
//!
//! - **Failures are values**: handlers return `anyhow::Result`, the retry
//!   policy decides what happens next
//! - **Queries answer themselves**: a [`QueryHandler`] returns the reply and
//!   the wrapper sends it back to the requester
//! - **Refusals are observed**: an [`ErrorHandler`] receives every message
//!   its endpoint gave up on

use std::future::Future;
use std::marker::PhantomData;

use anyhow::Result;
use async_trait::async_trait;

use crate::context::IntegrationContext;
use crate::core::{Message, Query};
use crate::envelope::IntegrationMessage;
use crate::error::SwitchyardError;

/// Handler for one message type (command, event or reply).
///
/// # Example
///
/// ```ignore
/// struct ShipOrderHandler;
///
/// #[async_trait]
/// impl MessageHandler<ShipOrder> for ShipOrderHandler {
///     async fn handle(&self, cmd: ShipOrder, ctx: IntegrationContext) -> Result<()> {
///         ctx.publish(OrderShipped { order_id: cmd.order_id })?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler<M: Message>: Send + Sync + 'static {
    /// Handle one delivery of `message`.
    async fn handle(&self, message: M, ctx: IntegrationContext) -> Result<()>;
}

/// Handler that answers a query with its reply type.
#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync + 'static {
    /// Produce the reply for `query`.
    async fn handle(&self, query: Q, ctx: IntegrationContext) -> Result<Q::Reply>;
}

/// Receives messages whose retry budget is spent.
///
/// The message carries a `RejectReason` header describing the last failure.
#[async_trait]
pub trait ErrorHandler: Send + Sync + 'static {
    /// Called once per refused message.
    async fn on_refused(&self, message: IntegrationMessage) -> Result<()>;
}

/// Message handler backed by an async closure. See [`handler_fn`].
pub struct FnHandler<F, M> {
    f: F,
    _phantom: PhantomData<fn(M)>,
}

/// Build a [`MessageHandler`] from an async closure.
///
/// ```ignore
/// let handler = handler_fn(|cmd: ShipOrder, _ctx| async move {
///     tracing::info!(order_id = cmd.order_id, "shipping");
///     Ok(())
/// });
/// ```
pub fn handler_fn<M, F, Fut>(f: F) -> FnHandler<F, M>
where
    M: Message,
    F: Fn(M, IntegrationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnHandler {
        f,
        _phantom: PhantomData,
    }
}

#[async_trait]
impl<M, F, Fut> MessageHandler<M> for FnHandler<F, M>
where
    M: Message,
    F: Fn(M, IntegrationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, message: M, ctx: IntegrationContext) -> Result<()> {
        (self.f)(message, ctx).await
    }
}

/// Query handler backed by an async closure. See [`query_handler_fn`].
pub struct FnQueryHandler<F, Q> {
    f: F,
    _phantom: PhantomData<fn(Q)>,
}

/// Build a [`QueryHandler`] from an async closure.
pub fn query_handler_fn<Q, F, Fut>(f: F) -> FnQueryHandler<F, Q>
where
    Q: Query,
    F: Fn(Q, IntegrationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Q::Reply>> + Send + 'static,
{
    FnQueryHandler {
        f,
        _phantom: PhantomData,
    }
}

#[async_trait]
impl<Q, F, Fut> QueryHandler<Q> for FnQueryHandler<F, Q>
where
    Q: Query,
    F: Fn(Q, IntegrationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Q::Reply>> + Send + 'static,
{
    async fn handle(&self, query: Q, ctx: IntegrationContext) -> Result<Q::Reply> {
        (self.f)(query, ctx).await
    }
}

/// Error handler backed by an async closure. See [`error_handler_fn`].
pub struct FnErrorHandler<F> {
    f: F,
}

/// Build an [`ErrorHandler`] from an async closure.
pub fn error_handler_fn<F, Fut>(f: F) -> FnErrorHandler<F>
where
    F: Fn(IntegrationMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnErrorHandler { f }
}

#[async_trait]
impl<F, Fut> ErrorHandler for FnErrorHandler<F>
where
    F: Fn(IntegrationMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn on_refused(&self, message: IntegrationMessage) -> Result<()> {
        (self.f)(message).await
    }
}

/// Type-erased handler as stored in the topology.
///
/// Built with [`erase_handler`] or [`erase_query_handler`]; transports only
/// ever see this trait.
#[async_trait]
pub trait AnyHandler: Send + Sync {
    /// Downcast the payload and run the typed handler.
    async fn handle_any(&self, message: &IntegrationMessage, ctx: IntegrationContext)
        -> Result<()>;
}

/// Wrapper to make typed message handlers implement [`AnyHandler`].
pub(crate) struct HandlerWrapper<H, M> {
    handler: H,
    _phantom: PhantomData<fn(M)>,
}

#[async_trait]
impl<H, M> AnyHandler for HandlerWrapper<H, M>
where
    H: MessageHandler<M>,
    M: Message,
{
    async fn handle_any(
        &self,
        message: &IntegrationMessage,
        ctx: IntegrationContext,
    ) -> Result<()> {
        let payload = downcast_payload::<M>(message)?;
        self.handler.handle(payload, ctx).await
    }
}

/// Wrapper that runs a query handler and sends its reply.
pub(crate) struct QueryHandlerWrapper<H, Q> {
    handler: H,
    _phantom: PhantomData<fn(Q)>,
}

#[async_trait]
impl<H, Q> AnyHandler for QueryHandlerWrapper<H, Q>
where
    H: QueryHandler<Q>,
    Q: Query,
{
    async fn handle_any(
        &self,
        message: &IntegrationMessage,
        ctx: IntegrationContext,
    ) -> Result<()> {
        let query = downcast_payload::<Q>(message)?;
        let reply = self.handler.handle(query, ctx.clone()).await?;
        ctx.reply(reply)?;
        Ok(())
    }
}

fn downcast_payload<M: Message>(message: &IntegrationMessage) -> Result<M, SwitchyardError> {
    message
        .downcast_ref::<M>()
        .cloned()
        .ok_or_else(|| SwitchyardError::PayloadTypeMismatch {
            expected: std::any::type_name::<M>(),
            actual: message.message_type().name(),
        })
}

/// Erase a typed message handler for binding.
pub fn erase_handler<M, H>(handler: H) -> std::sync::Arc<dyn AnyHandler>
where
    M: Message,
    H: MessageHandler<M>,
{
    std::sync::Arc::new(HandlerWrapper {
        handler,
        _phantom: PhantomData::<fn(M)>,
    })
}

/// Erase a typed query handler for binding.
pub fn erase_query_handler<Q, H>(handler: H) -> std::sync::Arc<dyn AnyHandler>
where
    Q: Query,
    H: QueryHandler<Q>,
{
    std::sync::Arc::new(QueryHandlerWrapper {
        handler,
        _phantom: PhantomData::<fn(Q)>,
    })
}
