//! Small order-processing run over the in-memory transport.
//!
//! Configuration comes from `SWITCHYARD_*` environment variables (or a
//! `.env` file); logging honours `RUST_LOG`.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use switchyard::wire::PayloadRegistry;
use switchyard::{
    error_handler_fn, handler_fn, query_handler_fn, Command, Endpoint, Event,
    InMemoryTransport, IntegrationContext, IntegrationMessage, Query, Reply,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlaceOrder {
    order_id: u32,
    sku: String,
}
impl Command for PlaceOrder {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: u32,
    sku: String,
}
impl Event for OrderPlaced {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StockLevel {
    sku: String,
}
impl Query for StockLevel {
    type Reply = InStock;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InStock {
    sku: String,
    units: u32,
}
impl Reply for InStock {}

/// Orders with this id fail to ship on every attempt.
const CURSED_ORDER: u32 = 13;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,switchyard=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let transport = InMemoryTransport::from_env().context("Failed to load transport config")?;
    let retry_window: Duration = transport.config().retry_schedule.iter().sum();

    let orders = Endpoint::builder(&transport, "orders", "orders-0")
        .with_command_handler::<PlaceOrder, _>(handler_fn(
            |cmd: PlaceOrder, ctx: IntegrationContext| async move {
                tracing::info!(order_id = cmd.order_id, sku = %cmd.sku, "order accepted");
                ctx.publish(OrderPlaced {
                    order_id: cmd.order_id,
                    sku: cmd.sku,
                })?;
                Ok(())
            },
        ))
        .build()?;

    let billing = Endpoint::builder(&transport, "billing", "billing-0")
        .with_event_handler::<OrderPlaced, _>(handler_fn(|event: OrderPlaced, _ctx| async move {
            tracing::info!(order_id = event.order_id, "invoice issued");
            Ok(())
        }))
        .build()?;

    let shipping = Endpoint::builder(&transport, "shipping", "shipping-0")
        .with_event_handler::<OrderPlaced, _>(handler_fn(|event: OrderPlaced, _ctx| async move {
            if event.order_id == CURSED_ORDER {
                anyhow::bail!("no courier accepts order {}", event.order_id);
            }
            tracing::info!(order_id = event.order_id, "parcel dispatched");
            Ok(())
        }))
        .with_error_handler(error_handler_fn(|message: IntegrationMessage| async move {
            tracing::warn!(
                message_id = %message.id(),
                reason = message.headers().reject_reason().unwrap_or_default(),
                "parked for manual shipping"
            );
            Ok(())
        }))
        .build()?;

    let mut inventory = Vec::new();
    for n in 0..2 {
        let endpoint = Endpoint::builder(&transport, "inventory", format!("inventory-{n}"))
            .with_query_handler::<StockLevel, _>(query_handler_fn(
                move |query: StockLevel, _ctx| async move {
                    tracing::info!(instance = n, sku = %query.sku, "stock lookup");
                    Ok(InStock {
                        sku: query.sku,
                        units: 40 + n,
                    })
                },
            ))
            .build()?;
        inventory.push(endpoint);
    }

    transport.start().await?;
    for endpoint in [&orders, &billing, &shipping].into_iter().chain(inventory.iter()) {
        endpoint.start().await?;
    }

    let ctx = transport.context();
    for (order_id, sku) in [(1, "tea"), (CURSED_ORDER, "kettle")] {
        ctx.send(PlaceOrder {
            order_id,
            sku: sku.to_string(),
        })?;
    }
    ctx.send_after(
        PlaceOrder {
            order_id: 2,
            sku: "mug".to_string(),
        },
        Duration::from_millis(250),
    )?;

    for _ in 0..2 {
        let stock = ctx
            .request(StockLevel {
                sku: "tea".to_string(),
            })
            .await?;
        tracing::info!(sku = %stock.sku, units = stock.units, "stock level");
    }

    let mut registry = PayloadRegistry::new();
    registry.register_command::<PlaceOrder>("orders.place_order")?;
    let frame = registry.encode(&IntegrationMessage::command(PlaceOrder {
        order_id: 3,
        sku: "teapot".to_string(),
    }))?;
    tracing::info!(
        content_type = %frame.content_type,
        bytes = frame.body.len(),
        "wire frame encoded"
    );
    transport.enqueue(registry.decode(&frame)?, ctx.cancellation_token())?;

    // Let retries of the cursed order run out
    tokio::time::sleep(retry_window + Duration::from_millis(500)).await;

    for endpoint in [&orders, &billing, &shipping].into_iter().chain(inventory.iter()) {
        endpoint.stop().await?;
    }
    let outcome = transport.stop().await;
    tracing::info!(?outcome, "demo finished");
    Ok(())
}
