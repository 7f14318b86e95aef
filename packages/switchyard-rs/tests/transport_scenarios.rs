//! End-to-end delivery scenarios against the in-memory transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use switchyard::{
    error_handler_fn, handler_fn, query_handler_fn, Command, Endpoint, EndpointIdentity, Event,
    InMemoryTransport, IntegrationContext, IntegrationMessage, Message, MessageHandler, Query,
    Reply, StopOutcome, SwitchyardError, TransportConfig,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BookRoom {
    room: u32,
}
impl Command for BookRoom {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RoomBooked {
    room: u32,
}
impl Event for RoomBooked {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Vacancies;
impl Query for Vacancies {
    type Reply = VacancyCount;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct VacancyCount(u32);
impl Reply for VacancyCount {}

type Seen = Arc<Mutex<Vec<IntegrationMessage>>>;

fn config() -> TransportConfig {
    TransportConfig::default()
        .with_retry_schedule(vec![
            Duration::ZERO,
            Duration::from_millis(20),
            Duration::from_millis(40),
        ])
        .with_rpc_timeout(Duration::from_secs(2))
        .with_shutdown_timeout(Duration::from_secs(2))
}

/// Handler that records every incoming message, failing every attempt if `fail`.
fn recording<M: Message>(seen: &Seen, fail: bool) -> impl MessageHandler<M> {
    let seen = seen.clone();
    handler_fn(move |_m: M, ctx: IntegrationContext| {
        if let Some(incoming) = ctx.incoming() {
            seen.lock().unwrap().push(incoming.clone());
        }
        std::future::ready(if fail {
            Err(anyhow::anyhow!("room is flooded"))
        } else {
            Ok(())
        })
    })
}

async fn eventually(mut check: impl FnMut() -> bool, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

async fn started(transport: &InMemoryTransport, endpoints: &[&Endpoint]) {
    transport.start().await.unwrap();
    for endpoint in endpoints {
        endpoint.start().await.unwrap();
    }
}

#[tokio::test]
async fn command_is_delivered_once_to_its_owner() {
    let transport = InMemoryTransport::new(config());
    let seen: Seen = Arc::default();
    let hotel = Endpoint::builder(&transport, "hotel", "hotel-0")
        .with_command_handler::<BookRoom, _>(recording(&seen, false))
        .build()
        .unwrap();
    started(&transport, &[&hotel]).await;

    let before = Utc::now();
    let id = transport.context().send(BookRoom { room: 101 }).unwrap();
    let after = Utc::now();

    assert!(eventually(|| !seen.lock().unwrap().is_empty(), Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let delivered = &seen[0];
    assert_eq!(delivered.id(), id);
    assert_eq!(delivered.headers().retry_counter(), 0);
    // Immediate sends are stamped when they are enqueued
    let stamped = delivered.headers().actual_delivery_date().unwrap();
    assert!(
        before <= stamped && stamped <= after,
        "delivery date {stamped} outside [{before}, {after}]"
    );
    assert_eq!(
        delivered.headers().handled_by(),
        Some(&EndpointIdentity::new("hotel", "hotel-0"))
    );
    drop(seen);

    assert_eq!(transport.stop().await, StopOutcome::Drained);
}

#[tokio::test]
async fn command_without_owner_is_rejected_at_send() {
    let transport = InMemoryTransport::new(config());
    transport.start().await.unwrap();
    let err = transport.context().send(BookRoom { room: 1 }).unwrap_err();
    assert!(matches!(err, SwitchyardError::NoOwner { .. }));
    assert!(err.is_routing_fault());
    transport.stop().await;
}

#[tokio::test]
async fn event_reaches_every_group_and_tolerates_none() {
    let transport = InMemoryTransport::new(config());
    transport.start().await.unwrap();
    transport.context().publish(RoomBooked { room: 1 }).unwrap();
    transport.stop().await;

    let transport = InMemoryTransport::new(config());
    let housekeeping: Seen = Arc::default();
    let reception: Seen = Arc::default();
    let a = Endpoint::builder(&transport, "housekeeping", "hk-0")
        .with_event_handler::<RoomBooked, _>(recording(&housekeeping, false))
        .build()
        .unwrap();
    let b = Endpoint::builder(&transport, "reception", "rc-0")
        .with_event_handler::<RoomBooked, _>(recording(&reception, false))
        .build()
        .unwrap();
    started(&transport, &[&a, &b]).await;

    transport.context().publish(RoomBooked { room: 7 }).unwrap();
    assert!(
        eventually(
            || housekeeping.lock().unwrap().len() == 1 && reception.lock().unwrap().len() == 1,
            Duration::from_secs(2)
        )
        .await
    );
    transport.stop().await;
}

#[tokio::test]
async fn failing_handler_is_retried_then_refused_once() {
    let transport = InMemoryTransport::new(config());
    let seen: Seen = Arc::default();
    let refused: Seen = Arc::default();
    let hotel = {
        let refused = refused.clone();
        Endpoint::builder(&transport, "hotel", "hotel-0")
            .with_command_handler::<BookRoom, _>(recording(&seen, true))
            .with_error_handler(error_handler_fn(move |message: IntegrationMessage| {
                let refused = refused.clone();
                async move {
                    refused.lock().unwrap().push(message);
                    Ok(())
                }
            }))
            .build()
            .unwrap()
    };
    started(&transport, &[&hotel]).await;

    transport.context().send(BookRoom { room: 13 }).unwrap();
    assert!(eventually(|| !refused.lock().unwrap().is_empty(), Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let attempts: Vec<u32> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|m| m.headers().retry_counter())
        .collect();
    assert_eq!(attempts, vec![0, 1, 2, 3]);

    let refused = refused.lock().unwrap();
    assert_eq!(refused.len(), 1);
    assert_eq!(refused[0].headers().retry_counter(), 3);
    assert_eq!(refused[0].headers().reject_reason(), Some("room is flooded"));
    drop(refused);

    transport.stop().await;
}

#[tokio::test]
async fn request_gets_reply_and_times_out_without_one() {
    let transport = InMemoryTransport::new(config());
    let front_desk = Endpoint::builder(&transport, "front-desk", "fd-0")
        .with_query_handler::<Vacancies, _>(query_handler_fn(|_q: Vacancies, _ctx| async {
            Ok(VacancyCount(4))
        }))
        .build()
        .unwrap();
    started(&transport, &[&front_desk]).await;

    let ctx = transport.context();
    assert_eq!(ctx.request(Vacancies).await.unwrap(), VacancyCount(4));

    // A stopped endpoint never answers
    front_desk.stop().await.unwrap();
    let err = ctx
        .request_with_timeout(Vacancies, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, SwitchyardError::RequestTimedOut { .. }));

    transport.stop().await;
}

#[tokio::test]
async fn deferred_command_is_never_delivered_early() {
    let transport = InMemoryTransport::new(config());
    let seen: Seen = Arc::default();
    let hotel = Endpoint::builder(&transport, "hotel", "hotel-0")
        .with_command_handler::<BookRoom, _>(recording(&seen, false))
        .build()
        .unwrap();
    started(&transport, &[&hotel]).await;

    let due_at = Utc::now() + chrono::Duration::milliseconds(120);
    transport
        .context()
        .send_at(BookRoom { room: 5 }, due_at)
        .unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(seen.lock().unwrap().is_empty());

    assert!(eventually(|| !seen.lock().unwrap().is_empty(), Duration::from_secs(2)).await);
    let delivered_at = seen.lock().unwrap()[0]
        .headers()
        .actual_delivery_date()
        .unwrap();
    assert!(delivered_at >= due_at);

    transport.stop().await;
}

#[tokio::test]
async fn stop_during_slow_handler_reports_deadline() {
    let transport = InMemoryTransport::new(
        config().with_shutdown_timeout(Duration::from_millis(50)),
    );
    let hotel = Endpoint::builder(&transport, "hotel", "hotel-0")
        .with_command_handler::<BookRoom, _>(handler_fn(|_c: BookRoom, _ctx| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }))
        .build()
        .unwrap();
    started(&transport, &[&hotel]).await;

    transport.context().send(BookRoom { room: 9 }).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(transport.stop().await, StopOutcome::DeadlineElapsed);
    assert!(transport.context().send(BookRoom { room: 10 }).is_err());
}
