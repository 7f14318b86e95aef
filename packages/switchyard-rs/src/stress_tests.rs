//! Stress tests designed to break the switchyard transport.
//!
//! These tests exercise races between concurrent senders, the deferred
//! queue, the correlation registry and shutdown.

#[cfg(test)]
mod stress_tests {
    use crate::config::TransportConfig;
    use crate::context::IntegrationContext;
    use crate::core::{Command, EndpointIdentity, Event, MessageId, MessageType, Query, Reply};
    use crate::envelope::IntegrationMessage;
    use crate::lifecycle::{EndpointRuntime, StopOutcome};
    use crate::handler::{erase_handler, erase_query_handler, handler_fn, query_handler_fn};
    use crate::rpc::CorrelationRegistry;
    use crate::testing::shared_latch;
    use crate::topology::Topology;
    use crate::transport::InMemoryTransport;
    use chrono::Utc;
    use serde::Serialize;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::oneshot;

    // ==========================================================================
    // Test Types
    // ==========================================================================

    #[derive(Debug, Clone, Serialize)]
    struct Pick {
        n: usize,
    }
    impl Command for Pick {}

    #[derive(Debug, Clone, Serialize)]
    struct Tick {
        n: usize,
    }
    impl Event for Tick {}

    #[derive(Debug, Clone, Serialize)]
    struct Square {
        n: u64,
    }
    impl Query for Square {
        type Reply = Squared;
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Squared {
        n: u64,
    }
    impl Reply for Squared {}

    fn config() -> TransportConfig {
        TransportConfig::default()
            .with_rpc_timeout(Duration::from_secs(5))
            .with_shutdown_timeout(Duration::from_secs(5))
    }

    // ==========================================================================
    // TEST: Round robin stays fair under concurrent senders
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_round_robin_under_concurrent_senders() {
        let transport = InMemoryTransport::new(config());
        let latch = shared_latch();
        let per_instance: Arc<Vec<AtomicUsize>> =
            Arc::new((0..3).map(|_| AtomicUsize::new(0)).collect());

        for i in 0..3 {
            let latch = latch.clone();
            let per_instance = per_instance.clone();
            transport
                .bind(
                    MessageType::command::<Pick>(),
                    &EndpointIdentity::new("picker", format!("picker-{i}")),
                    erase_handler(handler_fn(move |_p: Pick, _ctx| {
                        let latch = latch.clone();
                        let per_instance = per_instance.clone();
                        async move {
                            per_instance[i].fetch_add(1, Ordering::SeqCst);
                            latch.record();
                            Ok(())
                        }
                    })),
                )
                .unwrap();
        }
        transport.start().await.unwrap();

        let senders: Vec<_> = (0..6)
            .map(|s| {
                let ctx = transport.context();
                tokio::spawn(async move {
                    for n in 0..20 {
                        ctx.send(Pick { n: s * 20 + n }).unwrap();
                        if fastrand::u8(..4) == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();
        for sender in senders {
            sender.await.unwrap();
        }

        latch.wait_for(120, Duration::from_secs(5)).await.unwrap();
        let counts: Vec<usize> = per_instance
            .iter()
            .map(|c| c.load(Ordering::SeqCst))
            .collect();
        assert_eq!(
            counts,
            vec![40, 40, 40],
            "round robin drifted under concurrency: {counts:?}"
        );
        transport.stop().await;
    }

    // ==========================================================================
    // TEST: Deferred messages are never delivered early
    // ==========================================================================
    //
    // Many tasks push deferred events with jittered due times while the pump
    // is running. Every delivery must happen at or after its due time.

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_deferred_never_early_under_concurrent_enqueue() {
        let transport = InMemoryTransport::new(config());
        let latch = shared_latch();
        let early = Arc::new(AtomicUsize::new(0));
        {
            let latch = latch.clone();
            let early = early.clone();
            transport
                .bind(
                    MessageType::event::<Tick>(),
                    &EndpointIdentity::new("clock", "clock-0"),
                    erase_handler(handler_fn(move |_t: Tick, ctx: IntegrationContext| {
                        let latch = latch.clone();
                        let early = early.clone();
                        async move {
                            let now = Utc::now();
                            let due = ctx.incoming().and_then(|m| m.headers().deferred_until());
                            if due.is_some_and(|due| due > now) {
                                early.fetch_add(1, Ordering::SeqCst);
                            }
                            latch.record();
                            Ok(())
                        }
                    })),
                )
                .unwrap();
        }
        transport.start().await.unwrap();

        let producers: Vec<_> = (0..8)
            .map(|p| {
                let transport = transport.clone();
                tokio::spawn(async move {
                    for n in 0..25 {
                        let delay = Duration::from_millis(fastrand::u64(0..60));
                        let message =
                            IntegrationMessage::event(Tick { n: p * 25 + n }).deferred_for(delay);
                        transport
                            .enqueue(message, &tokio_util::sync::CancellationToken::new())
                            .unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }

        latch.wait_for(200, Duration::from_secs(5)).await.unwrap();
        assert_eq!(early.load(Ordering::SeqCst), 0, "deferred message delivered early");
        assert_eq!(transport.core().scheduler.deferred_len(), 0);
        transport.stop().await;
    }

    // ==========================================================================
    // TEST: Concurrent requests each get their own reply
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_are_correlated() {
        let transport = InMemoryTransport::new(config());
        for i in 0..2 {
            transport
                .bind(
                    MessageType::query::<Square>(),
                    &EndpointIdentity::new("math", format!("math-{i}")),
                    erase_query_handler(query_handler_fn(|q: Square, _ctx| async move {
                        tokio::time::sleep(Duration::from_millis(fastrand::u64(0..10))).await;
                        Ok(Squared { n: q.n * q.n })
                    })),
                )
                .unwrap();
        }
        transport.start().await.unwrap();

        let requests: Vec<_> = (0..100u64)
            .map(|n| {
                let ctx = transport.context();
                tokio::spawn(async move { (n, ctx.request(Square { n }).await) })
            })
            .collect();
        for request in requests {
            let (n, reply) = request.await.unwrap();
            assert_eq!(reply.unwrap(), Squared { n: n * n });
        }

        assert_eq!(transport.core().rpc.pending_count(), 0);
        transport.stop().await;
    }

    // ==========================================================================
    // TEST: Expiry and replies racing on the same registry
    // ==========================================================================
    //
    // Half of the requests get a reply right at their deadline. Each one must
    // resolve exactly once and the registry must end up empty.

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reply_racing_expiry_resolves_once() {
        #[derive(Debug, Clone, Serialize)]
        struct Pong;
        impl Reply for Pong {}

        let registry = CorrelationRegistry::new();
        let iterations = 200;
        let mut handles = Vec::with_capacity(iterations);

        for _ in 0..iterations {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let request_id = MessageId::new();
                let (slot, reply) = oneshot::channel();
                assert!(registry.try_enroll(request_id, slot, Duration::from_millis(5)));

                tokio::time::sleep(Duration::from_millis(fastrand::u64(3..8))).await;
                let delivered = registry
                    .try_set_result(request_id, IntegrationMessage::reply(Pong, request_id));

                let outcome = reply.await.unwrap();
                assert_eq!(delivered, outcome.is_ok(), "reply and expiry both resolved");
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.pending_count(), 0);
    }

    // ==========================================================================
    // TEST: Concurrent binds of distinct instances
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_binds() {
        let topology = Arc::new(Topology::new());
        let binds: Vec<_> = (0..64)
            .map(|i| {
                let topology = topology.clone();
                tokio::spawn(async move {
                    topology.bind(
                        MessageType::event::<Tick>(),
                        &EndpointIdentity::new(format!("group-{}", i % 8), format!("i-{i}")),
                        erase_handler(handler_fn(|_t: Tick, _ctx| async { Ok(()) })),
                    )
                })
            })
            .collect();
        for bind in binds {
            bind.await.unwrap().unwrap();
        }

        let route = topology.resolve(&MessageType::event::<Tick>()).unwrap();
        let crate::topology::Route::Targets(groups) = route else {
            panic!("expected targets");
        };
        assert_eq!(groups.len(), 8);
        assert!(groups.iter().all(|g| g.len() == 8));
    }

    // ==========================================================================
    // TEST: Stop while senders are still producing
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_while_sending_does_not_hang() {
        let transport = InMemoryTransport::new(config());
        transport
            .bind(
                MessageType::command::<Pick>(),
                &EndpointIdentity::new("picker", "picker-0"),
                erase_handler(handler_fn(|_p: Pick, _ctx| async {
                    tokio::time::sleep(Duration::from_millis(fastrand::u64(0..5))).await;
                    Ok(())
                })),
            )
            .unwrap();
        transport.start().await.unwrap();

        let sender = {
            let ctx = transport.context();
            tokio::spawn(async move {
                let mut sent = 0;
                for n in 0..10_000 {
                    if ctx.send(Pick { n }).is_err() {
                        break;
                    }
                    sent += 1;
                    if n % 16 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                sent
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::time::timeout(Duration::from_secs(10), transport.stop())
            .await
            .expect("stop hung while senders were active");
        let sent = sender.await.unwrap();
        assert!(sent > 0);
        assert!(transport.context().send(Pick { n: 0 }).is_err());
    }

    // ==========================================================================
    // TEST: No invocation runs after a drained stop
    // ==========================================================================
    //
    // Invokers hammer the gate while the endpoint stops. Once stop reports
    // Drained, no handler body may start.

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_invocation_starts_after_drained_stop() {
        for _ in 0..20 {
            let runtime = Arc::new(EndpointRuntime::new(EndpointIdentity::new("gate", "gate-0")));
            runtime.start().await.unwrap();
            let stopped = Arc::new(AtomicBool::new(false));
            let late = Arc::new(AtomicUsize::new(0));

            let invokers: Vec<_> = (0..16)
                .map(|_| {
                    let runtime = runtime.clone();
                    let stopped = stopped.clone();
                    let late = late.clone();
                    tokio::spawn(async move {
                        loop {
                            let stopped = stopped.clone();
                            let late = late.clone();
                            let invoked = runtime
                                .invoke(|| async move {
                                    if stopped.load(Ordering::SeqCst) {
                                        late.fetch_add(1, Ordering::SeqCst);
                                    }
                                    tokio::task::yield_now().await;
                                })
                                .await;
                            if invoked.is_err() {
                                break;
                            }
                        }
                    })
                })
                .collect();

            tokio::time::sleep(Duration::from_millis(fastrand::u64(1..5))).await;
            let outcome = runtime.stop(Duration::from_secs(5)).await.unwrap();
            stopped.store(true, Ordering::SeqCst);
            assert_eq!(outcome, StopOutcome::Drained);

            for invoker in invokers {
                tokio::time::timeout(Duration::from_secs(5), invoker)
                    .await
                    .expect("invoker kept running after stop")
                    .unwrap();
            }
            assert_eq!(late.load(Ordering::SeqCst), 0, "handler started after drained stop");
            assert_eq!(runtime.inflight(), 0);
        }
    }
}
