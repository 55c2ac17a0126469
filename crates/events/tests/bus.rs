//! Behaviour of a single bus: fan-out, replay, isolation and lifecycle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use outlet_events::{
    BusConfig, BusError, Connection, ConnectionHandle, DeliveryMode, EventBus, Handler, Payload,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

/// A handler that records every payload it receives.
fn collector<T: Payload + Clone>() -> (Arc<Mutex<Vec<T>>>, Handler<T>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler = Handler::payload(move |_ctx, value: Arc<T>| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push((*value).clone());
            Ok(())
        }
    });
    (seen, handler)
}

fn counter() -> (Arc<AtomicUsize>, Handler<u32>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&hits);
    let handler = Handler::payload(move |_ctx, _value: Arc<u32>| {
        let sink = Arc::clone(&sink);
        async move {
            sink.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    (hits, handler)
}

async fn emit_all(bus: &EventBus, topic: &str, values: impl IntoIterator<Item = u32>) {
    for value in values {
        bus.emit(topic, value).await.unwrap();
    }
}

async fn wait_dispatched(bus: &EventBus, count: u64) {
    wait_until(|| bus.stats().events_dispatched >= count).await;
}

#[derive(Debug)]
struct TestConnection {
    id: String,
}

impl Connection for TestConnection {
    fn id(&self) -> &str {
        &self.id
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn every_subscriber_on_the_topic_receives_the_event() {
    let bus = EventBus::start(BusConfig::default()).await;
    let (a, handler_a) = counter();
    let (b, handler_b) = counter();
    let (other, handler_other) = counter();
    bus.subscribe("contact.created", handler_a, false).await;
    bus.subscribe("contact.created", handler_b, false).await;
    bus.subscribe("email.sent", handler_other, false).await;

    bus.emit("contact.created", 1u32).await.unwrap();

    wait_until(|| a.load(Ordering::SeqCst) == 1 && b.load(Ordering::SeqCst) == 1).await;
    assert_eq!(other.load(Ordering::SeqCst), 0);
    assert_eq!(bus.subscriber_count("contact.created"), 2);
    assert_eq!(bus.topics(), vec!["contact.created", "email.sent"]);
    bus.shutdown().await;
}

#[tokio::test]
async fn failing_subscribers_do_not_affect_others() {
    let bus = EventBus::start(BusConfig::default()).await;
    bus.subscribe(
        "t",
        Handler::<u32>::payload(|_ctx, value| async move {
            assert_eq!(*value, 0, "subscriber A panics");
            Ok(())
        }),
        false,
    )
    .await;
    bus.subscribe(
        "t",
        Handler::<u32>::payload(|_ctx, _value| async { anyhow::bail!("subscriber B fails") }),
        false,
    )
    .await;
    let (hits, handler) = counter();
    bus.subscribe("t", handler, false).await;

    bus.emit("t", 7u32).await.unwrap();

    wait_until(|| hits.load(Ordering::SeqCst) == 1).await;
    wait_until(|| {
        let stats = bus.stats();
        stats.panics == 1 && stats.handler_failures == 1
    })
    .await;
    bus.shutdown().await;
}

#[tokio::test]
async fn wrong_payload_type_is_dropped_for_that_subscriber_only() {
    let bus = EventBus::start(BusConfig::default()).await;
    let (numbers, number_handler) = collector::<u32>();
    let (texts, text_handler) = collector::<String>();
    bus.subscribe("t", number_handler, false).await;
    bus.subscribe("t", text_handler, false).await;

    bus.emit("t", "hello".to_string()).await.unwrap();

    wait_until(|| texts.lock().unwrap().len() == 1).await;
    wait_until(|| bus.stats().type_mismatches == 1).await;
    assert!(numbers.lock().unwrap().is_empty());
    bus.shutdown().await;
}

#[tokio::test]
async fn connection_handlers_receive_the_origin_connection() {
    let bus = EventBus::start(BusConfig::default()).await;
    let seen: Arc<Mutex<Vec<Option<String>>>> = Arc::default();
    let sink = Arc::clone(&seen);
    bus.subscribe(
        "presence",
        Handler::<u32>::with_connection(move |ctx, _value, connection| {
            let sink = Arc::clone(&sink);
            async move {
                assert_eq!(ctx.mode, DeliveryMode::Live);
                sink.lock().unwrap().push(connection.map(|c| c.id().to_string()));
                Ok(())
            }
        }),
        false,
    )
    .await;

    let connection: ConnectionHandle = Arc::new(TestConnection { id: "conn-1".into() });
    bus.emit_to("presence", 1u32, connection).await.unwrap();
    bus.emit("presence", 2u32).await.unwrap();

    wait_until(|| seen.lock().unwrap().len() == 2).await;
    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec![None, Some("conn-1".to_string())]);
    bus.shutdown().await;
}

#[tokio::test]
async fn any_subscriber_sees_every_payload_type() {
    let bus = EventBus::start(BusConfig::default()).await;
    let seen: Arc<Mutex<Vec<serde_json::Value>>> = Arc::default();
    let sink = Arc::clone(&seen);
    bus.subscribe_any(
        "t",
        move |_ctx, payload| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(payload.to_json()?);
                Ok(())
            }
        },
        false,
    )
    .await;

    bus.emit("t", 1u32).await.unwrap();
    bus.emit("t", "two".to_string()).await.unwrap();

    wait_until(|| seen.lock().unwrap().len() == 2).await;
    let seen = seen.lock().unwrap().clone();
    assert!(seen.contains(&serde_json::json!(1)));
    assert!(seen.contains(&serde_json::json!("two")));
    bus.shutdown().await;
}

// ---------------------------------------------------------------------------
// Unsubscribe
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unsubscribe_is_idempotent_and_stops_delivery() {
    let bus = EventBus::start(BusConfig::default()).await;
    let (hits, handler) = counter();
    let subscription = bus.subscribe("t", handler, false).await;
    assert!(subscription.id().starts_with("t-"));
    assert_eq!(subscription.topic(), "t");

    assert!(subscription.unsubscribe());
    assert!(!subscription.unsubscribe());
    assert_eq!(bus.subscriber_count("t"), 0);
    assert!(bus.topics().is_empty());

    bus.emit("t", 1u32).await.unwrap();
    wait_dispatched(&bus, 1).await;
    bus.shutdown().await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_subscribe_and_unsubscribe_leave_a_consistent_registry() {
    let bus = EventBus::start(BusConfig::default()).await;

    let producer = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move { emit_all(&bus, "t", 0..500).await })
    };
    let churn: Vec<_> = (0..8)
        .map(|_| {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                for _ in 0..50 {
                    let (_hits, handler) = counter();
                    let subscription = bus.subscribe("t", handler, false).await;
                    tokio::task::yield_now().await;
                    assert!(subscription.unsubscribe());
                }
            })
        })
        .collect();

    producer.await.unwrap();
    for task in churn {
        task.await.unwrap();
    }

    assert_eq!(bus.subscriber_count("t"), 0);
    assert!(bus.topics().is_empty());
    bus.shutdown().await;
    assert_eq!(bus.stats().events_dispatched, 500);
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn late_subscriber_replays_history_in_order_before_subscribe_returns() {
    let bus = EventBus::start(BusConfig::default().with_replay(100)).await;
    emit_all(&bus, "t", 0..5).await;
    emit_all(&bus, "other", 100..103).await;
    wait_dispatched(&bus, 8).await;

    let (seen, handler) = collector::<u32>();
    bus.subscribe("t", handler, true).await;
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);

    emit_all(&bus, "t", 5..7).await;
    wait_until(|| seen.lock().unwrap().len() == 7).await;
    let mut seen = seen.lock().unwrap().clone();
    seen[5..].sort();
    assert_eq!(seen, (0..7).collect::<Vec<u32>>());
    bus.shutdown().await;
}

#[tokio::test]
async fn replay_marks_deliveries_as_replay() {
    let bus = EventBus::start(BusConfig::default().with_replay(10)).await;
    bus.emit("t", 1u32).await.unwrap();
    wait_dispatched(&bus, 1).await;

    let modes: Arc<Mutex<Vec<DeliveryMode>>> = Arc::default();
    let sink = Arc::clone(&modes);
    bus.subscribe(
        "t",
        Handler::<u32>::payload(move |ctx, _value| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(ctx.mode);
                Ok(())
            }
        }),
        true,
    )
    .await;
    assert_eq!(*modes.lock().unwrap(), vec![DeliveryMode::Replay]);
    bus.shutdown().await;
}

#[tokio::test]
async fn oldest_event_is_evicted_from_replay() {
    let bus = EventBus::start(BusConfig::default().with_replay(3)).await;
    emit_all(&bus, "t", 0..4).await;
    wait_dispatched(&bus, 4).await;

    let (seen, handler) = collector::<u32>();
    bus.subscribe("t", handler, true).await;
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    bus.shutdown().await;
}

#[tokio::test]
async fn replay_on_an_empty_cache_delivers_nothing() {
    let bus = EventBus::start(BusConfig::default().with_replay(10)).await;
    let (first, first_handler) = collector::<u32>();
    let (second, second_handler) = collector::<u32>();
    bus.subscribe("x", first_handler, true).await;
    bus.subscribe("x", second_handler, true).await;

    assert!(first.lock().unwrap().is_empty());
    assert!(second.lock().unwrap().is_empty());
    bus.shutdown().await;
}

#[tokio::test]
async fn replay_request_is_ignored_when_replay_is_disabled() {
    let bus = EventBus::start(BusConfig::default().with_replay(0)).await;
    emit_all(&bus, "t", 0..3).await;
    wait_dispatched(&bus, 3).await;

    let (seen, handler) = collector::<u32>();
    bus.subscribe("t", handler, true).await;
    assert!(seen.lock().unwrap().is_empty());

    bus.emit("t", 9u32).await.unwrap();
    wait_until(|| seen.lock().unwrap().len() == 1).await;
    bus.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replay_and_live_hand_over_exactly_once_under_concurrent_emits() {
    const TOTAL: u32 = 400;
    let bus = EventBus::start(BusConfig::default().with_replay(1000)).await;

    let producer = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move { emit_all(&bus, "t", 0..TOTAL).await })
    };

    // Subscribe while the producer is still emitting.
    wait_until(|| bus.stats().events_dispatched >= 50).await;
    let (seen, handler) = collector::<u32>();
    bus.subscribe("t", handler, true).await;

    producer.await.unwrap();
    wait_until(|| seen.lock().unwrap().len() >= TOTAL as usize).await;
    bus.shutdown().await;

    let mut seen = seen.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..TOTAL).collect::<Vec<u32>>());
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_drains_queued_events() {
    let bus = EventBus::start(BusConfig::default()).await;
    let (hits, handler) = counter();
    bus.subscribe("t", handler, false).await;

    emit_all(&bus, "t", 0..50).await;
    bus.shutdown().await;

    assert_eq!(hits.load(Ordering::SeqCst), 50);
    assert_eq!(bus.stats().events_dispatched, 50);
}

#[tokio::test]
async fn shutdown_is_idempotent_and_closes_emit() {
    let bus = EventBus::start(BusConfig::default()).await;
    bus.shutdown().await;
    bus.shutdown().await;

    assert!(bus.is_closed());
    let err = bus.emit("t", 1u32).await.unwrap_err();
    assert_matches!(err, BusError::Closed);
}

#[tokio::test(start_paused = true)]
async fn shutdown_gives_up_on_slow_subscribers() {
    let config = BusConfig::default()
        .with_delivery_timeout(Duration::from_secs(60))
        .with_shutdown_timeout(Duration::from_secs(1));
    let bus = EventBus::start(config).await;
    bus.subscribe(
        "t",
        Handler::<u32>::payload(|_ctx, _value| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }),
        false,
    )
    .await;
    bus.emit("t", 1u32).await.unwrap();

    let started = tokio::time::Instant::now();
    bus.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(2));
}
