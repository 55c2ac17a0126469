//! Two buses talking through an in-process broker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use outlet_core::topics::{ContactEvent, CONTACT_CREATED};
use outlet_events::{
    BridgeConfig, Broker, BusConfig, Envelope, EventBus, Handler, JsonMap, MemoryBroker, Payload,
};

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

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

async fn bridged_bus(name: &str, broker: &Arc<MemoryBroker>) -> Arc<EventBus> {
    let broker: Arc<dyn Broker> = Arc::clone(broker) as Arc<dyn Broker>;
    EventBus::start(
        BusConfig::default()
            .with_name(name)
            .with_bridge(BridgeConfig::new(broker)),
    )
    .await
}

fn contact(org_id: &str) -> ContactEvent {
    ContactEvent {
        org_id: org_id.into(),
        contact_id: "c1".into(),
        email: "c1@example.com".into(),
        list_id: None,
        source: Some("api".into()),
        timestamp: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn event_reaches_the_other_bus_as_its_registered_type() {
    let broker = Arc::new(MemoryBroker::new());
    let a = bridged_bus("a", &broker).await;
    let b = bridged_bus("b", &broker).await;
    b.register_json_type::<ContactEvent>(CONTACT_CREATED);

    let (local, local_handler) = collector::<ContactEvent>();
    let (remote, remote_handler) = collector::<ContactEvent>();
    a.subscribe(CONTACT_CREATED, local_handler, false).await;
    b.subscribe(CONTACT_CREATED, remote_handler, false).await;

    let event = contact("org1");
    a.emit(CONTACT_CREATED, event.clone()).await.unwrap();

    wait_until(|| remote.lock().unwrap().len() == 1).await;
    assert_eq!(remote.lock().unwrap()[0], event);

    // Give any echo time to arrive before checking it never did.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(local.lock().unwrap().len(), 1);
    assert_eq!(a.stats().remote_injected, 0);
    assert_eq!(b.stats().remote_injected, 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn remote_events_are_never_published_again() {
    let broker = Arc::new(MemoryBroker::new());
    let mut wire = broker.subscribe("outlet.events.>").await.unwrap();
    let a = bridged_bus("a", &broker).await;
    let b = bridged_bus("b", &broker).await;

    a.emit("contact.created", contact("org1")).await.unwrap();
    wait_until(|| b.stats().remote_injected == 1).await;
    wait_until(|| b.stats().events_dispatched == 1).await;

    let first = wire.next().await.unwrap();
    assert_eq!(first.subject, "outlet.events.contact.created");
    let envelope: Envelope = serde_json::from_slice(&first.payload).unwrap();
    assert_eq!(envelope.topic, "contact.created");
    assert_eq!(envelope.origin, Some(a.instance_id()));
    assert_eq!(envelope.payload["org_id"], "org1");

    let echo = tokio::time::timeout(Duration::from_millis(100), wire.next()).await;
    assert!(echo.is_err(), "bus b re-published a remote event");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn unregistered_topic_arrives_as_a_json_map() {
    let broker = Arc::new(MemoryBroker::new());
    let a = bridged_bus("a", &broker).await;
    let b = bridged_bus("b", &broker).await;

    let (seen, handler) = collector::<JsonMap>();
    b.subscribe("email.opened", handler, false).await;

    a.emit("email.opened", serde_json::json!({"org_id": "org1", "email_id": "e1"}))
        .await
        .unwrap();

    wait_until(|| seen.lock().unwrap().len() == 1).await;
    let map = seen.lock().unwrap()[0].clone();
    assert_eq!(map["email_id"], "e1");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn foreign_envelopes_are_injected() {
    let broker = Arc::new(MemoryBroker::new());
    let bus = bridged_bus("a", &broker).await;
    let (seen, handler) = collector::<JsonMap>();
    bus.subscribe("webhook.received", handler, false).await;

    let body = serde_json::json!({
        "topic": "webhook.received",
        "emitted_at": "2024-05-01T12:00:00Z",
        "payload": {"provider": "ses"}
    });
    broker
        .publish(
            "outlet.events.webhook.received",
            serde_json::to_vec(&body).unwrap(),
        )
        .await
        .unwrap();

    wait_until(|| seen.lock().unwrap().len() == 1).await;
    assert_eq!(seen.lock().unwrap()[0]["provider"], "ses");
    bus.shutdown().await;
}

#[tokio::test]
async fn malformed_messages_are_counted_and_skipped() {
    let broker = Arc::new(MemoryBroker::new());
    let bus = bridged_bus("a", &broker).await;
    bus.register_json_type::<ContactEvent>(CONTACT_CREATED);

    broker
        .publish("outlet.events.garbage", b"not json".to_vec())
        .await
        .unwrap();
    let wrong_shape = serde_json::json!({
        "topic": CONTACT_CREATED,
        "emitted_at": "2024-05-01T12:00:00Z",
        "payload": {"unexpected": true}
    });
    broker
        .publish(
            "outlet.events.contact.created",
            serde_json::to_vec(&wrong_shape).unwrap(),
        )
        .await
        .unwrap();

    wait_until(|| bus.stats().bridge_decode_failures == 2).await;
    assert_eq!(bus.stats().remote_injected, 0);
    bus.shutdown().await;
}

#[tokio::test]
async fn durable_stream_captures_local_events() {
    let broker = Arc::new(MemoryBroker::new());
    let bus = EventBus::start(
        BusConfig::default().with_bridge(
            BridgeConfig::new(Arc::clone(&broker) as Arc<dyn Broker>).with_stream("OUTLET_EVENTS"),
        ),
    )
    .await;

    bus.emit("email.sent", serde_json::json!({"org_id": "org1"}))
        .await
        .unwrap();

    wait_until(|| broker.stream_messages("OUTLET_EVENTS").len() == 1).await;
    assert_eq!(broker.streams(), vec!["OUTLET_EVENTS".to_string()]);
    let message = &broker.stream_messages("OUTLET_EVENTS")[0];
    assert_eq!(message.subject, "outlet.events.email.sent");
    bus.shutdown().await;
}

#[tokio::test]
async fn unreachable_broker_degrades_to_local_delivery() {
    let broker = Arc::new(MemoryBroker::new());
    broker.set_offline(true);
    let bus = bridged_bus("a", &broker).await;

    let (seen, handler) = collector::<u32>();
    bus.subscribe("t", handler, false).await;
    bus.emit("t", 1u32).await.unwrap();

    wait_until(|| seen.lock().unwrap().len() == 1).await;
    assert_eq!(bus.stats().bridge_publish_failures, 0);
    bus.shutdown().await;
}

#[tokio::test]
async fn publish_failures_after_connect_are_counted() {
    let broker = Arc::new(MemoryBroker::new());
    let bus = bridged_bus("a", &broker).await;
    broker.set_offline(true);

    let (seen, handler) = collector::<u32>();
    bus.subscribe("t", handler, false).await;
    bus.emit("t", 1u32).await.unwrap();

    wait_until(|| seen.lock().unwrap().len() == 1).await;
    wait_until(|| bus.stats().bridge_publish_failures == 1).await;
    bus.shutdown().await;
}
