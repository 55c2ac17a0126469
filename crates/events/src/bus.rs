//! In-process event bus with a single ordered intake queue.
//!
//! [`EventBus`] owns one background dispatch loop. Producers enqueue events
//! with [`emit`](EventBus::emit); the loop takes them off the queue in order,
//! appends each to the replay cache, reads one snapshot of the subscription
//! registry, and spawns an independent delivery per subscriber. Locally
//! emitted events are also handed to the broker bridge when one is
//! configured.
//!
//! Construct one bus in the composition root and share it as
//! `Arc<EventBus>`.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::bridge::decoder::DecoderRegistry;
use crate::bridge::{self, BridgeContext, Outbound};
use crate::config::BusConfig;
use crate::error::{BusError, DeliveryError};
use crate::event::Event;
use crate::handler::{erase_any, DeliveryContext, DeliveryMode, ErasedHandler, Handler, HandlerResult};
use crate::payload::{ConnectionHandle, Payload};
use crate::registry::{Subscription, SubscriptionEntry, SubscriptionRegistry};
use crate::replay::ReplayCache;
use crate::stats::{bump, BusStats, Counters};

const DEFAULT_NAME: &str = "default";

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State reachable from both the public handle and the dispatch loop.
struct Shared {
    name: Arc<str>,
    registry: Arc<SubscriptionRegistry>,
    replay: Option<ReplayCache>,
    decoders: Arc<DecoderRegistry>,
    counters: Arc<Counters>,
    delivery_timeout: Duration,
    tracker: TaskTracker,
}

impl Shared {
    /// Fan one sequenced event out to the current subscribers.
    fn dispatch(self: &Arc<Self>, event: Event, outbound: Option<&Outbound>) {
        let event = Arc::new(event);

        if let Some(cache) = &self.replay {
            cache.append(Arc::clone(&event));
        }
        // Pairs with the fence in `EventBus::register`: either this read
        // sees the new subscription or its replay sees this event.
        fence(Ordering::SeqCst);

        let snapshot = self.registry.snapshot();
        for entry in snapshot.subscribers(event.topic()) {
            if !entry.accepts_live(event.seq()) {
                continue;
            }
            self.tracker.spawn(deliver(
                Arc::clone(self),
                Arc::clone(entry),
                Arc::clone(&event),
                DeliveryMode::Live,
            ));
        }

        if let Some(outbound) = outbound {
            outbound.forward(&event);
        }
        bump(&self.counters.events_dispatched);
    }

    fn record_failure(&self, entry: &SubscriptionEntry, event: &Event, error: &DeliveryError) {
        let (counter, quiet) = match error {
            DeliveryError::TypeMismatch { .. } => (&self.counters.type_mismatches, true),
            DeliveryError::Handler(_) => (&self.counters.handler_failures, true),
            DeliveryError::TimedOut(_) => (&self.counters.timeouts, false),
            DeliveryError::Panicked(_) => (&self.counters.panics, false),
        };
        bump(counter);

        let connection = event.connection().map(|conn| conn.id());
        let peer_addr = event.connection().and_then(|conn| conn.peer_addr());
        if quiet {
            tracing::debug!(
                bus = %self.name,
                topic = %event.topic(),
                subscription_id = %entry.id,
                seq = event.seq(),
                connection = ?connection,
                peer_addr = ?peer_addr,
                error = %error,
                "Event delivery failed"
            );
        } else {
            tracing::warn!(
                bus = %self.name,
                topic = %event.topic(),
                subscription_id = %entry.id,
                seq = event.seq(),
                connection = ?connection,
                peer_addr = ?peer_addr,
                error = %error,
                "Event delivery failed"
            );
        }
    }
}

/// Run one handler under the delivery timeout, catching errors and panics.
async fn deliver(
    shared: Arc<Shared>,
    entry: Arc<SubscriptionEntry>,
    event: Arc<Event>,
    mode: DeliveryMode,
) {
    bump(&shared.counters.deliveries);

    let ctx = DeliveryContext {
        topic: event.topic().to_string(),
        subscription_id: entry.id.clone(),
        seq: event.seq(),
        mode,
    };
    let payload = Arc::clone(event.payload());
    let connection = event.connection().cloned();
    let handler = Arc::clone(&entry.handler);
    // Calling the handler inside the future keeps a panic in its synchronous
    // part inside `catch_unwind` too.
    let call = AssertUnwindSafe(async move { handler(ctx, payload, connection).await }).catch_unwind();

    let outcome = match tokio::time::timeout(shared.delivery_timeout, call).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(DeliveryError::Panicked(panic_message(panic.as_ref()))),
        Err(_) => Err(DeliveryError::TimedOut(shared.delivery_timeout)),
    };

    if let Err(e) = outcome {
        shared.record_failure(&entry, &event, &e);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Dispatch loop
// ---------------------------------------------------------------------------

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut intake: mpsc::Receiver<Event>,
    outbound: Option<Outbound>,
    cancel: CancellationToken,
) {
    let mut seq: u64 = 0;

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = intake.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        seq += 1;
        shared.dispatch(event.sequenced(seq), outbound.as_ref());
    }

    // Refuse new events, then push what is already queued through the
    // normal fan-out path.
    intake.close();
    let mut drained = 0usize;
    while let Some(event) = intake.recv().await {
        seq += 1;
        shared.dispatch(event.sequenced(seq), outbound.as_ref());
        drained += 1;
    }

    tracing::debug!(bus = %shared.name, drained, last_seq = seq, "Dispatch loop stopped");
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// In-process publish/subscribe hub.
///
/// ```rust,no_run
/// use outlet_events::{BusConfig, EventBus, Handler};
///
/// # async fn demo() -> Result<(), outlet_events::BusError> {
/// let bus = EventBus::start(BusConfig::default().with_replay(100)).await;
///
/// let sub = bus
///     .subscribe("greeting", Handler::<String>::payload(|_ctx, text| async move {
///         println!("{text}");
///         Ok(())
///     }), true)
///     .await;
///
/// bus.emit("greeting", "hello".to_string()).await?;
/// sub.unsubscribe();
/// bus.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct EventBus {
    shared: Arc<Shared>,
    intake: mpsc::Sender<Event>,
    instance: Uuid,
    cancel: CancellationToken,
    closed: AtomicBool,
    emit_timeout: Duration,
    shutdown_timeout: Duration,
}

impl EventBus {
    /// Build a bus and start its dispatch loop.
    ///
    /// When a bridge is configured the broker is set up first. A broker that
    /// cannot be reached is logged and the bus runs local-only.
    pub async fn start(config: BusConfig) -> Arc<Self> {
        let bridge_config = config.bridge.clone();
        let (bus, intake) = Self::assemble(&config);

        let outbound = match bridge_config {
            Some(bridge_config) => {
                let ctx = bus.bridge_context();
                match bridge::connect(bridge_config, ctx, bus.cancel.clone(), &bus.shared.tracker)
                    .await
                {
                    Ok(outbound) => Some(outbound),
                    Err(e) => {
                        tracing::warn!(
                            bus = %bus.shared.name,
                            error = %e,
                            "Broker bridge unavailable, delivering locally only"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        bus.shared.tracker.spawn(dispatch_loop(
            Arc::clone(&bus.shared),
            intake,
            outbound,
            bus.cancel.clone(),
        ));

        tracing::info!(
            bus = %bus.shared.name,
            instance = %bus.instance,
            queue_capacity = config.queue_capacity.max(1),
            replay = bus.shared.replay.is_some(),
            "Event bus started"
        );
        Arc::new(bus)
    }

    /// Build the bus state without starting any task.
    fn assemble(config: &BusConfig) -> (Self, mpsc::Receiver<Event>) {
        let (intake, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let replay = if config.replay_enabled() {
            config.replay_capacity.and_then(ReplayCache::new)
        } else {
            None
        };
        let shared = Arc::new(Shared {
            name: Arc::from(config.name.as_deref().unwrap_or(DEFAULT_NAME)),
            registry: Arc::new(SubscriptionRegistry::new()),
            replay,
            decoders: Arc::new(DecoderRegistry::new()),
            counters: Arc::new(Counters::default()),
            delivery_timeout: config.delivery_timeout,
            tracker: TaskTracker::new(),
        });

        let bus = Self {
            shared,
            intake,
            instance: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            emit_timeout: config.emit_timeout,
            shutdown_timeout: config.shutdown_timeout,
        };
        (bus, receiver)
    }

    fn bridge_context(&self) -> BridgeContext {
        BridgeContext {
            bus: Arc::clone(&self.shared.name),
            instance: self.instance,
            intake: self.intake.clone(),
            decoders: Arc::clone(&self.shared.decoders),
            counters: Arc::clone(&self.shared.counters),
        }
    }

    // -- emit ---------------------------------------------------------------

    /// Enqueue an event for dispatch.
    ///
    /// Waits for room while the intake queue is full, up to the emit
    /// timeout, then fails with [`BusError::Saturated`].
    pub async fn emit<T: Payload>(&self, topic: impl Into<String>, payload: T) -> Result<(), BusError> {
        self.emit_shared(topic, Arc::new(payload), None).await
    }

    /// Like [`emit`](Self::emit), carrying the connection the event concerns.
    pub async fn emit_to<T: Payload>(
        &self,
        topic: impl Into<String>,
        payload: T,
        connection: ConnectionHandle,
    ) -> Result<(), BusError> {
        self.emit_shared(topic, Arc::new(payload), Some(connection)).await
    }

    /// Enqueue an already type-erased payload.
    pub async fn emit_shared(
        &self,
        topic: impl Into<String>,
        payload: Arc<dyn Payload>,
        connection: Option<ConnectionHandle>,
    ) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let topic = topic.into();
        let event = Event::local(topic.clone(), payload, connection);
        match tokio::time::timeout(self.emit_timeout, self.intake.send(event)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => {
                bump(&self.shared.counters.saturated);
                tracing::warn!(bus = %self.shared.name, topic = %topic, "Event bus saturated, emit timed out");
                Err(BusError::Saturated {
                    topic,
                    timeout: self.emit_timeout,
                })
            }
        }
    }

    // -- subscribe ----------------------------------------------------------

    /// Register a typed handler for `topic`.
    ///
    /// With `replay` set and replay enabled on the bus, every cached event on
    /// `topic` is delivered to the handler, oldest first, before this
    /// returns. Live delivery then continues with the first event the replay
    /// did not cover.
    pub async fn subscribe<T: Payload>(
        &self,
        topic: impl Into<String>,
        handler: Handler<T>,
        replay: bool,
    ) -> Subscription {
        self.register(topic.into(), handler.erase(), replay).await
    }

    /// Register a handler that receives payloads of any type.
    pub async fn subscribe_any<F, Fut>(&self, topic: impl Into<String>, handler: F, replay: bool) -> Subscription
    where
        F: Fn(DeliveryContext, Arc<dyn Payload>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(topic.into(), erase_any(handler), replay).await
    }

    async fn register(&self, topic: String, handler: ErasedHandler, replay: bool) -> Subscription {
        let cache = self.shared.replay.as_ref().filter(|_| replay);
        let entry = Arc::new(SubscriptionEntry::new(
            self.shared.registry.next_id(&topic),
            topic,
            Utc::now(),
            handler,
            cache.is_some(),
        ));
        self.shared.registry.insert(Arc::clone(&entry));
        let subscription = Subscription::new(&entry, &self.shared.registry);

        tracing::debug!(
            bus = %self.shared.name,
            topic = %entry.topic,
            subscription_id = %entry.id,
            replay,
            "Subscribed"
        );

        let Some(cache) = cache else {
            return subscription;
        };

        fence(Ordering::SeqCst);
        let snapshot = cache.snapshot();
        let boundary = entry.settle_boundary(snapshot.last_seq);

        let mut replayed = 0usize;
        for event in snapshot.events_for(&entry.topic, boundary) {
            deliver(
                Arc::clone(&self.shared),
                Arc::clone(&entry),
                Arc::clone(event),
                DeliveryMode::Replay,
            )
            .await;
            replayed += 1;
        }
        if replayed > 0 {
            tracing::debug!(
                bus = %self.shared.name,
                subscription_id = %entry.id,
                replayed,
                through_seq = boundary,
                "Replayed cached events"
            );
        }

        subscription
    }

    // -- bridge decoders ----------------------------------------------------

    /// Decode remote events on `topic` into `T` instead of a generic map.
    pub fn register_json_type<T>(&self, topic: &str)
    where
        T: Payload + DeserializeOwned,
    {
        self.shared.decoders.register::<T>(topic);
    }

    // -- introspection ------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Id stamped on envelopes this bus publishes to the broker.
    pub fn instance_id(&self) -> Uuid {
        self.instance
    }

    pub fn stats(&self) -> BusStats {
        self.shared.counters.snapshot()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.shared.registry.snapshot().count(topic)
    }

    /// Topics with at least one subscriber, sorted.
    pub fn topics(&self) -> Vec<String> {
        self.shared.registry.snapshot().topics()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Stop accepting events, drain the intake queue, and wait for in-flight
    /// deliveries up to the shutdown timeout.
    ///
    /// Only the first call does anything.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::info!(bus = %self.shared.name, "Shutting down event bus");
        self.cancel.cancel();
        self.shared.tracker.close();

        if tokio::time::timeout(self.shutdown_timeout, self.shared.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                bus = %self.shared.name,
                pending = self.shared.tracker.len(),
                "Shutdown timed out with deliveries still running"
            );
        } else {
            tracing::info!(bus = %self.shared.name, "Event bus stopped");
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
