//! Distributed bridge between a local bus and a shared broker.
//!
//! Locally emitted events are wrapped in an [`Envelope`] and published under
//! `prefix + topic` by a single publisher task, so the broker sees them in
//! dispatch order. Inbound envelopes are decoded through the bus's decoder
//! registry and injected into the intake queue tagged as remote, which keeps
//! them from being published again.

pub mod broker;
pub(crate) mod decoder;
pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use outlet_core::types::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::event::{Event, Origin};
use crate::stats::{bump, Counters};

use self::broker::{Broker, BrokerError, BrokerMessage, MessageStream};
use self::decoder::DecoderRegistry;

/// Default subject prefix.
pub const DEFAULT_PREFIX: &str = "outlet.events.";

const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;
const DEFAULT_INJECT_ATTEMPTS: u32 = 3;
const DEFAULT_INJECT_BACKOFF: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// How a bus connects to its broker.
#[derive(Clone)]
pub struct BridgeConfig {
    pub broker: Arc<dyn Broker>,
    /// Prepended to every topic to form the broker subject.
    pub prefix: String,
    /// Publish through this durable stream instead of fire-and-forget.
    pub stream: Option<String>,
    /// Envelopes waiting for the publisher task. Overflow is dropped.
    pub outbound_capacity: usize,
    /// Attempts to place a remote event on a full intake queue.
    pub inject_attempts: u32,
    pub inject_backoff: Duration,
}

impl BridgeConfig {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            prefix: DEFAULT_PREFIX.to_string(),
            stream: None,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            inject_attempts: DEFAULT_INJECT_ATTEMPTS,
            inject_backoff: DEFAULT_INJECT_BACKOFF,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_stream(mut self, name: impl Into<String>) -> Self {
        self.stream = Some(name.into());
        self
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    pub fn with_inject_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.inject_attempts = attempts;
        self.inject_backoff = backoff;
        self
    }

    /// Subscription subject covering every topic under the prefix.
    pub fn wildcard_subject(&self) -> String {
        format!("{}>", self.prefix)
    }
}

impl fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("prefix", &self.prefix)
            .field("stream", &self.stream)
            .field("outbound_capacity", &self.outbound_capacity)
            .field("inject_attempts", &self.inject_attempts)
            .field("inject_backoff", &self.inject_backoff)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// JSON body of every broker message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub emitted_at: Timestamp,
    pub payload: serde_json::Value,
    /// Instance id of the publishing bus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("cannot decode payload for {topic}: {source}")]
    Decode {
        topic: String,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// What the bridge needs from its bus.
pub(crate) struct BridgeContext {
    pub(crate) bus: Arc<str>,
    pub(crate) instance: Uuid,
    pub(crate) intake: mpsc::Sender<Event>,
    pub(crate) decoders: Arc<DecoderRegistry>,
    pub(crate) counters: Arc<Counters>,
}

/// The dispatch loop's handle for publishing local events.
///
/// Dropping it lets the publisher task drain what is queued and exit.
pub(crate) struct Outbound {
    bus: Arc<str>,
    instance: Uuid,
    sender: mpsc::Sender<Envelope>,
    counters: Arc<Counters>,
}

impl Outbound {
    /// Queue a local event for publishing without blocking the dispatch loop.
    pub(crate) fn forward(&self, event: &Event) {
        if event.is_remote() {
            return;
        }

        let payload = match event.payload().to_json() {
            Ok(payload) => payload,
            Err(e) => {
                bump(&self.counters.bridge_publish_failures);
                tracing::warn!(bus = %self.bus, topic = %event.topic(), error = %e, "Cannot serialize event for broker");
                return;
            }
        };
        let envelope = Envelope {
            topic: event.topic().to_string(),
            emitted_at: event.emitted_at(),
            payload,
            origin: Some(self.instance),
        };

        match self.sender.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(envelope)) => {
                bump(&self.counters.bridge_publish_failures);
                tracing::warn!(bus = %self.bus, topic = %envelope.topic, "Broker publish queue full, event not forwarded");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Set up the broker side of a bus.
///
/// Ensures the durable stream (if configured), subscribes to the wildcard
/// subject, and spawns the inbound and publisher tasks on `tracker`.
pub(crate) async fn connect(
    config: BridgeConfig,
    ctx: BridgeContext,
    cancel: CancellationToken,
    tracker: &TaskTracker,
) -> Result<Outbound, BridgeError> {
    let subject = config.wildcard_subject();

    if let Some(stream) = &config.stream {
        config
            .broker
            .ensure_stream(stream, std::slice::from_ref(&subject))
            .await?;
    }
    let messages = config.broker.subscribe(&subject).await?;

    tracing::info!(
        bus = %ctx.bus,
        subject = %subject,
        stream = config.stream.as_deref().unwrap_or("-"),
        "Broker bridge connected"
    );

    let (sender, receiver) = mpsc::channel(config.outbound_capacity.max(1));
    let outbound = Outbound {
        bus: Arc::clone(&ctx.bus),
        instance: ctx.instance,
        sender,
        counters: Arc::clone(&ctx.counters),
    };

    let publisher = Publisher {
        broker: Arc::clone(&config.broker),
        prefix: config.prefix.clone(),
        durable: config.stream.is_some(),
        bus: Arc::clone(&ctx.bus),
        counters: Arc::clone(&ctx.counters),
    };
    tracker.spawn(publisher.run(receiver));

    let inbound = Inbound {
        ctx,
        attempts: config.inject_attempts.max(1),
        backoff: config.inject_backoff,
    };
    tracker.spawn(inbound.run(messages, cancel));

    Ok(outbound)
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

struct Publisher {
    broker: Arc<dyn Broker>,
    prefix: String,
    durable: bool,
    bus: Arc<str>,
    counters: Arc<Counters>,
}

impl Publisher {
    async fn run(self, mut receiver: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = receiver.recv().await {
            let subject = format!("{}{}", self.prefix, envelope.topic);
            if let Err(e) = self.publish(&subject, &envelope).await {
                bump(&self.counters.bridge_publish_failures);
                tracing::warn!(bus = %self.bus, subject = %subject, error = %e, "Broker publish failed");
            }
        }
        tracing::debug!(bus = %self.bus, "Broker publisher stopped");
    }

    async fn publish(&self, subject: &str, envelope: &Envelope) -> Result<(), BridgeError> {
        let body = serde_json::to_vec(envelope)?;
        if self.durable {
            self.broker.publish_durable(subject, body).await?;
        } else {
            self.broker.publish(subject, body).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

struct Inbound {
    ctx: BridgeContext,
    attempts: u32,
    backoff: Duration,
}

impl Inbound {
    async fn run(self, mut messages: MessageStream, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = messages.next() => match message {
                    Some(message) => {
                        if let Err(e) = self.receive(message).await {
                            bump(&self.ctx.counters.bridge_decode_failures);
                            tracing::warn!(bus = %self.ctx.bus, error = %e, "Dropping broker message");
                        }
                    }
                    None => {
                        tracing::warn!(bus = %self.ctx.bus, "Broker subscription closed");
                        break;
                    }
                },
            }
        }
        tracing::debug!(bus = %self.ctx.bus, "Broker receiver stopped");
    }

    async fn receive(&self, message: BrokerMessage) -> Result<(), BridgeError> {
        let envelope: Envelope = serde_json::from_slice(&message.payload)?;
        if envelope.origin == Some(self.ctx.instance) {
            return Ok(());
        }

        let payload = self
            .ctx
            .decoders
            .decode(&envelope.topic, envelope.payload)
            .map_err(|source| BridgeError::Decode {
                topic: envelope.topic.clone(),
                source,
            })?;
        let event = Event::new(envelope.topic, payload, None, Origin::Remote, envelope.emitted_at);

        self.inject(event).await;
        Ok(())
    }

    /// Place a remote event on the intake queue, retrying a bounded number
    /// of times while it is full. Never blocks indefinitely.
    async fn inject(&self, mut event: Event) {
        for attempt in 1..=self.attempts {
            match self.ctx.intake.try_send(event) {
                Ok(()) => {
                    bump(&self.ctx.counters.remote_injected);
                    return;
                }
                Err(TrySendError::Closed(_)) => return,
                Err(TrySendError::Full(returned)) => {
                    event = returned;
                    if attempt < self.attempts {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
            }
        }

        bump(&self.ctx.counters.remote_dropped);
        tracing::warn!(
            bus = %self.ctx.bus,
            topic = %event.topic(),
            attempts = self.attempts,
            "Intake queue full, dropping remote event"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
