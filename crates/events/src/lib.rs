//! Outlet event bus and delivery infrastructure.
//!
//! This crate provides the building blocks of the event system:
//!
//! - [`EventBus`]: in-process publish/subscribe hub with a single ordered
//!   intake queue, a lock-free subscription registry, and an optional
//!   replay cache for late subscribers.
//! - [`bridge`]: mirrors events between buses in different processes over
//!   a shared [`Broker`](bridge::broker::Broker).
//! - [`delivery`]: signed webhook delivery to external endpoints.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod delivery;
pub mod error;
pub mod event;
pub mod handler;
pub mod payload;
pub mod registry;
mod replay;
mod snapshot;
pub mod stats;

pub use bridge::broker::{Broker, BrokerError, BrokerMessage};
pub use bridge::memory::MemoryBroker;
#[cfg(feature = "nats")]
pub use bridge::nats::NatsBroker;
pub use bridge::{BridgeConfig, BridgeError, Envelope};
pub use bus::EventBus;
pub use config::BusConfig;
pub use delivery::store::{MemoryWebhookStore, StoreError, WebhookStore};
pub use delivery::webhook::{DispatcherConfig, WebhookDispatcher, WebhookError, WebhookPayload};
pub use error::{BusError, DeliveryError};
pub use event::{Event, Origin};
pub use handler::{DeliveryContext, DeliveryMode, Handler, HandlerResult};
pub use payload::{downcast_payload, Connection, ConnectionHandle, JsonMap, Payload};
pub use registry::Subscription;
pub use stats::BusStats;
