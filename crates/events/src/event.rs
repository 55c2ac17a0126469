//! The event envelope carried through the intake queue.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use outlet_core::types::Timestamp;

use crate::payload::{ConnectionHandle, Payload};

/// Where an event entered this bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Emitted by a producer in this process.
    Local,
    /// Received from the broker bridge. Never forwarded back out.
    Remote,
}

/// An immutable event as seen by the dispatch loop and the replay cache.
#[derive(Clone)]
pub struct Event {
    seq: u64,
    topic: String,
    payload: Arc<dyn Payload>,
    connection: Option<ConnectionHandle>,
    origin: Origin,
    emitted_at: Timestamp,
}

impl Event {
    pub(crate) fn new(
        topic: String,
        payload: Arc<dyn Payload>,
        connection: Option<ConnectionHandle>,
        origin: Origin,
        emitted_at: Timestamp,
    ) -> Self {
        Self {
            seq: 0,
            topic,
            payload,
            connection,
            origin,
            emitted_at,
        }
    }

    pub(crate) fn local(
        topic: String,
        payload: Arc<dyn Payload>,
        connection: Option<ConnectionHandle>,
    ) -> Self {
        Self::new(topic, payload, connection, Origin::Local, Utc::now())
    }

    /// Stamp the dispatch-order sequence number.
    pub(crate) fn sequenced(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Position in the dispatch loop's total order, starting at 1.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Arc<dyn Payload> {
        &self.payload
    }

    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn is_remote(&self) -> bool {
        self.origin == Origin::Remote
    }

    pub fn emitted_at(&self) -> Timestamp {
        self.emitted_at
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("seq", &self.seq)
            .field("topic", &self.topic)
            .field("payload", &self.payload)
            .field("connection", &self.connection.as_ref().map(|c| c.id()))
            .field("origin", &self.origin)
            .finish()
    }
}
