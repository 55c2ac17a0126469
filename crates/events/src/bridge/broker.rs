//! The message broker seam used by the bridge.

use async_trait::async_trait;
use futures::stream::BoxStream;

/// A raw message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

/// Messages delivered to one broker subscription.
pub type MessageStream = BoxStream<'static, BrokerMessage>;

/// Errors reported by a [`Broker`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connect(String),

    #[error("subscribe to {subject} failed: {reason}")]
    Subscribe { subject: String, reason: String },

    #[error("publish to {subject} failed: {reason}")]
    Publish { subject: String, reason: String },

    #[error("stream {name} unavailable: {reason}")]
    Stream { name: String, reason: String },
}

/// A publish/subscribe backbone shared between processes.
///
/// Subjects are dot-separated. Subscriptions accept NATS-style wildcards:
/// `*` matches exactly one token and a trailing `>` matches one or more.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Subscribe to every subject matching `subject`.
    async fn subscribe(&self, subject: &str) -> Result<MessageStream, BrokerError>;

    /// Best-effort publish.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Create the durable stream `name` capturing `subjects`, or do nothing
    /// if it already exists.
    async fn ensure_stream(&self, name: &str, subjects: &[String]) -> Result<(), BrokerError>;

    /// Publish through a durable stream and wait for the acknowledgement.
    async fn publish_durable(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
}

/// Whether `subject` matches the subscription `pattern`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut subject = subject.split('.');
    loop {
        match (pattern.next(), subject.next()) {
            (Some(">"), Some(_)) => return pattern.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
