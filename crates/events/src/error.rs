//! Error types for the event bus.
//!
//! Producers only ever see [`BusError`]. Everything that goes wrong after an
//! event has been accepted is a [`DeliveryError`], which is logged and
//! counted but never propagated.

use std::time::Duration;

/// Failure to hand an event to the bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The intake queue stayed full for the whole emit timeout.
    #[error("event bus saturated: could not enqueue {topic} within {timeout:?}")]
    Saturated { topic: String, timeout: Duration },

    /// The bus has been shut down.
    #[error("event bus is shut down")]
    Closed,
}

/// Failure to deliver one event to one subscriber.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The payload is not the type the subscriber registered for.
    #[error("type mismatch on {topic}: expected {expected}, got {found}")]
    TypeMismatch {
        topic: String,
        expected: &'static str,
        found: &'static str,
    },

    /// The handler returned an error.
    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),

    /// The handler did not finish within the delivery timeout.
    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturated_display_names_topic() {
        let err = BusError::Saturated {
            topic: "contact.created".into(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(
            err.to_string(),
            "event bus saturated: could not enqueue contact.created within 5s"
        );
    }

    #[test]
    fn handler_error_keeps_context_chain() {
        let err = DeliveryError::Handler(anyhow::anyhow!("root cause").context("while saving"));
        assert_eq!(err.to_string(), "handler failed: while saving: root cause");
    }
}
