//! External delivery of bus events.
//!
//! The webhook dispatcher subscribes to a fixed set of topics and turns
//! each event into signed HTTP POSTs to the endpoints its organization has
//! registered, logging every attempt through a [`store::WebhookStore`].

pub mod store;
pub mod webhook;
