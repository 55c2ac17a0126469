//! Shared domain types for the Outlet event core.
//!
//! This crate has no internal dependencies so that the event bus, the
//! webhook dispatcher, and any binary can all agree on topic names,
//! payload shapes and the webhook signing scheme.

pub mod signing;
pub mod topics;
pub mod types;
pub mod webhook;
