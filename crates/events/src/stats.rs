//! Bus counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of a bus's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Events the dispatch loop has cached and fanned out.
    pub events_dispatched: u64,
    /// Subscriber deliveries started, live and replay.
    pub deliveries: u64,
    pub handler_failures: u64,
    pub type_mismatches: u64,
    pub timeouts: u64,
    pub panics: u64,
    /// Emits rejected because the intake queue stayed full.
    pub saturated: u64,
    /// Remote events injected into the intake queue by the bridge.
    pub remote_injected: u64,
    /// Remote events dropped after the injection retries ran out.
    pub remote_dropped: u64,
    pub bridge_publish_failures: u64,
    pub bridge_decode_failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) events_dispatched: AtomicU64,
    pub(crate) deliveries: AtomicU64,
    pub(crate) handler_failures: AtomicU64,
    pub(crate) type_mismatches: AtomicU64,
    pub(crate) timeouts: AtomicU64,
    pub(crate) panics: AtomicU64,
    pub(crate) saturated: AtomicU64,
    pub(crate) remote_injected: AtomicU64,
    pub(crate) remote_dropped: AtomicU64,
    pub(crate) bridge_publish_failures: AtomicU64,
    pub(crate) bridge_decode_failures: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    pub(crate) fn snapshot(&self) -> BusStats {
        let read = |c: &AtomicU64| c.load(Ordering::Relaxed);
        BusStats {
            events_dispatched: read(&self.events_dispatched),
            deliveries: read(&self.deliveries),
            handler_failures: read(&self.handler_failures),
            type_mismatches: read(&self.type_mismatches),
            timeouts: read(&self.timeouts),
            panics: read(&self.panics),
            saturated: read(&self.saturated),
            remote_injected: read(&self.remote_injected),
            remote_dropped: read(&self.remote_dropped),
            bridge_publish_failures: read(&self.bridge_publish_failures),
            bridge_decode_failures: read(&self.bridge_decode_failures),
        }
    }
}
