//! Bounded replay cache of recently dispatched events.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::event::Event;
use crate::snapshot::SnapshotCell;

/// One immutable view of the cache.
#[derive(Debug, Default, Clone)]
pub(crate) struct ReplaySnapshot {
    events: VecDeque<Arc<Event>>,
    /// Sequence number of the newest event ever appended, evicted or not.
    pub(crate) last_seq: u64,
}

impl ReplaySnapshot {
    /// Cached events on `topic` with `seq <= through`, oldest first.
    pub(crate) fn events_for<'a>(
        &'a self,
        topic: &'a str,
        through: u64,
    ) -> impl Iterator<Item = &'a Arc<Event>> + 'a {
        self.events
            .iter()
            .take_while(move |event| event.seq() <= through)
            .filter(move |event| event.topic() == topic)
    }
}

/// FIFO cache holding at most `capacity` events.
pub(crate) struct ReplayCache {
    cell: SnapshotCell<ReplaySnapshot>,
    capacity: usize,
}

impl ReplayCache {
    /// `None` when `capacity` is zero.
    pub(crate) fn new(capacity: usize) -> Option<Self> {
        (capacity > 0).then(|| Self {
            cell: SnapshotCell::new(ReplaySnapshot::default()),
            capacity,
        })
    }

    /// Append an event, evicting the oldest once the cache is full.
    pub(crate) fn append(&self, event: Arc<Event>) {
        self.cell.update(|current| {
            let mut next = current.clone();
            while next.events.len() >= self.capacity {
                next.events.pop_front();
            }
            next.last_seq = event.seq();
            next.events.push_back(Arc::clone(&event));
            Some((next, ()))
        });
    }

    pub(crate) fn snapshot(&self) -> Arc<ReplaySnapshot> {
        self.cell.load()
    }
}
