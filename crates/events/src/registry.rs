//! Subscription registry.
//!
//! A topic → subscriptions map held in a [`SnapshotCell`]. The dispatch loop
//! reads one snapshot per event without locking; subscribe and unsubscribe
//! build a new snapshot and swap it in. Untouched topics share their inner
//! map with the previous snapshot.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use outlet_core::types::Timestamp;

use crate::handler::ErasedHandler;
use crate::snapshot::SnapshotCell;

/// Boundary value of a replaying subscription that has not been settled yet.
const UNSET: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// SubscriptionEntry
// ---------------------------------------------------------------------------

pub(crate) struct SubscriptionEntry {
    pub(crate) id: String,
    pub(crate) topic: String,
    pub(crate) created_at: Timestamp,
    pub(crate) handler: ErasedHandler,
    /// Last sequence number owned by the replay pass. Live delivery takes
    /// everything after it.
    boundary: AtomicU64,
}

impl SubscriptionEntry {
    pub(crate) fn new(
        id: String,
        topic: String,
        created_at: Timestamp,
        handler: ErasedHandler,
        wants_replay: bool,
    ) -> Self {
        Self {
            id,
            topic,
            created_at,
            handler,
            boundary: AtomicU64::new(if wants_replay { UNSET } else { 0 }),
        }
    }

    /// Propose the replay/live boundary. The first proposal wins; every
    /// caller gets back the value that was actually settled.
    pub(crate) fn settle_boundary(&self, proposed: u64) -> u64 {
        match self
            .boundary
            .compare_exchange(UNSET, proposed, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => proposed,
            Err(settled) => settled,
        }
    }

    /// Whether the live fan-out should deliver the event with `seq`.
    ///
    /// The first live event that reaches an unsettled subscription claims
    /// everything before it for the replay pass.
    pub(crate) fn accepts_live(&self, seq: u64) -> bool {
        let boundary = self.settle_boundary(seq.saturating_sub(1));
        seq > boundary
    }
}

impl fmt::Debug for SubscriptionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionEntry")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("boundary", &self.boundary.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

type TopicSubscribers = HashMap<String, Arc<SubscriptionEntry>>;

#[derive(Debug, Default, Clone)]
pub(crate) struct RegistrySnapshot {
    by_topic: HashMap<String, Arc<TopicSubscribers>>,
}

impl RegistrySnapshot {
    pub(crate) fn subscribers(&self, topic: &str) -> impl Iterator<Item = &Arc<SubscriptionEntry>> {
        self.by_topic.get(topic).into_iter().flat_map(|subs| subs.values())
    }

    pub(crate) fn count(&self, topic: &str) -> usize {
        self.by_topic.get(topic).map_or(0, |subs| subs.len())
    }

    pub(crate) fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.by_topic.keys().cloned().collect();
        topics.sort();
        topics
    }
}

// ---------------------------------------------------------------------------
// SubscriptionRegistry
// ---------------------------------------------------------------------------

pub(crate) struct SubscriptionRegistry {
    cell: SnapshotCell<RegistrySnapshot>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            cell: SnapshotCell::new(RegistrySnapshot::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a unique subscription id for `topic`.
    pub(crate) fn next_id(&self, topic: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{topic}-{n}")
    }

    pub(crate) fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.cell.load()
    }

    pub(crate) fn insert(&self, entry: Arc<SubscriptionEntry>) {
        self.cell.update(|current| {
            let mut next = current.clone();
            let mut subs = next
                .by_topic
                .get(&entry.topic)
                .map(|subs| TopicSubscribers::clone(subs))
                .unwrap_or_default();
            subs.insert(entry.id.clone(), Arc::clone(&entry));
            next.by_topic.insert(entry.topic.clone(), Arc::new(subs));
            Some((next, ()))
        });
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub(crate) fn remove(&self, topic: &str, id: &str) -> bool {
        self.cell
            .update(|current| {
                let subs = current.by_topic.get(topic)?;
                if !subs.contains_key(id) {
                    return None;
                }
                let mut next = current.clone();
                let mut subs = TopicSubscribers::clone(subs);
                subs.remove(id);
                if subs.is_empty() {
                    next.by_topic.remove(topic);
                } else {
                    next.by_topic.insert(topic.to_string(), Arc::new(subs));
                }
                Some((next, ()))
            })
            .is_some()
    }
}

// ---------------------------------------------------------------------------
// Subscription handle
// ---------------------------------------------------------------------------

/// Handle returned by [`EventBus::subscribe`](crate::EventBus::subscribe).
///
/// Dropping the handle does not unsubscribe; call
/// [`unsubscribe`](Self::unsubscribe) explicitly.
pub struct Subscription {
    id: String,
    topic: String,
    created_at: Timestamp,
    registry: Weak<SubscriptionRegistry>,
}

impl Subscription {
    pub(crate) fn new(entry: &SubscriptionEntry, registry: &Arc<SubscriptionRegistry>) -> Self {
        Self {
            id: entry.id.clone(),
            topic: entry.topic.clone(),
            created_at: entry.created_at,
            registry: Arc::downgrade(registry),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Stop receiving events. Safe to call more than once, and after the
    /// bus is gone.
    pub fn unsubscribe(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let removed = registry.remove(&self.topic, &self.id);
        if removed {
            tracing::debug!(topic = %self.topic, subscription_id = %self.id, "Unsubscribed");
        }
        removed
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("created_at", &self.created_at)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
