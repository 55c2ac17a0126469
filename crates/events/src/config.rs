//! Bus construction settings.

use std::time::Duration;

use crate::bridge::BridgeConfig;

/// Default capacity of the intake queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 512;

/// How long `emit` waits for room in a full intake queue.
pub const DEFAULT_EMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Hard deadline for a single subscriber delivery.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// How long shutdown waits for the dispatch loop and in-flight deliveries.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings fixed at construction time.
///
/// ```rust
/// use outlet_events::BusConfig;
///
/// let config = BusConfig::default()
///     .with_name("worker")
///     .with_replay(100);
/// assert_eq!(config.replay_capacity, Some(100));
/// ```
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Recorded on every log line this bus emits.
    pub name: Option<String>,
    pub queue_capacity: usize,
    /// `None` or `Some(0)` disables replay.
    pub replay_capacity: Option<usize>,
    pub emit_timeout: Duration,
    pub delivery_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub bridge: Option<BridgeConfig>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            name: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            replay_capacity: None,
            emit_timeout: DEFAULT_EMIT_TIMEOUT,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            bridge: None,
        }
    }
}

impl BusConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Keep the last `capacity` events for replay to new subscribers.
    pub fn with_replay(mut self, capacity: usize) -> Self {
        self.replay_capacity = Some(capacity);
        self
    }

    pub fn with_bridge(mut self, bridge: BridgeConfig) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn with_emit_timeout(mut self, timeout: Duration) -> Self {
        self.emit_timeout = timeout;
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub(crate) fn replay_enabled(&self) -> bool {
        self.replay_capacity.is_some_and(|c| c > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = BusConfig::default();
        assert_eq!(config.queue_capacity, 512);
        assert_eq!(config.emit_timeout, Duration::from_secs(5));
        assert_eq!(config.delivery_timeout, Duration::from_secs(10));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert!(!config.replay_enabled());
        assert!(config.bridge.is_none());
    }

    #[test]
    fn zero_replay_capacity_means_disabled() {
        assert!(!BusConfig::default().with_replay(0).replay_enabled());
        assert!(BusConfig::default().with_replay(1).replay_enabled());
    }
}
