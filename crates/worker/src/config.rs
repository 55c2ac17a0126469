use std::path::PathBuf;

use outlet_events::bridge::DEFAULT_PREFIX;
use outlet_events::config::DEFAULT_QUEUE_CAPACITY;

/// Default replay cache size for the worker's bus.
const DEFAULT_REPLAY_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a non-negative integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub queue_capacity: usize,
    /// `0` disables replay.
    pub replay_capacity: usize,
    /// Broker bridge is disabled when unset.
    pub nats_url: Option<String>,
    pub nats_prefix: String,
    /// JetStream stream used for durable publishing, if any.
    pub nats_stream: Option<String>,
    /// JSON array of webhook endpoints to seed the store with.
    pub webhooks_file: Option<PathBuf>,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var               | Default          |
    /// |-----------------------|------------------|
    /// | `BUS_QUEUE_CAPACITY`  | `512`            |
    /// | `BUS_REPLAY_CAPACITY` | `256`            |
    /// | `NATS_URL`            | unset            |
    /// | `NATS_PREFIX`         | `outlet.events.` |
    /// | `NATS_STREAM`         | unset            |
    /// | `WEBHOOKS_FILE`       | unset            |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let number = |name: &'static str, default: usize| -> Result<usize, ConfigError> {
            match non_empty(name) {
                Some(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidNumber { name, value }),
                None => Ok(default),
            }
        };

        Ok(Self {
            queue_capacity: number("BUS_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?,
            replay_capacity: number("BUS_REPLAY_CAPACITY", DEFAULT_REPLAY_CAPACITY)?,
            nats_url: non_empty("NATS_URL"),
            nats_prefix: non_empty("NATS_PREFIX").unwrap_or_else(|| DEFAULT_PREFIX.into()),
            nats_stream: non_empty("NATS_STREAM"),
            webhooks_file: non_empty("WEBHOOKS_FILE").map(PathBuf::from),
        })
    }
}
