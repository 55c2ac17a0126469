//! In-process broker.
//!
//! Lets several buses in one process talk to each other through the same
//! bridge code path a real broker would use. Durable streams are recorded so
//! callers can inspect what was captured.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;

use super::broker::{subject_matches, Broker, BrokerError, BrokerMessage, MessageStream};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct DurableStream {
    subjects: Vec<String>,
    messages: Vec<BrokerMessage>,
}

/// A [`Broker`] backed by a `tokio::sync::broadcast` channel.
pub struct MemoryBroker {
    sender: broadcast::Sender<BrokerMessage>,
    streams: Mutex<HashMap<String, DurableStream>>,
    offline: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            streams: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Make every subsequent operation fail, as if the broker were down.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    /// Names of the durable streams created so far.
    pub fn streams(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_streams().keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages captured by the durable stream `name`, oldest first.
    pub fn stream_messages(&self, name: &str) -> Vec<BrokerMessage> {
        self.lock_streams()
            .get(name)
            .map(|stream| stream.messages.clone())
            .unwrap_or_default()
    }

    fn lock_streams(&self) -> std::sync::MutexGuard<'_, HashMap<String, DurableStream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Acquire)
    }

    fn broadcast(&self, subject: &str, payload: Vec<u8>) {
        // No receivers is not an error for a fire-and-forget publish.
        let _ = self.sender.send(BrokerMessage {
            subject: subject.to_string(),
            payload,
        });
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, subject: &str) -> Result<MessageStream, BrokerError> {
        if self.is_offline() {
            return Err(BrokerError::Subscribe {
                subject: subject.to_string(),
                reason: "broker offline".into(),
            });
        }

        let pattern = subject.to_string();
        let receiver = self.sender.subscribe();
        let messages = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Memory broker subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |message| {
            futures::future::ready(subject_matches(&pattern, &message.subject))
        });

        Ok(messages.boxed())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        if self.is_offline() {
            return Err(BrokerError::Publish {
                subject: subject.to_string(),
                reason: "broker offline".into(),
            });
        }
        self.broadcast(subject, payload);
        Ok(())
    }

    async fn ensure_stream(&self, name: &str, subjects: &[String]) -> Result<(), BrokerError> {
        if self.is_offline() {
            return Err(BrokerError::Stream {
                name: name.to_string(),
                reason: "broker offline".into(),
            });
        }
        self.lock_streams()
            .entry(name.to_string())
            .or_insert_with(|| DurableStream {
                subjects: subjects.to_vec(),
                messages: Vec::new(),
            });
        Ok(())
    }

    async fn publish_durable(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        if self.is_offline() {
            return Err(BrokerError::Publish {
                subject: subject.to_string(),
                reason: "broker offline".into(),
            });
        }

        {
            let mut streams = self.lock_streams();
            let stream = streams.values_mut().find(|stream| {
                stream
                    .subjects
                    .iter()
                    .any(|pattern| subject_matches(pattern, subject))
            });
            let Some(stream) = stream else {
                return Err(BrokerError::Publish {
                    subject: subject.to_string(),
                    reason: "no stream captures this subject".into(),
                });
            };
            stream.messages.push(BrokerMessage {
                subject: subject.to_string(),
                payload: payload.clone(),
            });
        }

        self.broadcast(subject, payload);
        Ok(())
    }
}
