//! NATS broker backed by `async-nats`, with JetStream for durable streams.

use async_nats::jetstream::{self, stream};
use async_trait::async_trait;
use futures::StreamExt;

use super::broker::{Broker, BrokerError, BrokerMessage, MessageStream};

/// A [`Broker`] on a NATS server.
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsBroker {
    /// Connect to the NATS server at `url`.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        tracing::info!(url, "Connected to NATS");
        Ok(Self::from_client(client))
    }

    /// Wrap an existing client.
    pub fn from_client(client: async_nats::Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self { client, jetstream }
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn subscribe(&self, subject: &str) -> Result<MessageStream, BrokerError> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BrokerError::Subscribe {
                subject: subject.to_string(),
                reason: e.to_string(),
            })?;

        Ok(subscriber
            .map(|message| BrokerMessage {
                subject: message.subject.to_string(),
                payload: message.payload.to_vec(),
            })
            .boxed())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BrokerError::Publish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })
    }

    async fn ensure_stream(&self, name: &str, subjects: &[String]) -> Result<(), BrokerError> {
        self.jetstream
            .get_or_create_stream(stream::Config {
                name: name.to_string(),
                subjects: subjects.to_vec(),
                storage: stream::StorageType::File,
                num_replicas: 1,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Stream {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        tracing::debug!(stream = name, "JetStream stream ready");
        Ok(())
    }

    async fn publish_durable(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let publish_error = |e: jetstream::context::PublishError| BrokerError::Publish {
            subject: subject.to_string(),
            reason: e.to_string(),
        };
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(publish_error)?;
        ack.await.map_err(publish_error)?;
        Ok(())
    }
}
