//! Storage seam for webhook endpoints and the delivery log.

use std::collections::BTreeMap;

use async_trait::async_trait;
use outlet_core::types::Timestamp;
use outlet_core::webhook::{DeliveryRecord, WebhookEndpoint};
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("webhook {0} not found")]
    NotFound(String),

    #[error("webhook store failure: {0}")]
    Backend(String),
}

/// Where the dispatcher finds endpoints and records what it delivered.
#[async_trait]
pub trait WebhookStore: Send + Sync + 'static {
    /// Every endpoint registered by `org_id`, active or not.
    async fn list_endpoints(&self, org_id: &str) -> Result<Vec<WebhookEndpoint>, StoreError>;

    /// Append one delivery attempt to the log.
    async fn record_delivery(&self, record: DeliveryRecord) -> Result<(), StoreError>;

    /// Fold one delivery outcome into the endpoint's counters.
    async fn update_delivery_stats(
        &self,
        webhook_id: &str,
        success: bool,
        status: Option<u16>,
        at: Timestamp,
    ) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// MemoryWebhookStore
// ---------------------------------------------------------------------------

/// A [`WebhookStore`] kept entirely in memory.
#[derive(Default)]
pub struct MemoryWebhookStore {
    endpoints: RwLock<BTreeMap<String, WebhookEndpoint>>,
    deliveries: RwLock<Vec<DeliveryRecord>>,
}

impl MemoryWebhookStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with `endpoints`.
    pub fn with_endpoints(endpoints: impl IntoIterator<Item = WebhookEndpoint>) -> Self {
        let endpoints = endpoints
            .into_iter()
            .map(|endpoint| (endpoint.id.clone(), endpoint))
            .collect();
        Self {
            endpoints: RwLock::new(endpoints),
            deliveries: RwLock::default(),
        }
    }

    pub async fn upsert_endpoint(&self, endpoint: WebhookEndpoint) {
        self.endpoints
            .write()
            .await
            .insert(endpoint.id.clone(), endpoint);
    }

    pub async fn remove_endpoint(&self, webhook_id: &str) -> Option<WebhookEndpoint> {
        self.endpoints.write().await.remove(webhook_id)
    }

    pub async fn endpoint(&self, webhook_id: &str) -> Option<WebhookEndpoint> {
        self.endpoints.read().await.get(webhook_id).cloned()
    }

    /// The whole delivery log, oldest first.
    pub async fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.deliveries.read().await.clone()
    }

    pub async fn deliveries_for(&self, webhook_id: &str) -> Vec<DeliveryRecord> {
        self.deliveries
            .read()
            .await
            .iter()
            .filter(|record| record.webhook_id == webhook_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl WebhookStore for MemoryWebhookStore {
    async fn list_endpoints(&self, org_id: &str) -> Result<Vec<WebhookEndpoint>, StoreError> {
        Ok(self
            .endpoints
            .read()
            .await
            .values()
            .filter(|endpoint| endpoint.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn record_delivery(&self, record: DeliveryRecord) -> Result<(), StoreError> {
        self.deliveries.write().await.push(record);
        Ok(())
    }

    async fn update_delivery_stats(
        &self,
        webhook_id: &str,
        success: bool,
        status: Option<u16>,
        at: Timestamp,
    ) -> Result<(), StoreError> {
        let mut endpoints = self.endpoints.write().await;
        let endpoint = endpoints
            .get_mut(webhook_id)
            .ok_or_else(|| StoreError::NotFound(webhook_id.to_string()))?;
        endpoint.counters.record(success, status, at);
        Ok(())
    }
}
