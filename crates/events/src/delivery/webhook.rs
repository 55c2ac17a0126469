//! Signed webhook delivery.
//!
//! [`WebhookDispatcher`] subscribes to the webhook topics on an
//! [`EventBus`]. For every event it resolves the organization's endpoints,
//! serializes one canonical [`WebhookPayload`], and POSTs it to every
//! matching endpoint concurrently with an HMAC-SHA256 signature header.
//! Each attempt is written to the delivery log and folded into the
//! endpoint's counters. Failed deliveries are recorded, not retried.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use futures::future::join_all;
use outlet_core::signing::{compute_webhook_hmac, EVENT_HEADER, SIGNATURE_HEADER, WEBHOOK_ID_HEADER};
use outlet_core::topics::{WEBHOOK_TEST, WEBHOOK_TOPICS};
use outlet_core::webhook::{DeliveryRecord, WebhookEndpoint};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::payload::{JsonMap, Payload};
use crate::registry::Subscription;

use super::store::WebhookStore;

/// HTTP timeout for a single delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bytes of the response body kept in the delivery log.
const MAX_RESPONSE_BYTES: usize = 1024;

const USER_AGENT: &str = "Outlet-Webhook/1.0";

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Error type for webhook delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The remote server returned a non-2xx status code.
    #[error("Webhook returned HTTP {0}")]
    HttpStatus(u16),

    /// The payload could not be serialized.
    #[error("cannot encode webhook payload: {0}")]
    Encode(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// The JSON body every endpoint receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    /// RFC 3339, UTC, whole seconds.
    pub timestamp: String,
    pub data: JsonMap,
}

impl WebhookPayload {
    pub fn new(event: impl Into<String>, data: JsonMap) -> Self {
        Self {
            event: event.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            data,
        }
    }

    /// The canonical payload for a manual test delivery.
    pub fn test(webhook_id: &str) -> Self {
        let mut data = JsonMap::new();
        data.insert(
            "message".into(),
            Value::from("This is a test webhook delivery"),
        );
        data.insert("webhook_id".into(), Value::from(webhook_id));
        Self::new(WEBHOOK_TEST, data)
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub request_timeout: Duration,
    pub max_response_bytes: usize,
    pub user_agent: String,
    /// Bus topics the dispatcher subscribes to on start.
    pub topics: Vec<String>,
    /// How long `stop` waits for in-flight deliveries.
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: REQUEST_TIMEOUT,
            max_response_bytes: MAX_RESPONSE_BYTES,
            user_agent: USER_AGENT.to_string(),
            topics: WEBHOOK_TOPICS.iter().map(|t| t.to_string()).collect(),
            shutdown_timeout: STOP_TIMEOUT,
        }
    }
}

// ---------------------------------------------------------------------------
// WebhookDispatcher
// ---------------------------------------------------------------------------

#[derive(Default)]
struct State {
    running: bool,
    subscriptions: Vec<Subscription>,
}

/// Delivers bus events to external webhook endpoints.
pub struct WebhookDispatcher {
    bus: Arc<EventBus>,
    store: Arc<dyn WebhookStore>,
    client: reqwest::Client,
    config: DispatcherConfig,
    state: Mutex<State>,
    /// Event handling runs here rather than inside the bus delivery, so HTTP
    /// work is bounded by the request timeout instead of the bus's
    /// per-delivery deadline.
    tracker: TaskTracker,
}

impl WebhookDispatcher {
    /// Create a dispatcher with a pre-configured HTTP client. Nothing is
    /// subscribed until [`start`](Self::start).
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<dyn WebhookStore>,
        config: DispatcherConfig,
    ) -> Result<Arc<Self>, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Arc::new(Self {
            bus,
            store,
            client,
            config,
            state: Mutex::new(State::default()),
            tracker: TaskTracker::new(),
        }))
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    /// Subscribe to the configured topics. Calling it while already running
    /// does nothing.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut state = self.lock_state();
            if state.running {
                return;
            }
            state.running = true;
        }
        self.tracker.reopen();

        let mut subscriptions = Vec::with_capacity(self.config.topics.len());
        for topic in &self.config.topics {
            // Weak, so the bus registry does not keep the dispatcher alive.
            let dispatcher = Arc::downgrade(self);
            let subscription = self
                .bus
                .subscribe_any(
                    topic.clone(),
                    move |ctx, payload| {
                        if let Some(dispatcher) = dispatcher.upgrade() {
                            let worker = Arc::clone(&dispatcher);
                            dispatcher.tracker.spawn(async move {
                                worker.handle_event(&ctx.topic, payload).await;
                            });
                        }
                        futures::future::ready(Ok(()))
                    },
                    false,
                )
                .await;
            subscriptions.push(subscription);
        }

        let mut state = self.lock_state();
        if !state.running {
            // Stopped while subscribing.
            for subscription in &subscriptions {
                subscription.unsubscribe();
            }
            return;
        }
        state.subscriptions = subscriptions;
        tracing::info!(topics = ?self.config.topics, "Webhook dispatcher started");
    }

    /// Unsubscribe and wait, bounded by the shutdown timeout, for deliveries
    /// already under way.
    pub async fn stop(&self) {
        let subscriptions = {
            let mut state = self.lock_state();
            if !state.running {
                return;
            }
            state.running = false;
            std::mem::take(&mut state.subscriptions)
        };
        for subscription in &subscriptions {
            subscription.unsubscribe();
        }

        self.tracker.close();
        if tokio::time::timeout(self.config.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                pending = self.tracker.len(),
                "Webhook dispatcher stopped with deliveries still running"
            );
        } else {
            tracing::info!("Webhook dispatcher stopped");
        }
    }

    // -- routing ------------------------------------------------------------

    async fn handle_event(&self, topic: &str, payload: Arc<dyn Payload>) {
        let data = match payload.to_json() {
            Ok(Value::Object(data)) => data,
            Ok(_) => {
                tracing::warn!(topic, "Event payload is not an object, cannot route webhook");
                return;
            }
            Err(e) => {
                tracing::warn!(topic, error = %e, "Cannot serialize event for webhook");
                return;
            }
        };
        self.route(topic, data).await;
    }

    /// Deliver `data` to every endpoint of its organization that accepts
    /// `topic`. Returns the number of endpoints delivered to.
    async fn route(&self, topic: &str, data: JsonMap) -> usize {
        let Some(org_id) = data.get("org_id").and_then(Value::as_str).map(str::to_owned) else {
            tracing::warn!(topic, "Event has no org_id, cannot route webhook");
            return 0;
        };

        let endpoints = match self.store.list_endpoints(&org_id).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                tracing::error!(org_id = %org_id, error = %e, "Failed to list webhooks");
                return 0;
            }
        };
        let matching: Vec<WebhookEndpoint> =
            endpoints.into_iter().filter(|e| e.accepts(topic)).collect();
        if matching.is_empty() {
            return 0;
        }

        let body = match serde_json::to_vec(&WebhookPayload::new(topic, data)) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(topic, error = %e, "Failed to encode webhook payload");
                return 0;
            }
        };

        join_all(
            matching
                .iter()
                .map(|endpoint| self.deliver(endpoint, topic, &body)),
        )
        .await;
        matching.len()
    }

    /// Route an event directly, bypassing the bus. `org_id` is written into
    /// `data` before routing. Returns the number of endpoints delivered to.
    pub async fn dispatch_event(&self, org_id: &str, topic: &str, mut data: JsonMap) -> usize {
        data.insert("org_id".into(), Value::from(org_id));
        self.route(topic, data).await
    }

    /// Send the canonical test payload to `endpoint`, whether or not it is
    /// active, and return the logged attempt.
    pub async fn send_test(&self, endpoint: &WebhookEndpoint) -> Result<DeliveryRecord, WebhookError> {
        let body = serde_json::to_vec(&WebhookPayload::test(&endpoint.id))?;
        Ok(self.deliver(endpoint, WEBHOOK_TEST, &body).await)
    }

    // -- delivery -----------------------------------------------------------

    /// Make one signed attempt, then log it and update the counters.
    async fn deliver(&self, endpoint: &WebhookEndpoint, topic: &str, body: &[u8]) -> DeliveryRecord {
        let started = Instant::now();

        let (status_code, response_body, error) = match self.post(endpoint, topic, body).await {
            Ok((status, excerpt)) => {
                let error = (!(200..300).contains(&status))
                    .then(|| WebhookError::HttpStatus(status).to_string());
                (Some(status), excerpt, error)
            }
            Err(e) => (None, None, Some(e.to_string())),
        };

        let record = DeliveryRecord {
            id: Uuid::new_v4(),
            webhook_id: endpoint.id.clone(),
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(body).into_owned(),
            status_code,
            response_body,
            error,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            delivered_at: Utc::now(),
        };

        if record.is_success() {
            tracing::info!(
                webhook_id = %endpoint.id,
                url = %endpoint.url,
                topic,
                status = status_code,
                duration_ms = record.duration_ms,
                "Webhook delivered"
            );
        } else {
            tracing::warn!(
                webhook_id = %endpoint.id,
                url = %endpoint.url,
                topic,
                status = status_code,
                error = record.error.as_deref().unwrap_or("-"),
                "Webhook delivery failed"
            );
        }

        self.log_delivery(&record).await;
        record
    }

    /// Execute a single POST and read the start of the response body.
    async fn post(
        &self,
        endpoint: &WebhookEndpoint,
        topic: &str,
        body: &[u8],
    ) -> Result<(u16, Option<String>), WebhookError> {
        let signature = compute_webhook_hmac(&endpoint.secret, body);
        let response = self
            .client
            .post(&endpoint.url)
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_HEADER, topic)
            .header(WEBHOOK_ID_HEADER, endpoint.id.as_str())
            .body(body.to_vec())
            .send()
            .await?;

        let status = response.status().as_u16();
        Ok((status, self.read_excerpt(response).await))
    }

    /// Read at most `max_response_bytes` of the body. A body that fails
    /// halfway keeps what was read.
    async fn read_excerpt(&self, mut response: reqwest::Response) -> Option<String> {
        let limit = self.config.max_response_bytes;
        let mut buf = Vec::new();
        while buf.len() < limit {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let take = chunk.len().min(limit - buf.len());
                    buf.extend_from_slice(&chunk[..take]);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "Failed to read webhook response body");
                    break;
                }
            }
        }
        (!buf.is_empty()).then(|| String::from_utf8_lossy(&buf).into_owned())
    }

    async fn log_delivery(&self, record: &DeliveryRecord) {
        if let Err(e) = self.store.record_delivery(record.clone()).await {
            tracing::error!(webhook_id = %record.webhook_id, error = %e, "Failed to log webhook delivery");
        }
        if let Err(e) = self
            .store
            .update_delivery_stats(
                &record.webhook_id,
                record.is_success(),
                record.status_code,
                record.delivered_at,
            )
            .await
        {
            tracing::error!(webhook_id = %record.webhook_id, error = %e, "Failed to update webhook stats");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
