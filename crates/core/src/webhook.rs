//! Webhook endpoint and delivery-log models.
//!
//! Endpoints are owned by an external store and referenced by id. A
//! [`DeliveryRecord`] is appended for every delivery attempt; it is an audit
//! entry, not a retry queue.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::topics::WILDCARD;
use crate::types::{OrgId, Timestamp, WebhookId};

// ---------------------------------------------------------------------------
// EndpointTopics
// ---------------------------------------------------------------------------

/// The set of topics an endpoint wants to receive.
///
/// Stored and exchanged as a comma-separated list; a `*` entry anywhere in
/// the list subscribes the endpoint to every topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EndpointTopics {
    All,
    Only(BTreeSet<String>),
}

impl EndpointTopics {
    /// Parse a comma-separated topic list, trimming whitespace and skipping
    /// empty entries.
    pub fn parse(list: &str) -> Self {
        let mut topics = BTreeSet::new();
        for topic in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if topic == WILDCARD {
                return Self::All;
            }
            topics.insert(topic.to_string());
        }
        Self::Only(topics)
    }

    /// Whether an event on `topic` should be delivered.
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(topics) => topics.contains(topic),
        }
    }
}

impl From<String> for EndpointTopics {
    fn from(list: String) -> Self {
        Self::parse(&list)
    }
}

impl From<EndpointTopics> for String {
    fn from(topics: EndpointTopics) -> Self {
        topics.to_string()
    }
}

impl fmt::Display for EndpointTopics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str(WILDCARD),
            Self::Only(topics) => {
                let joined: Vec<&str> = topics.iter().map(String::as_str).collect();
                f.write_str(&joined.join(","))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// WebhookEndpoint
// ---------------------------------------------------------------------------

/// Aggregate delivery counters kept on each endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryCounters {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    /// `None` when the latest attempt got no HTTP response.
    pub last_status: Option<u16>,
    pub last_delivery_at: Option<Timestamp>,
}

impl DeliveryCounters {
    /// Fold one delivery outcome into the counters.
    pub fn record(&mut self, success: bool, status: Option<u16>, at: Timestamp) {
        self.total += 1;
        if success {
            self.success += 1;
        } else {
            self.failed += 1;
        }
        self.last_status = status;
        self.last_delivery_at = Some(at);
    }
}

/// An external HTTP endpoint registered by an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: WebhookId,
    pub org_id: OrgId,
    pub url: String,
    pub secret: String,
    pub topics: EndpointTopics,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub counters: DeliveryCounters,
}

fn default_active() -> bool {
    true
}

impl WebhookEndpoint {
    /// Whether this endpoint should receive an event on `topic`.
    pub fn accepts(&self, topic: &str) -> bool {
        self.active && self.topics.matches(topic)
    }
}

// ---------------------------------------------------------------------------
// DeliveryRecord
// ---------------------------------------------------------------------------

/// One webhook delivery attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: uuid::Uuid,
    pub webhook_id: WebhookId,
    pub topic: String,
    /// The exact body that was signed and sent.
    pub payload: String,
    /// `None` when no HTTP response was received.
    pub status_code: Option<u16>,
    /// First bytes of the response body, if any.
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub delivered_at: Timestamp,
}

impl DeliveryRecord {
    /// Only 2xx responses count as successful deliveries.
    pub fn is_success(&self) -> bool {
        matches!(self.status_code, Some(code) if (200..300).contains(&code))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
