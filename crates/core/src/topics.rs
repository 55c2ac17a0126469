//! Topic names and the payloads published under them.
//!
//! Topic names are dot-separated lowercase strings. They are the wire
//! contract between producers and subscribers, including consumers in other
//! processes that receive events through the broker bridge.

use serde::{Deserialize, Serialize};

use crate::types::{OrgId, Timestamp};

// ---------------------------------------------------------------------------
// Topic names
// ---------------------------------------------------------------------------

/// New contact added to a list.
pub const CONTACT_CREATED: &str = "contact.created";
/// Contact unsubscribed from a list.
pub const CONTACT_UNSUBSCRIBED: &str = "contact.unsubscribed";

pub const EMAIL_SENT: &str = "email.sent";
/// Hard or soft bounce reported by the mail provider.
pub const EMAIL_BOUNCED: &str = "email.bounced";
/// Recipient marked the message as spam.
pub const EMAIL_COMPLAINED: &str = "email.complained";
pub const EMAIL_OPENED: &str = "email.opened";
pub const EMAIL_CLICKED: &str = "email.clicked";

/// Inbound provider webhook accepted by the HTTP layer.
pub const WEBHOOK_RECEIVED: &str = "webhook.received";

/// Topic used for manual endpoint test deliveries.
pub const WEBHOOK_TEST: &str = "test";

/// Wildcard entry in an endpoint's topic list.
pub const WILDCARD: &str = "*";

/// Topics forwarded to external webhook endpoints.
pub const WEBHOOK_TOPICS: &[&str] = &[
    CONTACT_CREATED,
    CONTACT_UNSUBSCRIBED,
    EMAIL_SENT,
    EMAIL_BOUNCED,
    EMAIL_OPENED,
    EMAIL_CLICKED,
];

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Emitted for contact lifecycle changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactEvent {
    pub org_id: OrgId,
    pub contact_id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_id: Option<String>,
    /// How the contact was added (form, import, api).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub timestamp: Timestamp,
}

/// Emitted for outbound email lifecycle changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailEvent {
    pub org_id: OrgId,
    pub email_id: String,
    pub contact_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_id: Option<String>,
    /// Automation sequence that sent the email, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// One of `sent`, `bounced`, `complained`, `opened`, `clicked`.
    pub status: String,
    /// `hard` or `soft` for bounces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounce_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clicked_url: Option<String>,
    pub timestamp: Timestamp,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
