/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Organizations are identified by opaque string ids.
pub type OrgId = String;

/// Webhook endpoints are identified by opaque string ids.
pub type WebhookId = String;
