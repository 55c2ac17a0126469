//! Webhook HMAC signing.
//!
//! Every outbound webhook body is signed with the endpoint's secret and the
//! hex digest is sent in the `X-Webhook-Signature` header. Receivers call
//! [`verify_webhook_hmac`] over the raw body they received.

use hmac::{Hmac, Mac};
use sha2::Sha256;

// ---------------------------------------------------------------------------
// Header names
// ---------------------------------------------------------------------------

/// Hex-encoded HMAC-SHA256 of the request body.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Topic name of the delivered event.
pub const EVENT_HEADER: &str = "X-Webhook-Event";

/// Id of the endpoint the delivery was made for.
pub const WEBHOOK_ID_HEADER: &str = "X-Webhook-ID";

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

type HmacSha256 = Hmac<Sha256>;

fn mac_for(secret: &str) -> HmacSha256 {
    HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length")
}

/// Compute an HMAC-SHA256 signature for a webhook body.
///
/// The `secret` is the endpoint-specific signing secret. The `body` is the
/// exact byte sequence being delivered. Returns the lowercase hex digest.
pub fn compute_webhook_hmac(secret: &str, body: &[u8]) -> String {
    let mut mac = mac_for(secret);
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Check a hex signature against `body` in constant time.
///
/// Returns `false` for signatures that are not valid hex.
pub fn verify_webhook_hmac(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let mut mac = mac_for(secret);
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

// ---------------------------------------------------------------------------
// hex helpers (no extra dep)
// ---------------------------------------------------------------------------

mod hex {
    /// Encode bytes as a lowercase hex string.
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Decode a hex string, accepting either case.
    pub fn decode(s: &str) -> Option<Vec<u8>> {
        if s.len() % 2 != 0 {
            return None;
        }
        (0..s.len())
            .step_by(2)
            .map(|i| s.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
