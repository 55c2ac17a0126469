//! Type-erased event payloads and connection handles.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;

/// Anything that can travel through the bus.
///
/// Implemented for every `Serialize + Debug + Send + Sync + 'static` type.
/// The bus carries payloads as `Arc<dyn Payload>` and subscribers get them
/// back as their concrete type through a checked downcast.
pub trait Payload: Any + Send + Sync + fmt::Debug {
    /// Generic serializable form, used by the broker bridge and webhooks.
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error>;

    /// Name of the concrete type, for type-mismatch diagnostics.
    fn type_name(&self) -> &'static str;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> Payload for T
where
    T: Serialize + Any + Send + Sync + fmt::Debug,
{
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Recover the concrete type of a payload.
///
/// On mismatch the name of the actual type is returned.
pub fn downcast_payload<T: Payload>(payload: Arc<dyn Payload>) -> Result<Arc<T>, &'static str> {
    let found = payload.type_name();
    payload.into_any().downcast::<T>().map_err(|_| found)
}

/// Generic structured form used for remote events without a registered
/// decoder.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// A client connection an event was emitted on behalf of.
///
/// The bus never inspects the connection; it is handed unchanged to
/// handlers registered with [`Handler::with_connection`](crate::Handler::with_connection).
pub trait Connection: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

pub type ConnectionHandle = Arc<dyn Connection>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    #[test]
    fn downcast_to_matching_type() {
        let payload: Arc<dyn Payload> = Arc::new(Ping { n: 7 });
        let ping = downcast_payload::<Ping>(payload).unwrap();
        assert_eq!(ping.n, 7);
    }

    #[test]
    fn downcast_reports_actual_type_on_mismatch() {
        let payload: Arc<dyn Payload> = Arc::new(String::from("hello"));
        let found = downcast_payload::<Ping>(payload).unwrap_err();
        assert_eq!(found, std::any::type_name::<String>());
    }

    #[test]
    fn to_json_uses_serde() {
        let payload: Arc<dyn Payload> = Arc::new(Ping { n: 3 });
        assert_eq!(payload.to_json().unwrap(), serde_json::json!({"n": 3}));
    }
}
