//! Per-topic decoders for remote payloads.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::payload::Payload;
use crate::snapshot::SnapshotCell;

type DecodeFn = Arc<dyn Fn(Value) -> Result<Arc<dyn Payload>, serde_json::Error> + Send + Sync>;

/// Maps topics to the concrete payload type remote events should be decoded
/// into. Topics without a decoder arrive as a [`JsonMap`](crate::JsonMap), or as a raw
/// [`Value`] when the payload is not a JSON object.
pub(crate) struct DecoderRegistry {
    cell: SnapshotCell<HashMap<String, DecodeFn>>,
}

impl DecoderRegistry {
    pub(crate) fn new() -> Self {
        Self {
            cell: SnapshotCell::new(HashMap::new()),
        }
    }

    /// Decode payloads on `topic` as `T` from now on, replacing any earlier
    /// registration for the topic.
    pub(crate) fn register<T>(&self, topic: &str)
    where
        T: Payload + DeserializeOwned,
    {
        let decode: DecodeFn = Arc::new(|value: Value| {
            let typed: T = serde_json::from_value(value)?;
            Ok(Arc::new(typed) as Arc<dyn Payload>)
        });
        self.cell.update(|current| {
            let mut next = current.clone();
            next.insert(topic.to_string(), Arc::clone(&decode));
            Some((next, ()))
        });
    }

    pub(crate) fn decode(&self, topic: &str, value: Value) -> Result<Arc<dyn Payload>, serde_json::Error> {
        if let Some(decode) = self.cell.load().get(topic) {
            return decode(value);
        }
        Ok(match value {
            Value::Object(map) => Arc::new(map) as Arc<dyn Payload>,
            other => Arc::new(other),
        })
    }
}
