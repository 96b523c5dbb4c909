use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use txevents_core::EventId;

/// Opaque key/value annotations travelling with a message (tracing, routing hints).
pub type Metadata = BTreeMap<String, String>;

/// The unit handed to the bus.
///
/// Notes:
/// - `id` is assigned once by the writer and survives redelivery, so consumers
///   de-duplicate on it.
/// - `payload` is the serialized business event; the bus never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: EventId,
    payload: JsonValue,
    #[serde(default)]
    metadata: Metadata,
}

impl Message {
    pub fn new(id: EventId, payload: JsonValue, metadata: Metadata) -> Self {
        Self {
            id,
            payload,
            metadata,
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Decode the payload into a typed event.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        E::deserialize(&self.payload)
    }
}
