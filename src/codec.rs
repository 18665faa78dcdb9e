//! Message codec registry
//!
//! Codecs are a compile-time enum selected by the configured codec name at
//! bus start. An unknown name fails `start()` with a configuration error.

use crate::error::{EventError, Result};
use crate::types::EventRecord;

/// Wire codec for event records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCodec {
    /// JSON, camelCase field names
    Json,
}

impl EventCodec {
    /// Resolve a codec by its configured name
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "json" => Ok(EventCodec::Json),
            other => Err(EventError::Config(format!(
                "Unknown event bus message codec '{}'",
                other
            ))),
        }
    }

    /// Codec name as used in configuration
    pub fn name(&self) -> &'static str {
        match self {
            EventCodec::Json => "json",
        }
    }

    /// Serialize an event record for the wire
    pub fn encode(&self, record: &EventRecord) -> Result<Vec<u8>> {
        match self {
            EventCodec::Json => Ok(serde_json::to_vec(record)?),
        }
    }

    /// Deserialize an event record from a wire payload
    pub fn decode(&self, payload: &[u8]) -> Result<EventRecord> {
        match self {
            EventCodec::Json => serde_json::from_slice(payload)
                .map_err(|e| EventError::Codec(format!("Malformed event payload: {}", e))),
        }
    }
}
