//! Core event types for the nimbus-event bus
//!
//! All types use camelCase JSON serialization for wire compatibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operation performed on a domain entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityOperation {
    Create,
    Update,
    Delete,
}

/// Send status of a raised event
///
/// An event is `Triggered` when the raising service appends it to the
/// event store, `Sent` after a successful bus publish, and `SendError`
/// when the publish failed (the housekeeper will catch it up).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventStatus {
    #[default]
    Triggered,
    Sent,
    SendError,
}

/// Immutable record of a state change raised by a service
///
/// Append-only log entry owned by the [`EventStore`](crate::store::EventStore);
/// also the payload carried on the wire between services. The `context_id`
/// links every event raised within one logical call chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Store-assigned monotonic id (0 = not yet appended)
    #[serde(default)]
    pub id: u64,

    /// Call-chain correlation id, propagated across publish/deliver boundaries
    pub context_id: String,

    /// Tenant scope the operation ran under
    pub scope_id: u64,

    /// Service that raised the event (e.g. "account", "device")
    pub service: String,

    /// Entity type the operation touched (e.g. "account", "device")
    pub entity_type: String,

    /// Id of the entity the operation touched
    pub entity_id: u64,

    /// Operation performed
    pub operation: EntityOperation,

    /// When the event was raised
    pub timestamp: DateTime<Utc>,

    /// User that triggered the operation
    pub user_id: u64,

    /// Operation inputs, as recorded by the raising service
    #[serde(default)]
    pub inputs: serde_json::Value,

    /// Operation outputs
    #[serde(default)]
    pub outputs: serde_json::Value,

    /// Send status at the time of the last status update
    #[serde(default)]
    pub status: EventStatus,

    /// Free-form note
    #[serde(default)]
    pub note: String,
}

impl EventRecord {
    /// Create a new event record bound to an existing call-chain context
    pub fn new(
        context_id: impl Into<String>,
        scope_id: u64,
        service: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: u64,
        operation: EntityOperation,
    ) -> Self {
        Self {
            id: 0,
            context_id: context_id.into(),
            scope_id,
            service: service.into(),
            entity_type: entity_type.into(),
            entity_id,
            operation,
            timestamp: Utc::now(),
            user_id: 0,
            inputs: serde_json::Value::Null,
            outputs: serde_json::Value::Null,
            status: EventStatus::Triggered,
            note: String::new(),
        }
    }

    /// Create an empty frame carrying only a context id
    ///
    /// Used by [`EventScope::begin`](crate::context::EventScope::begin); the
    /// caller fills in the remaining fields before raising the event.
    pub fn with_context(context_id: impl Into<String>) -> Self {
        Self::new(context_id, 0, "", "", 0, EntityOperation::Create)
    }

    /// Set the user that triggered the operation
    pub fn with_user(mut self, user_id: u64) -> Self {
        self.user_id = user_id;
        self
    }

    /// Attach operation inputs
    pub fn with_inputs(mut self, inputs: serde_json::Value) -> Self {
        self.inputs = inputs;
        self
    }

    /// Attach operation outputs
    pub fn with_outputs(mut self, outputs: serde_json::Value) -> Self {
        self.outputs = outputs;
        self
    }
}

/// Build the wire address for a service's event topic
///
/// Services publish and subscribe on `events.<service-name>`.
pub fn event_address(service: &str) -> String {
    format!("events.{}", service)
}
