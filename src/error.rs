//! Error types for nimbus-event

use thiserror::Error;

/// Errors that can occur in the event bus
#[derive(Debug, Error)]
pub enum EventError {
    /// Transport connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publish failure
    #[error("Failed to publish event to address '{address}': {reason}")]
    Publish { address: String, reason: String },

    /// Subscribe failure
    #[error("Failed to subscribe to address '{address}': {reason}")]
    Subscribe { address: String, reason: String },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Message codec failure (malformed or foreign payload)
    #[error("Codec error: {0}")]
    Codec(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Sender pool exhausted — no sender became available within the borrow wait
    #[error("Sender pool for address '{address}' exhausted after waiting {waited_ms}ms")]
    PoolExhausted { address: String, waited_ms: u64 },

    /// Sender pool is closed (bridge teardown in progress)
    #[error("Sender pool for address '{address}' is closed")]
    PoolClosed { address: String },

    /// A subscribed listener rejected a delivery
    #[error("Listener '{name}' failed to process event: {reason}")]
    Listener { name: String, reason: String },

    /// Event store failure
    #[error("Event store error: {0}")]
    Store(String),

    /// Bus not started, or already stopped
    #[error("Event bus is not running: {0}")]
    NotRunning(String),

    /// Acknowledgement failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Result type alias for event bus operations
pub type Result<T> = std::result::Result<T, EventError>;
