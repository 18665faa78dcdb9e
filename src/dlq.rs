//! Dead letter queue — bounded-retry escape hatch for poison messages
//!
//! The transport redelivers any message whose listener failed. Without a
//! bound, a permanently failing listener is retried forever; once a delivery
//! count reaches the configured maximum the bridge routes the message here
//! and acknowledges it instead.

use crate::error::Result;
use crate::types::EventRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A failed event with context about why it ended up in the DLQ
#[derive(Debug, Clone)]
pub struct DeadLetterEvent {
    /// The event that could not be processed
    pub event: EventRecord,

    /// Address the event was delivered on
    pub address: String,

    /// Delivery attempts made before giving up
    pub num_delivered: u64,

    /// Reason the event was dead-lettered
    pub reason: String,

    /// When the event was dead-lettered
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEvent {
    /// Create a new dead letter event
    pub fn new(
        event: EventRecord,
        address: impl Into<String>,
        num_delivered: u64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            event,
            address: address.into(),
            num_delivered,
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Trait for dead letter queue handlers
///
/// Implementations decide what to do with events that exhausted their
/// delivery attempts. They may log, store, forward, or alert.
#[async_trait]
pub trait DlqHandler: Send + Sync {
    /// Handle a dead-lettered event
    async fn handle(&self, event: DeadLetterEvent) -> Result<()>;

    /// Number of events currently in the DLQ
    async fn count(&self) -> Result<usize>;

    /// List recent dead-lettered events, most recent first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEvent>>;
}

/// In-memory DLQ handler for development and testing
pub struct MemoryDlqHandler {
    events: Arc<RwLock<Vec<DeadLetterEvent>>>,
    max_events: usize,
}

impl MemoryDlqHandler {
    /// Create a handler retaining at most `max_events` entries
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            max_events,
        }
    }
}

impl Default for MemoryDlqHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DlqHandler for MemoryDlqHandler {
    async fn handle(&self, event: DeadLetterEvent) -> Result<()> {
        tracing::warn!(
            event_id = event.event.id,
            address = %event.address,
            num_delivered = event.num_delivered,
            reason = %event.reason,
            "Event dead-lettered"
        );

        let mut events = self.events.write().await;
        events.push(event);

        if self.max_events > 0 && events.len() > self.max_events {
            let drain_count = events.len() - self.max_events;
            events.drain(..drain_count);
        }

        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.events.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEvent>> {
        let events = self.events.read().await;
        Ok(events.iter().rev().take(limit).cloned().collect())
    }
}

/// Whether a delivery has exhausted its attempts (`max_deliver` 0 = unlimited)
pub fn should_dead_letter(num_delivered: u64, max_deliver: u64) -> bool {
    max_deliver > 0 && num_delivered >= max_deliver
}
