//! Durable event log and subscriber watermarks
//!
//! The [`EventStore`] is the narrow interface the bus and the housekeeper
//! share with the platform's relational store: an append-only log of every
//! raised event plus one watermark per subscriber recording the last event
//! id it has confirmed processing.

use crate::error::{EventError, Result};
use crate::types::EventRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Durable, queryable log of raised events
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a record, returning the assigned monotonic id
    async fn append(&self, record: EventRecord) -> Result<u64>;

    /// All events raised by `service` with an id greater than `marker`,
    /// ascending by id
    async fn query_after(&self, service: &str, marker: u64) -> Result<Vec<EventRecord>>;

    /// Last event id the given subscriber has confirmed (0 when none)
    async fn find_marker(&self, subscriber: &str) -> Result<u64>;

    /// Advance the subscriber's watermark; never moves backwards
    async fn advance_marker(&self, subscriber: &str, id: u64) -> Result<()>;
}

/// In-memory event store for tests and single-process deployments
#[derive(Default)]
pub struct MemoryEventStore {
    events: RwLock<Vec<EventRecord>>,
    markers: RwLock<HashMap<String, u64>>,
}

impl MemoryEventStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Total events appended so far
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    /// True when no event has been appended
    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, mut record: EventRecord) -> Result<u64> {
        let mut events = self.events.write().await;
        let id = events.len() as u64 + 1;
        record.id = id;

        tracing::debug!(
            event_id = id,
            service = %record.service,
            entity_type = %record.entity_type,
            "Event appended"
        );

        events.push(record);
        Ok(id)
    }

    async fn query_after(&self, service: &str, marker: u64) -> Result<Vec<EventRecord>> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|e| e.service == service && e.id > marker)
            .cloned()
            .collect())
    }

    async fn find_marker(&self, subscriber: &str) -> Result<u64> {
        let markers = self.markers.read().await;
        Ok(markers.get(subscriber).copied().unwrap_or(0))
    }

    async fn advance_marker(&self, subscriber: &str, id: u64) -> Result<()> {
        let mut markers = self.markers.write().await;
        let current = markers.entry(subscriber.to_string()).or_insert(0);
        if id > *current {
            *current = id;
            Ok(())
        } else if id == *current {
            Ok(())
        } else {
            Err(EventError::Store(format!(
                "Refusing to move marker for '{}' backwards ({} -> {})",
                subscriber, current, id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityOperation;

    fn record(service: &str, entity_id: u64) -> EventRecord {
        EventRecord::new("ctx", 1, service, service, entity_id, EntityOperation::Create)
    }

    #[tokio::test]
    async fn test_append_assigns_monotonic_ids() {
        let store = MemoryEventStore::new();
        assert_eq!(store.append(record("account", 1)).await.unwrap(), 1);
        assert_eq!(store.append(record("device", 2)).await.unwrap(), 2);
        assert_eq!(store.append(record("account", 3)).await.unwrap(), 3);
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_query_after_filters_and_orders() {
        let store = MemoryEventStore::new();
        for i in 1..=5 {
            store.append(record("account", i)).await.unwrap();
        }
        store.append(record("device", 99)).await.unwrap();

        let events = store.query_after("account", 2).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].id < w[1].id));
        assert!(events.iter().all(|e| e.service == "account" && e.id > 2));

        assert!(store.query_after("account", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_marker_lifecycle() {
        let store = MemoryEventStore::new();
        assert_eq!(store.find_marker("device-registry").await.unwrap(), 0);

        store.advance_marker("device-registry", 4).await.unwrap();
        assert_eq!(store.find_marker("device-registry").await.unwrap(), 4);

        // advancing to the same id is fine, moving backwards is not
        store.advance_marker("device-registry", 4).await.unwrap();
        assert!(store.advance_marker("device-registry", 2).await.is_err());
        assert_eq!(store.find_marker("device-registry").await.unwrap(), 4);
    }
}
