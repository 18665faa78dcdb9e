//! NATS JetStream integration tests
//!
//! These tests require a running NATS server with JetStream enabled:
//!   nats-server -js
//!
//! Tests are skipped automatically if NATS is not available. Each test
//! publishes under its own unique service name, so they share one test
//! stream without interfering.

use async_trait::async_trait;
use nimbus_event::transport::nats::NatsTransport;
use nimbus_event::{
    BusConfig, EntityOperation, EventBus, EventError, EventListener, EventRecord, EventScope,
    Result,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Try to start a bus against NATS. Returns None if the server is unavailable.
async fn try_nats_bus() -> Option<Arc<EventBus>> {
    let config = BusConfig {
        stream_name: "NIMBUS_EVENTS_TEST".to_string(),
        reconnect_backoff: Duration::from_millis(100),
        ..BusConfig::default().with_url("nats://127.0.0.1:4222")
    };

    let bus = Arc::new(EventBus::new(NatsTransport::new(), config));
    match bus.start().await {
        Ok(()) => Some(bus),
        Err(_) => {
            eprintln!("NATS not available, skipping integration test");
            None
        }
    }
}

/// Helper to create a started bus, or skip the test
macro_rules! nats_bus {
    () => {
        match try_nats_bus().await {
            Some(bus) => bus,
            None => return,
        }
    };
}

/// Unique service name so parallel and repeated runs stay isolated
fn unique_service(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

fn deleted(service: &str, entity_id: u64) -> EventRecord {
    EventRecord::new("ctx-nats", 1, service, service, entity_id, EntityOperation::Delete)
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<EventRecord>>,
}

#[async_trait]
impl EventListener for RecordingListener {
    async fn on_event(&self, _scope: &mut EventScope, event: &EventRecord) -> Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

struct FailOnceListener {
    attempts: AtomicUsize,
    succeeded: AtomicUsize,
}

#[async_trait]
impl EventListener for FailOnceListener {
    async fn on_event(&self, _scope: &mut EventScope, _event: &EventRecord) -> Result<()> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(EventError::Listener {
                name: "fail-once".to_string(),
                reason: "transient".to_string(),
            });
        }
        self.succeeded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_nats_publish_subscribe_roundtrip() {
    let bus = nats_bus!();
    let service = unique_service("acct");

    let listener = Arc::new(RecordingListener::default());
    bus.subscribe(&service, &format!("{}-sub", service), listener.clone())
        .await
        .unwrap();

    bus.publish(&service, &deleted(&service, 42)).await.unwrap();

    assert!(
        eventually(|| async {
            listener
                .events
                .lock()
                .await
                .iter()
                .any(|e| e.entity_id == 42)
        })
        .await,
        "published event never reached the listener"
    );

    bus.stop().await;
}

#[tokio::test]
async fn test_nats_durable_consumer_receives_backlog() {
    let bus = nats_bus!();
    let service = unique_service("backlog");

    // publish before anyone subscribes; the stream retains the message
    bus.publish(&service, &deleted(&service, 7)).await.unwrap();

    let listener = Arc::new(RecordingListener::default());
    bus.subscribe(&service, &format!("{}-sub", service), listener.clone())
        .await
        .unwrap();

    assert!(
        eventually(|| async { !listener.events.lock().await.is_empty() }).await,
        "durable consumer should receive the retained message"
    );

    bus.stop().await;
}

#[tokio::test]
async fn test_nats_nak_triggers_redelivery() {
    let bus = nats_bus!();
    let service = unique_service("retry");

    let listener = Arc::new(FailOnceListener {
        attempts: AtomicUsize::new(0),
        succeeded: AtomicUsize::new(0),
    });
    bus.subscribe(&service, &format!("{}-sub", service), listener.clone())
        .await
        .unwrap();

    bus.publish(&service, &deleted(&service, 9)).await.unwrap();

    assert!(
        eventually(|| async { listener.succeeded.load(Ordering::SeqCst) == 1 }).await,
        "nak'd delivery should be retried"
    );
    assert!(listener.attempts.load(Ordering::SeqCst) >= 2);

    bus.stop().await;
}

#[tokio::test]
async fn test_nats_concurrent_publish() {
    let bus = nats_bus!();
    let service = unique_service("load");

    let listener = Arc::new(RecordingListener::default());
    bus.subscribe(&service, &format!("{}-sub", service), listener.clone())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let bus = bus.clone();
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            bus.publish(&service, &deleted(&service, i)).await.unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(
        eventually(|| async { listener.events.lock().await.len() == 20 }).await,
        "all concurrent publishes should be delivered"
    );

    bus.stop().await;
}

#[tokio::test]
async fn test_nats_stop_is_clean() {
    let bus = nats_bus!();
    let service = unique_service("stop");

    bus.publish(&service, &deleted(&service, 1)).await.unwrap();
    bus.stop().await;
    bus.stop().await;

    assert!(matches!(
        bus.publish(&service, &deleted(&service, 2)).await.unwrap_err(),
        EventError::NotRunning(_)
    ));
}
