//! Connection bridge — one live transport connection and everything bound to it
//!
//! A bridge owns the connection, the per-address sender pools, and the
//! consumer session tasks of every materialized subscription. Bridges are
//! disposable: on connection failure the supervisor opens a brand-new bridge,
//! re-subscribes onto it, swaps it in, and stops the old one ("replace, don't
//! repair"), so no half-reset state is ever visible to publishers.

use crate::codec::EventCodec;
use crate::config::BusConfig;
use crate::context::EventScope;
use crate::dlq::{should_dead_letter, DeadLetterEvent, DlqHandler};
use crate::error::Result;
use crate::listener::EventListener;
use crate::pool::SenderPool;
use crate::transport::{Delivery, Transport, TransportConnection, TransportConsumer};
use crate::types::{event_address, EventRecord};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

/// A durable, named subscription recorded for replay across reconnections
#[derive(Clone)]
pub struct Subscription {
    /// Service key being listened to (e.g. "account")
    pub address: String,

    /// Durable consumer-group name (e.g. "account-deviceregistry")
    pub durable_name: String,

    /// The subscribing service's handler
    pub listener: Arc<dyn EventListener>,
}

impl Subscription {
    pub fn new(
        address: impl Into<String>,
        durable_name: impl Into<String>,
        listener: Arc<dyn EventListener>,
    ) -> Self {
        Self {
            address: address.into(),
            durable_name: durable_name.into(),
            listener,
        }
    }
}

/// One live connection plus its pools and consumer sessions
pub struct ConnectionBridge {
    connection: Arc<dyn TransportConnection>,
    codec: EventCodec,
    config: BusConfig,
    dlq: Option<Arc<dyn DlqHandler>>,
    /// Per-address sender pools, created lazily on first publish
    pools: DashMap<String, Arc<SenderPool>>,
    sessions: Mutex<Vec<JoinHandle<()>>>,
    /// Failure receiver captured at open time so that failures fired before
    /// the supervisor polls it are buffered, not dropped
    failure_rx: Mutex<Option<broadcast::Receiver<String>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectionBridge {
    /// Open a fresh bridge on a new transport connection
    pub async fn open(
        transport: &dyn Transport,
        config: &BusConfig,
        codec: EventCodec,
        dlq: Option<Arc<dyn DlqHandler>>,
    ) -> Result<Self> {
        let connection: Arc<dyn TransportConnection> =
            Arc::from(transport.connect(config).await?);
        let failure_rx = connection.failure_signal();
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            connection,
            codec,
            config: config.clone(),
            dlq,
            pools: DashMap::new(),
            sessions: Mutex::new(Vec::new()),
            failure_rx: Mutex::new(Some(failure_rx)),
            shutdown_tx,
        })
    }

    /// Take the failure receiver for this bridge's connection
    ///
    /// The receiver exists since [`open`](Self::open), so the taker also sees
    /// failures that fired before the take. `None` once taken.
    pub async fn take_failure_signal(&self) -> Option<broadcast::Receiver<String>> {
        self.failure_rx.lock().await.take()
    }

    /// Publish one event to the given service address
    ///
    /// An empty address is a logged no-op. The borrowed sender is returned
    /// to its pool on every path, success or failure.
    pub async fn publish(&self, address: &str, record: &EventRecord) -> Result<()> {
        if address.trim().is_empty() {
            tracing::warn!("Discarded event publish since the publish address is empty");
            return Ok(());
        }

        let wire_address = event_address(address);
        let payload = self.codec.encode(record)?;

        let pool = self.pool_for(&wire_address).await;
        let mut lease = pool.borrow().await?;
        let result = lease.sender().send(&payload).await;
        pool.give_back(lease).await;

        match &result {
            Ok(()) => tracing::debug!(
                event_id = record.id,
                address = %wire_address,
                "Event published"
            ),
            Err(e) => tracing::error!(
                event_id = record.id,
                address = %wire_address,
                error = %e,
                "Event publish failed"
            ),
        }
        result
    }

    /// Materialize a subscription as N parallel durable consumer sessions
    pub async fn subscribe(&self, subscription: &Subscription) -> Result<()> {
        let wire_address = event_address(&subscription.address);
        let session_count = self.config.consumer_pool_size.max(1);
        let mut sessions = self.sessions.lock().await;

        for session in 0..session_count {
            let consumer = self
                .connection
                .create_consumer(&wire_address, &subscription.durable_name)
                .await?;

            sessions.push(tokio::spawn(consumer_session(
                consumer,
                self.codec,
                subscription.clone(),
                wire_address.clone(),
                session,
                self.config.max_deliver,
                self.dlq.clone(),
                self.shutdown_tx.subscribe(),
            )));
        }

        tracing::info!(
            address = %wire_address,
            durable = %subscription.durable_name,
            sessions = session_count,
            "Subscription materialized"
        );
        Ok(())
    }

    /// Tear the bridge down: connection, consumer sessions, sender pools
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        self.connection.close().await;

        let sessions: Vec<JoinHandle<()>> = self.sessions.lock().await.drain(..).collect();
        for session in sessions {
            session.abort();
        }

        let pools: Vec<Arc<SenderPool>> =
            self.pools.iter().map(|entry| entry.value().clone()).collect();
        self.pools.clear();
        for pool in pools {
            pool.close().await;
        }

        tracing::info!("Connection bridge stopped");
    }

    async fn pool_for(&self, wire_address: &str) -> Arc<SenderPool> {
        let (pool, created) = match self.pools.entry(wire_address.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let pool = Arc::new(SenderPool::new(
                    wire_address,
                    self.connection.clone(),
                    self.config.pool.clone(),
                ));
                entry.insert(pool.clone());
                (pool, true)
            }
        };

        if created {
            pool.start_eviction().await;
        }
        pool
    }
}

/// One consumer session: pulls deliveries until shutdown or session end
#[allow(clippy::too_many_arguments)]
async fn consumer_session(
    mut consumer: Box<dyn TransportConsumer>,
    codec: EventCodec,
    subscription: Subscription,
    wire_address: String,
    session: usize,
    max_deliver: u64,
    dlq: Option<Arc<dyn DlqHandler>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            _ = wait_shutdown(&mut shutdown) => break,
            next = consumer.next() => next,
        };

        match next {
            Ok(Some(delivery)) => {
                handle_delivery(delivery, codec, &subscription, &wire_address, max_deliver, &dlq)
                    .await;
            }
            Ok(None) => {
                tracing::debug!(address = %wire_address, session, "Consumer session ended");
                break;
            }
            Err(e) => {
                tracing::warn!(
                    address = %wire_address,
                    session,
                    error = %e,
                    "Consumer session error"
                );
                break;
            }
        }
    }
}

async fn handle_delivery(
    delivery: Delivery,
    codec: EventCodec,
    subscription: &Subscription,
    wire_address: &str,
    max_deliver: u64,
    dlq: &Option<Arc<dyn DlqHandler>>,
) {
    let num_delivered = delivery.num_delivered;

    // malformed or foreign payloads are discarded, not retried
    let record = match codec.decode(&delivery.payload) {
        Ok(record) => record,
        Err(e) => {
            tracing::error!(
                address = %wire_address,
                error = %e,
                "Discarding undecodable event message"
            );
            if let Err(e) = delivery.ack().await {
                tracing::warn!(error = %e, "Failed to ack discarded message");
            }
            return;
        }
    };

    if should_dead_letter(num_delivered, max_deliver) {
        match dlq {
            Some(dlq) => {
                let dead = DeadLetterEvent::new(
                    record,
                    wire_address,
                    num_delivered,
                    "Max delivery attempts exhausted",
                );
                if let Err(e) = dlq.handle(dead).await {
                    tracing::error!(error = %e, "DLQ handler failed, discarding event anyway");
                }
            }
            None => tracing::error!(
                address = %wire_address,
                num_delivered,
                "Max delivery attempts exhausted and no DLQ configured, discarding event"
            ),
        }
        if let Err(e) = delivery.ack().await {
            tracing::warn!(error = %e, "Failed to ack dead-lettered message");
        }
        return;
    }

    // restore the publisher's call-chain context for the listener,
    // release it unconditionally afterwards
    let mut scope = EventScope::new();
    scope.set(record.clone());
    let result = subscription.listener.on_event(&mut scope, &record).await;
    scope.end();

    match result {
        Ok(()) => {
            if let Err(e) = delivery.ack().await {
                tracing::warn!(event_id = record.id, error = %e, "Failed to ack delivery");
            }
        }
        Err(e) => {
            // leave the message unacknowledged so the transport redelivers it
            tracing::error!(
                event_id = record.id,
                address = %wire_address,
                num_delivered,
                error = %e,
                "Listener failed, message will be redelivered"
            );
            if let Err(e) = delivery.nak().await {
                tracing::warn!(error = %e, "Failed to nak delivery");
            }
        }
    }
}

/// Resolve once the shutdown flag turns true
pub(crate) async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}
