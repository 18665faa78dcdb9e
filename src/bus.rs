//! Event bus façade — publish, subscribe, lifecycle, reconnection
//!
//! The bus owns the subscription registry and the active
//! [`ConnectionBridge`], held as an atomically swapped handle. A supervisor
//! task listens on the bridge's failure signal; on failure it tears the
//! broken bridge down, opens a fresh one, replays every recorded
//! subscription onto it, and swaps it in — looping with a fixed backoff
//! until the connection is restored. Publishers fail fast while no bridge
//! is live.

use crate::bridge::{wait_shutdown, ConnectionBridge, Subscription};
use crate::codec::EventCodec;
use crate::config::BusConfig;
use crate::dlq::DlqHandler;
use crate::error::{EventError, Result};
use crate::listener::EventListener;
use crate::transport::Transport;
use crate::types::EventRecord;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Connection state of the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Stopped,
    Connected,
    Reconnecting,
}

struct BusInner {
    transport: Arc<dyn Transport>,
    config: BusConfig,
    dlq: Option<Arc<dyn DlqHandler>>,
    codec: RwLock<Option<EventCodec>>,
    /// The active bridge; `None` while stopped or reconnecting
    bridge: RwLock<Option<Arc<ConnectionBridge>>>,
    /// Recorded subscriptions, replayed onto every new bridge
    subscriptions: RwLock<Vec<Subscription>>,
    state_tx: watch::Sender<BusState>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Inter-service event bus with at-least-once delivery
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus over the given transport; call [`start`](Self::start)
    /// before publishing or subscribing
    pub fn new(transport: impl Transport + 'static, config: BusConfig) -> Self {
        let (state_tx, _) = watch::channel(BusState::Stopped);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(BusInner {
                transport: Arc::new(transport),
                config,
                dlq: None,
                codec: RwLock::new(None),
                bridge: RwLock::new(None),
                subscriptions: RwLock::new(Vec::new()),
                state_tx,
                shutdown_tx,
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Route poison messages to the given dead letter handler
    pub fn with_dlq(mut self, dlq: Arc<dyn DlqHandler>) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_dlq must be called before the bus is shared");
        inner.dlq = Some(dlq);
        self
    }

    /// Transport name backing this bus
    pub fn transport_name(&self) -> &str {
        self.inner.transport.name()
    }

    /// Watch the bus connection state
    pub fn state(&self) -> watch::Receiver<BusState> {
        self.inner.state_tx.subscribe()
    }

    /// Start the bus: resolve the configured codec, open a bridge with every
    /// recorded subscription replayed onto it, and spawn the reconnection
    /// supervisor
    pub async fn start(&self) -> Result<()> {
        if *self.inner.state_tx.borrow() != BusState::Stopped {
            return Err(EventError::Config(
                "Event bus is already started".to_string(),
            ));
        }

        let codec = EventCodec::from_name(&self.inner.config.codec)?;
        *self.inner.codec.write().await = Some(codec);

        // a restart replays every subscription recorded before the stop
        let bridge = rebuild_bridge(&self.inner).await?;
        *self.inner.bridge.write().await = Some(bridge);

        self.inner.shutdown_tx.send_replace(false);
        self.inner.state_tx.send_replace(BusState::Connected);

        let inner = self.inner.clone();
        let shutdown = self.inner.shutdown_tx.subscribe();
        *self.inner.supervisor.lock().await = Some(tokio::spawn(supervise(inner, shutdown)));

        tracing::info!(transport = %self.inner.transport.name(), "Event bus started");
        Ok(())
    }

    /// Publish an event to a service address
    ///
    /// Fails fast with [`EventError::NotRunning`] while no bridge handle is
    /// live. Early in a reconnection the call may still reach the failed
    /// bridge and surface the transport error instead; either way transport
    /// failures come back as bus errors after the sender was returned to its
    /// pool.
    pub async fn publish(&self, address: &str, record: &EventRecord) -> Result<()> {
        let bridge = self.inner.bridge.read().await.clone();
        match bridge {
            Some(bridge) => bridge.publish(address, record).await,
            None => Err(EventError::NotRunning(match *self.inner.state_tx.borrow() {
                BusState::Reconnecting => "connection lost, reconnecting".to_string(),
                _ => "bus is stopped".to_string(),
            })),
        }
    }

    /// Subscribe a listener to a service address under a durable name
    ///
    /// The subscription is recorded for replay across reconnections and
    /// materialized as parallel durable consumer sessions on the live
    /// bridge.
    pub async fn subscribe(
        &self,
        address: &str,
        name: &str,
        listener: Arc<dyn EventListener>,
    ) -> Result<()> {
        if *self.inner.state_tx.borrow() == BusState::Stopped {
            return Err(EventError::NotRunning(
                "start the bus before subscribing".to_string(),
            ));
        }

        let subscription = Subscription::new(address, name, listener);
        self.inner
            .subscriptions
            .write()
            .await
            .push(subscription.clone());

        let bridge = self.inner.bridge.read().await.clone();
        if let Some(bridge) = bridge {
            if let Err(e) = bridge.subscribe(&subscription).await {
                // keep the registry consistent with what is materialized
                let mut subscriptions = self.inner.subscriptions.write().await;
                subscriptions
                    .retain(|s| !(s.address == address && s.durable_name == name));
                return Err(e);
            }
        } else {
            // reconnecting: the supervisor materializes recorded
            // subscriptions on the next bridge
            tracing::warn!(
                address,
                durable = name,
                "Subscription recorded while reconnecting, will attach on the next bridge"
            );
        }

        Ok(())
    }

    /// Stop the bus; idempotent, never fails on an already stopped bus
    pub async fn stop(&self) {
        self.inner.shutdown_tx.send_replace(true);

        if let Some(supervisor) = self.inner.supervisor.lock().await.take() {
            supervisor.abort();
        }

        if let Some(bridge) = self.inner.bridge.write().await.take() {
            bridge.stop().await;
        }

        self.inner.state_tx.send_replace(BusState::Stopped);
        tracing::info!("Event bus stopped");
    }
}

/// Watch the active bridge for failures; single-flight reconnection driver
async fn supervise(inner: Arc<BusInner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let bridge = inner.bridge.read().await.clone();
        let Some(bridge) = bridge else {
            // stopped underneath us
            return;
        };

        // the receiver was subscribed when the bridge opened, so failures
        // fired before this task got polled are still buffered here
        let Some(mut failures) = bridge.take_failure_signal().await else {
            return;
        };

        loop {
            let reason = tokio::select! {
                _ = wait_shutdown(&mut shutdown) => return,
                reason = failures.recv() => reason,
            };

            match reason {
                Ok(reason) => {
                    tracing::error!(reason = %reason, "Event bus connection failed");
                    reconnect(&inner, &mut shutdown).await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    if *shutdown.borrow() {
                        return;
                    }
                    tracing::error!("Event bus connection closed unexpectedly");
                    reconnect(&inner, &mut shutdown).await;
                    break;
                }
            }
        }

        if *shutdown.borrow() {
            return;
        }
    }
}

/// Replace the broken bridge with a fresh one, retrying with a fixed backoff
///
/// The new bridge is fully built and re-subscribed before it is swapped in;
/// the old handle drains and closes after the swap. A rebuild that fails
/// mid-way still tears the old broken bridge down, so the next attempt
/// starts clean.
async fn reconnect(inner: &Arc<BusInner>, shutdown: &mut watch::Receiver<bool>) {
    inner.state_tx.send_replace(BusState::Reconnecting);

    let mut attempt: u64 = 1;
    loop {
        if *shutdown.borrow() {
            return;
        }

        tracing::info!(attempt, "Event bus reconnection attempt");
        match rebuild_bridge(inner).await {
            Ok(bridge) => {
                let old = inner.bridge.write().await.replace(bridge);
                inner.state_tx.send_replace(BusState::Connected);
                tracing::info!(attempt, "Event bus connection restored");

                if let Some(old) = old {
                    tokio::spawn(async move {
                        tracing::info!("Cleaning up previous connection bridge");
                        old.stop().await;
                    });
                }
                return;
            }
            Err(e) => {
                if let Some(old) = inner.bridge.write().await.take() {
                    tracing::info!("Cleaning up failed connection bridge");
                    old.stop().await;
                }
                tracing::error!(
                    attempt,
                    error = %e,
                    "Cannot establish new event bus connection, retrying"
                );
                tokio::select! {
                    _ = wait_shutdown(shutdown) => return,
                    _ = tokio::time::sleep(inner.config.reconnect_backoff) => {}
                }
            }
        }
        attempt += 1;
    }
}

/// Open a new bridge and replay every recorded subscription onto it
///
/// A bridge that fails during re-subscription is stopped before the error
/// propagates, so each attempt starts from a clean slate.
async fn rebuild_bridge(inner: &Arc<BusInner>) -> Result<Arc<ConnectionBridge>> {
    let codec = (*inner.codec.read().await)
        .ok_or_else(|| EventError::NotRunning("codec not initialized".to_string()))?;

    let bridge = ConnectionBridge::open(
        inner.transport.as_ref(),
        &inner.config,
        codec,
        inner.dlq.clone(),
    )
    .await?;

    let subscriptions = inner.subscriptions.read().await.clone();
    for subscription in &subscriptions {
        if let Err(e) = bridge.subscribe(subscription).await {
            bridge.stop().await;
            return Err(e);
        }
    }

    Ok(Arc::new(bridge))
}
