//! In-process transport for tests and single-process deployments
//!
//! A [`MemoryBroker`] models the broker side of the contract: topics per
//! address, durable shared groups keyed by `(address, durable_name)` that
//! queue messages while no consumer session is attached, and nak-driven
//! redelivery. Test hooks inject connection failures and refuse new
//! connections to exercise the reconnection path.

use crate::config::BusConfig;
use crate::error::{EventError, Result};
use crate::transport::{Delivery, Transport, TransportConnection, TransportConsumer, TransportSender};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch, Notify};

#[derive(Clone)]
struct QueuedMessage {
    payload: Vec<u8>,
    num_delivered: u64,
}

/// One durable shared group: its backlog plus a wakeup for idle sessions
#[derive(Default)]
struct DurableGroup {
    queue: Mutex<VecDeque<QueuedMessage>>,
    notify: Notify,
}

impl DurableGroup {
    fn push_back(&self, message: QueuedMessage) {
        self.queue.lock().expect("group queue lock").push_back(message);
        self.notify.notify_one();
    }

    fn push_front(&self, message: QueuedMessage) {
        self.queue.lock().expect("group queue lock").push_front(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<QueuedMessage> {
        self.queue.lock().expect("group queue lock").pop_front()
    }

    fn len(&self) -> usize {
        self.queue.lock().expect("group queue lock").len()
    }
}

/// Per-connection hooks the broker uses to signal failures
struct ConnectionHooks {
    failure_tx: broadcast::Sender<String>,
    alive_tx: Arc<watch::Sender<bool>>,
}

#[derive(Default)]
struct BrokerInner {
    /// (address, durable_name) → group; survives connection loss
    groups: Mutex<HashMap<(String, String), Arc<DurableGroup>>>,
    connections: Mutex<Vec<ConnectionHooks>>,
    refuse_connections: AtomicBool,
}

/// In-process message broker
///
/// Cheap to clone; all clones share the same topic/group state, so a
/// reconnected [`MemoryConnection`] resumes the durable groups created by
/// an earlier one.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every live connection, notifying their failure signals
    ///
    /// Models a broker-side connection reset; durable groups and their
    /// backlogs are untouched.
    pub fn inject_failure(&self, reason: &str) {
        let mut connections = self.inner.connections.lock().expect("connections lock");
        for hooks in connections.drain(..) {
            hooks.alive_tx.send_replace(false);
            let _ = hooks.failure_tx.send(reason.to_string());
        }
        tracing::info!(reason, "Injected transport failure");
    }

    /// Number of live (not yet closed or failed) connections
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().expect("connections lock").len()
    }

    /// Make subsequent `connect` calls fail until re-enabled
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Undelivered backlog of a durable group (0 when the group is unknown)
    pub fn backlog(&self, address: &str, durable_name: &str) -> usize {
        let groups = self.inner.groups.lock().expect("groups lock");
        groups
            .get(&(address.to_string(), durable_name.to_string()))
            .map(|g| g.len())
            .unwrap_or(0)
    }

    fn publish(&self, address: &str, payload: &[u8]) {
        let groups = self.inner.groups.lock().expect("groups lock");
        for ((group_address, _), group) in groups.iter() {
            if group_address == address {
                group.push_back(QueuedMessage {
                    payload: payload.to_vec(),
                    num_delivered: 0,
                });
            }
        }
    }

    fn group(&self, address: &str, durable_name: &str) -> Arc<DurableGroup> {
        let mut groups = self.inner.groups.lock().expect("groups lock");
        groups
            .entry((address.to_string(), durable_name.to_string()))
            .or_default()
            .clone()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self, _config: &BusConfig) -> Result<Box<dyn TransportConnection>> {
        if self.inner.refuse_connections.load(Ordering::SeqCst) {
            return Err(EventError::Connection(
                "Memory broker is refusing connections".to_string(),
            ));
        }

        let (failure_tx, _) = broadcast::channel(16);
        let (alive_tx, alive_rx) = watch::channel(true);
        let alive_tx = Arc::new(alive_tx);

        {
            let mut connections = self.inner.connections.lock().expect("connections lock");
            connections.push(ConnectionHooks {
                failure_tx: failure_tx.clone(),
                alive_tx: alive_tx.clone(),
            });
        }

        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            failure_tx,
            alive_tx,
            alive_rx,
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// One live connection to a [`MemoryBroker`]
pub struct MemoryConnection {
    broker: MemoryBroker,
    failure_tx: broadcast::Sender<String>,
    alive_tx: Arc<watch::Sender<bool>>,
    alive_rx: watch::Receiver<bool>,
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn create_sender(&self, address: &str) -> Result<Box<dyn TransportSender>> {
        if !*self.alive_rx.borrow() {
            return Err(EventError::Connection(
                "Connection is no longer alive".to_string(),
            ));
        }

        Ok(Box::new(MemorySender {
            broker: self.broker.clone(),
            address: address.to_string(),
            alive_rx: self.alive_rx.clone(),
        }))
    }

    async fn create_consumer(
        &self,
        address: &str,
        durable_name: &str,
    ) -> Result<Box<dyn TransportConsumer>> {
        if !*self.alive_rx.borrow() {
            return Err(EventError::Connection(
                "Connection is no longer alive".to_string(),
            ));
        }

        let group = self.broker.group(address, durable_name);
        tracing::debug!(address, durable_name, "Consumer session attached");

        Ok(Box::new(MemoryConsumer {
            group,
            alive_rx: self.alive_rx.clone(),
        }))
    }

    fn failure_signal(&self) -> broadcast::Receiver<String> {
        self.failure_tx.subscribe()
    }

    async fn close(&self) {
        self.alive_tx.send_replace(false);

        // unregister so the broker does not accumulate stale hooks
        let mut connections = self.broker.inner.connections.lock().expect("connections lock");
        connections.retain(|hooks| !Arc::ptr_eq(&hooks.alive_tx, &self.alive_tx));
    }
}

/// Sender bound to one address of a [`MemoryBroker`]
pub struct MemorySender {
    broker: MemoryBroker,
    address: String,
    alive_rx: watch::Receiver<bool>,
}

#[async_trait]
impl TransportSender for MemorySender {
    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        if !*self.alive_rx.borrow() {
            return Err(EventError::Connection(
                "Sender's connection is no longer alive".to_string(),
            ));
        }

        self.broker.publish(&self.address, payload);
        Ok(())
    }

    fn is_valid(&self) -> bool {
        *self.alive_rx.borrow()
    }

    async fn close(&mut self) {}
}

/// One consumer session pulling from a durable group
pub struct MemoryConsumer {
    group: Arc<DurableGroup>,
    alive_rx: watch::Receiver<bool>,
}

#[async_trait]
impl TransportConsumer for MemoryConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            if !*self.alive_rx.borrow() {
                return Ok(None);
            }

            if let Some(mut message) = self.group.pop() {
                message.num_delivered += 1;
                let num_delivered = message.num_delivered;
                let payload = message.payload.clone();
                let group = self.group.clone();

                return Ok(Some(Delivery::new(
                    payload,
                    num_delivered,
                    || Box::pin(async { Ok(()) }),
                    move || {
                        Box::pin(async move {
                            group.push_front(message);
                            Ok(())
                        })
                    },
                )));
            }

            let notified = self.group.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = self.alive_rx.changed() => {}
            }
        }
    }
}
