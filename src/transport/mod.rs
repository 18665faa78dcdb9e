//! Transport abstraction — the seam between the bus and the message broker
//!
//! The bus only needs topics per address, durable shared consumers keyed by
//! name, and acknowledgement tied to listener success. Backends implement
//! these traits; the bridge, pools, and housekeeper never touch broker
//! specifics.

use crate::config::BusConfig;
use crate::error::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::broadcast;

pub mod memory;
pub mod nats;

/// Factory for transport connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a fresh connection to the broker
    async fn connect(&self, config: &BusConfig) -> Result<Box<dyn TransportConnection>>;

    /// Transport name (e.g. "nats", "memory")
    fn name(&self) -> &str;
}

/// One live broker connection and everything bound to it
///
/// A connection is disposable: on failure the bridge opens a new one and
/// closes the old, it never repairs a connection in place.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Create a sender bound to one destination address
    async fn create_sender(&self, address: &str) -> Result<Box<dyn TransportSender>>;

    /// Attach a consumer session to the durable shared group
    /// `(address, durable_name)`
    ///
    /// Multiple sessions on the same group load-balance deliveries while the
    /// broker treats them as one logical redelivery group. Messages queued
    /// while no session was attached are redelivered to the next one.
    async fn create_consumer(
        &self,
        address: &str,
        durable_name: &str,
    ) -> Result<Box<dyn TransportConsumer>>;

    /// Receiver for asynchronous connection failure notifications
    ///
    /// The reconnection supervisor is the only intended subscriber.
    fn failure_signal(&self) -> broadcast::Receiver<String>;

    /// Close the connection; senders and consumers bound to it go stale
    async fn close(&self);
}

/// Pooled, stateful sender bound to one destination address
#[async_trait]
pub trait TransportSender: Send {
    /// Transmit one encoded event payload
    async fn send(&mut self, payload: &[u8]) -> Result<()>;

    /// Validation check used on borrow and on return
    fn is_valid(&self) -> bool;

    /// Close the underlying channel/session
    async fn close(&mut self);
}

/// One consumer session of a durable shared subscription
#[async_trait]
pub trait TransportConsumer: Send {
    /// Next delivery, or `None` when the session has ended
    async fn next(&mut self) -> Result<Option<Delivery>>;
}

/// A received message pending acknowledgement
pub struct Delivery {
    /// Encoded event payload
    pub payload: Vec<u8>,

    /// Number of delivery attempts for this message, this one included
    pub num_delivered: u64,

    /// Ack callback — confirms processing
    ack_fn: Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>,

    /// Nak callback — requests redelivery
    nak_fn: Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>,
}

impl Delivery {
    /// Create a delivery with ack/nak callbacks
    pub fn new(
        payload: Vec<u8>,
        num_delivered: u64,
        ack_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
        nak_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            payload,
            num_delivered,
            ack_fn: Box::new(ack_fn),
            nak_fn: Box::new(nak_fn),
        }
    }

    /// Acknowledge successful processing
    pub async fn ack(self) -> Result<()> {
        (self.ack_fn)().await
    }

    /// Negative-acknowledge, forcing redelivery
    pub async fn nak(self) -> Result<()> {
        (self.nak_fn)().await
    }
}
