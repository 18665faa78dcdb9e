//! Inter-service event bus with at-least-once delivery and catch-up
//! reconciliation.
//!
//! Services raise entity lifecycle events ([`EventRecord`]) inside an
//! explicit call-chain context ([`EventScope`]), publish them through the
//! [`EventBus`], and subscribe listeners under durable names so delivery
//! survives restarts. A [`Housekeeper`] periodically replays stored events
//! past each subscriber's watermark, closing the gap left by downtime or
//! connection loss.
//!
//! # Example
//!
//! ```no_run
//! use nimbus_event::{
//!     BusConfig, EntityOperation, EventBus, EventRecord, EventScope,
//!     transport::nats::NatsTransport,
//! };
//!
//! # async fn example() -> nimbus_event::Result<()> {
//! let bus = EventBus::new(NatsTransport, BusConfig::default().with_url("nats://localhost:4222"));
//! bus.start().await?;
//!
//! let mut scope = EventScope::new();
//! let record = scope.begin();
//! record.scope_id = 1;
//! record.service = "account".to_string();
//! record.entity_type = "account".to_string();
//! record.entity_id = 42;
//! record.operation = EntityOperation::Delete;
//!
//! let event = record.clone();
//! bus.publish("account", &event).await?;
//! scope.end();
//! # Ok(())
//! # }
//! ```

mod bridge;
mod bus;
mod codec;
mod config;
mod context;
mod dlq;
mod error;
mod housekeeper;
mod listener;
mod pool;
mod store;
pub mod transport;
mod types;

pub use bridge::Subscription;
pub use bus::{BusState, EventBus};
pub use codec::EventCodec;
pub use config::{BusConfig, HousekeeperConfig, PoolConfig};
pub use context::EventScope;
pub use dlq::{DeadLetterEvent, DlqHandler, MemoryDlqHandler};
pub use error::{EventError, Result};
pub use housekeeper::{Housekeeper, Registration};
pub use listener::EventListener;
pub use pool::{SenderLease, SenderPool};
pub use store::{EventStore, MemoryEventStore};
pub use types::{event_address, EntityOperation, EventRecord, EventStatus};
