//! Listener collaborator implemented by each subscribing service

use crate::context::EventScope;
use crate::error::Result;
use crate::types::EventRecord;
use async_trait::async_trait;

/// Handles events delivered to a subscribing service
///
/// Implementations must be idempotent: at-least-once transport delivery plus
/// housekeeper replay means the same event can arrive more than once. The
/// scope carries the restored call-chain context; nested operations performed
/// while handling the event should `begin`/`end` against it so they share the
/// originating context id.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, scope: &mut EventScope, event: &EventRecord) -> Result<()>;
}
