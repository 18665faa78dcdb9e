//! Call-chain event context propagation
//!
//! An [`EventScope`] is a stack of event frames owned by one logical call
//! chain. Nested service calls push frames that reuse the enclosing frame's
//! context id; a fresh top-level call allocates a new one. The scope is an
//! explicit object passed by reference through the chain rather than implicit
//! thread-local state, so one delivery can never observe another's context.

use crate::types::EventRecord;
use uuid::Uuid;

/// Per-call-chain stack of event context frames
#[derive(Debug, Default)]
pub struct EventScope {
    stack: Vec<EventRecord>,
}

impl EventScope {
    /// Create an empty scope for a new call chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a frame onto the stack and return it
    ///
    /// Reuses the enclosing frame's context id when one exists; the first
    /// frame of a chain gets a freshly allocated UUID.
    pub fn begin(&mut self) -> &mut EventRecord {
        let context_id = match self.stack.last() {
            Some(enclosing) => enclosing.context_id.clone(),
            None => Uuid::new_v4().to_string(),
        };

        self.stack.push(EventRecord::with_context(context_id));
        // just pushed, cannot be empty
        self.stack.last_mut().unwrap()
    }

    /// Replace the whole stack with a single frame
    ///
    /// Used when restoring context on an inbound delivery that did not
    /// originate the call chain.
    pub fn set(&mut self, event: EventRecord) {
        self.stack.clear();
        self.stack.push(event);
    }

    /// The current (top) frame, if any
    pub fn get(&self) -> Option<&EventRecord> {
        self.stack.last()
    }

    /// Pop the top frame
    ///
    /// Popping an empty stack indicates an unbalanced begin/end pairing;
    /// it is logged and otherwise ignored.
    pub fn end(&mut self) {
        if self.stack.pop().is_none() {
            tracing::warn!("EventScope::end called on an empty context stack");
        }
    }

    /// True when no frame is active
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_allocates_context_id() {
        let mut scope = EventScope::new();
        let frame = scope.begin();
        assert!(!frame.context_id.is_empty());

        scope.end();
        assert!(scope.is_empty());
    }

    #[test]
    fn test_nested_begin_reuses_context_id() {
        let mut scope = EventScope::new();
        let outer_id = scope.begin().context_id.clone();
        let inner_id = scope.begin().context_id.clone();
        assert_eq!(outer_id, inner_id);

        scope.end();
        // after the innermost end, get() returns the outer frame
        assert_eq!(scope.get().unwrap().context_id, outer_id);
        scope.end();
        assert!(scope.get().is_none());
    }

    #[test]
    fn test_separate_chains_get_distinct_ids() {
        let mut a = EventScope::new();
        let mut b = EventScope::new();
        assert_ne!(a.begin().context_id, b.begin().context_id);
    }

    #[test]
    fn test_set_replaces_stack() {
        let mut scope = EventScope::new();
        scope.begin();
        scope.begin();

        let inbound = EventRecord::with_context("delivery-ctx");
        scope.set(inbound);

        assert_eq!(scope.get().unwrap().context_id, "delivery-ctx");
        scope.end();
        assert!(scope.is_empty());
    }

    #[test]
    fn test_end_on_empty_stack_is_noop() {
        let mut scope = EventScope::new();
        scope.end();
        assert!(scope.is_empty());
    }

    #[test]
    fn test_begin_frame_is_mutable() {
        let mut scope = EventScope::new();
        let frame = scope.begin();
        frame.service = "account".to_string();
        frame.scope_id = 42;

        assert_eq!(scope.get().unwrap().service, "account");
        assert_eq!(scope.get().unwrap().scope_id, 42);
    }
}
