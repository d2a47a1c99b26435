//! Lifecycle event publishing.
//!
//! The scheduler emits events only after the corresponding state change
//! has been persisted, so subscribers never observe a mutation that lost
//! its version race. Publishing is fire-and-forget: a slow or absent
//! subscriber never blocks dispatch.

use tokio::sync::broadcast;
use weft_types::event::EngineEvent;

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Object-safe sink for engine lifecycle events.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: EngineEvent);
}

// ---------------------------------------------------------------------------
// Implementations
// ---------------------------------------------------------------------------

/// Fan-out over a tokio broadcast channel. Subscribers that fall behind
/// lose the oldest events rather than applying backpressure.
pub struct BroadcastPublisher {
    sender: broadcast::Sender<EngineEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: EngineEvent) {
        tracing::debug!(event = ?event, "engine event");
        // send fails only when no subscriber exists, which is fine
        let _ = self.sender.send(event);
    }
}

/// Discards every event. Useful in tests that only assert on state.
pub struct NullPublisher;

impl EventPublisher for NullPublisher {
    fn publish(&self, _event: EngineEvent) {}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
