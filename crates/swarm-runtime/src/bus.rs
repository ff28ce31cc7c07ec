//! Best-effort fan-out of lifecycle events.
//!
//! Backed by a bounded broadcast channel: the emitter never blocks,
//! and a slow subscriber loses only its own backlog. Consumers see any
//! single emitter's events in emission order.

use serde_json::Value;
use tokio::sync::broadcast;

use swarm_core::events::{EventKind, HubEvent};

/// Per-subscriber buffer capacity.
pub const BUS_CAPACITY: usize = 256;

/// The event bus. Cheap to clone; clones share the channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HubEvent>,
}

impl EventBus {
    /// Create a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(BUS_CAPACITY)
    }

    /// Create a bus with an explicit per-subscriber capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Never blocks; a bus with no subscribers
    /// drops the event.
    pub fn emit(&self, kind: EventKind, data: Value) {
        let _ = self.tx.send(HubEvent::now(kind, data));
    }

    /// Subscribe. The receiver observes events emitted after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn subscriber_receives_in_emission_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(EventKind::WorkerAdded, json!({"name": "a"}));
        bus.emit(EventKind::WorkerState, json!({"name": "a", "state": "connected"}));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::WorkerAdded);
        assert_eq!(second.kind, EventKind::WorkerState);
    }

    #[tokio::test]
    async fn emit_without_subscribers_does_not_block() {
        let bus = EventBus::new();
        for _ in 0..1000 {
            bus.emit(EventKind::ToolCall, json!({}));
        }
    }

    #[tokio::test]
    async fn slow_subscriber_drops_own_backlog_only() {
        let bus = EventBus::with_capacity(4);
        let mut slow = bus.subscribe();

        // Overflow the slow subscriber's buffer.
        for i in 0..10 {
            bus.emit(EventKind::ToolResult, json!({"i": i}));
        }

        // A fresh subscriber still works.
        let mut fresh = bus.subscribe();
        bus.emit(EventKind::ToolResult, json!({"i": "after"}));
        assert_eq!(fresh.recv().await.unwrap().data["i"], "after");

        // The slow one observes the lag, then resumes with recent events.
        match slow.recv().await {
            Err(RecvError::Lagged(skipped)) => assert!(skipped > 0),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clones_share_the_channel() {
        let bus = EventBus::new();
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();
        bus2.emit(EventKind::SessionOpened, json!({"session_id": "s"}));
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::SessionOpened);
    }

    #[test]
    fn subscriber_count_tracks_receivers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
