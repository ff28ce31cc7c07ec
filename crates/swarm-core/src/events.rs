//! Lifecycle event envelope.
//!
//! Every event published on the bus is a [`HubEvent`]: a kind, an
//! epoch-millisecond timestamp, and a JSON payload. Consumers see any
//! single emitter's events in emission order; there is no cross-emitter
//! ordering guarantee.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Typed event kinds emitted by the supervisor and session layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// An instance changed lifecycle state.
    #[serde(rename = "worker:state")]
    WorkerState,
    /// A worker was declared.
    #[serde(rename = "worker:added")]
    WorkerAdded,
    /// A worker was stopped and removed from the live index.
    #[serde(rename = "worker:removed")]
    WorkerRemoved,
    /// A tool call was dispatched to a worker.
    #[serde(rename = "tool:call")]
    ToolCall,
    /// A tool call completed.
    #[serde(rename = "tool:result")]
    ToolResult,
    /// A client session was minted.
    #[serde(rename = "session:opened")]
    SessionOpened,
    /// A client session was torn down.
    #[serde(rename = "session:closed")]
    SessionClosed,
    /// A pool grew by one scaled instance.
    #[serde(rename = "pool:scaled")]
    PoolScaled,
}

impl EventKind {
    /// The wire name of this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkerState => "worker:state",
            Self::WorkerAdded => "worker:added",
            Self::WorkerRemoved => "worker:removed",
            Self::ToolCall => "tool:call",
            Self::ToolResult => "tool:result",
            Self::SessionOpened => "session:opened",
            Self::SessionClosed => "session:closed",
            Self::PoolScaled => "pool:scaled",
        }
    }
}

/// The envelope published to subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HubEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Epoch milliseconds at emission.
    pub ts_ms: u64,
    /// Kind-specific payload.
    pub data: Value,
}

impl HubEvent {
    /// Create an event stamped with the current wall clock.
    #[must_use]
    pub fn now(kind: EventKind, data: Value) -> Self {
        Self {
            kind,
            ts_ms: epoch_ms(),
            data,
        }
    }
}

/// Current wall clock as epoch milliseconds.
#[must_use]
pub fn epoch_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_wire_names() {
        assert_eq!(EventKind::WorkerState.as_str(), "worker:state");
        assert_eq!(EventKind::PoolScaled.as_str(), "pool:scaled");
        assert_eq!(
            serde_json::to_string(&EventKind::SessionClosed).unwrap(),
            "\"session:closed\""
        );
    }

    #[test]
    fn envelope_shape() {
        let ev = HubEvent::now(EventKind::ToolCall, json!({"server": "fetch", "tool": "get"}));
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(value["type"], "tool:call");
        assert!(value["ts_ms"].as_u64().unwrap() > 0);
        assert_eq!(value["data"]["server"], "fetch");
    }

    #[test]
    fn envelope_roundtrip() {
        let ev = HubEvent::now(EventKind::WorkerAdded, json!({"name": "w"}));
        let back: HubEvent = serde_json::from_str(&serde_json::to_string(&ev).unwrap()).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn epoch_ms_is_monotonic_enough() {
        let a = epoch_ms();
        let b = epoch_ms();
        assert!(b >= a);
    }
}
