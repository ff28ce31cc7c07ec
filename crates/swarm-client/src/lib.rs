//! # swarm-client
//!
//! Transport adapters speaking the JSON-RPC tool-call protocol with
//! managed workers. Three concrete adapters implement one capability
//! set ([`WorkerClient`]):
//!
//! - [`local::LocalWorkerClient`] — child process on standard streams
//! - [`sse::SseWorkerClient`] — server-sent-event HTTP
//! - [`streamable::StreamableHttpWorkerClient`] — streamable HTTP
//!
//! The adapters differ only in connection construction and in whether
//! there is a PID and a stderr stream.

#![deny(unsafe_code)]

pub mod local;
pub(crate) mod pending;
pub mod protocol;
pub mod sse;
pub mod sse_stream;
pub mod streamable;
pub mod tail;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;

use swarm_core::tools::{ToolCallOutcome, ToolDescriptor};

/// Hard cap on transport establishment.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
/// Budget for best-effort close.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Transport-layer failures.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The peer could not be reached at all.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// A deadline elapsed (connect or call).
    #[error("timed out: {0}")]
    Timeout(String),

    /// The peer spoke, but not the protocol we expected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The call was abandoned because the transport is shutting down.
    #[error("cancelled")]
    Cancelled,

    /// The peer reported a structured error in its response.
    #[error("worker error: {0}")]
    Worker(String),

    /// The transport is no longer usable.
    #[error("transport closed")]
    Closed,
}

// ─────────────────────────────────────────────────────────────────────────────
// Capability set
// ─────────────────────────────────────────────────────────────────────────────

/// Callback invoked when the peer announces a changed tool list.
pub type ToolsChangedHandler = Box<dyn Fn(Vec<ToolDescriptor>) + Send + Sync>;
/// Callback invoked exactly once when the transport becomes unusable.
pub type ClosedHandler = Box<dyn FnOnce() + Send + Sync>;

/// The capability set every transport adapter implements.
///
/// Adapters are constructed already connected; connection failures
/// surface from the per-transport `connect` constructors.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Fetch the authoritative tool list from the peer.
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ClientError>;

    /// Invoke one tool. `timeout` bounds the whole round trip.
    async fn call_tool(
        &self,
        tool: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<ToolCallOutcome, ClientError>;

    /// Register the tools-changed callback.
    fn on_tools_changed(&self, handler: ToolsChangedHandler);

    /// Register the closed callback. Fires exactly once; if the
    /// transport already died, fires immediately.
    fn on_closed(&self, handler: ClosedHandler);

    /// Best-effort close, bounded by [`CLOSE_TIMEOUT`]. Always succeeds.
    async fn close(&self);

    /// Child process id, local transport only.
    fn process_id(&self) -> Option<u32> {
        None
    }

    /// Recent stderr lines, local transport only.
    fn stderr_tail(&self) -> Option<Vec<String>> {
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared callback plumbing
// ─────────────────────────────────────────────────────────────────────────────

/// Callback registration shared by all adapters.
///
/// Guarantees the closed handler fires exactly once, including the
/// race where the transport dies before the handler is registered.
#[derive(Default)]
pub(crate) struct Callbacks {
    tools_changed: Mutex<Option<ToolsChangedHandler>>,
    closed: Mutex<Option<ClosedHandler>>,
    closed_fired: AtomicBool,
}

impl Callbacks {
    pub(crate) fn set_tools_changed(&self, handler: ToolsChangedHandler) {
        *self.tools_changed.lock() = Some(handler);
    }

    pub(crate) fn fire_tools_changed(&self, tools: Vec<ToolDescriptor>) {
        let guard = self.tools_changed.lock();
        if let Some(handler) = guard.as_ref() {
            handler(tools);
        }
    }

    pub(crate) fn set_closed(&self, handler: ClosedHandler) {
        if self.closed_fired.load(Ordering::Acquire) {
            handler();
            return;
        }
        let mut guard = self.closed.lock();
        // Re-check under the lock to close the set/fire race.
        if self.closed_fired.load(Ordering::Acquire) {
            drop(guard);
            handler();
        } else {
            *guard = Some(handler);
        }
    }

    pub(crate) fn fire_closed(&self) {
        let handler = {
            let mut guard = self.closed.lock();
            if self.closed_fired.swap(true, Ordering::AcqRel) {
                return;
            }
            guard.take()
        };
        if let Some(handler) = handler {
            handler();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn closed_fires_exactly_once() {
        let cb = Callbacks::default();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        cb.set_closed(Box::new(move || {
            let _ = c.fetch_add(1, Ordering::SeqCst);
        }));
        cb.fire_closed();
        cb.fire_closed();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closed_fires_immediately_when_already_dead() {
        let cb = Callbacks::default();
        cb.fire_closed();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        cb.set_closed(Box::new(move || {
            let _ = c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tools_changed_fires_every_time() {
        let cb = Callbacks::default();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        cb.set_tools_changed(Box::new(move |_| {
            let _ = c.fetch_add(1, Ordering::SeqCst);
        }));
        cb.fire_tools_changed(vec![]);
        cb.fire_tools_changed(vec![]);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn tools_changed_without_handler_is_noop() {
        let cb = Callbacks::default();
        cb.fire_tools_changed(vec![]);
    }

    #[test]
    fn error_display() {
        assert_eq!(ClientError::Cancelled.to_string(), "cancelled");
        assert_eq!(
            ClientError::Worker("tool blew up".into()).to_string(),
            "worker error: tool blew up"
        );
    }
}
