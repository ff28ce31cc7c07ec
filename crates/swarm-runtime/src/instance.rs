//! Live worker instances and their lifecycle states.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use swarm_client::WorkerClient;
use swarm_core::tools::ToolDescriptor;
use swarm_core::worker::{WorkerConfig, WorkerTransport};

/// Per-instance lifecycle state.
///
/// ```text
///    CONNECTING ──► CONNECTED ──► ERROR ──retry──► CONNECTING
///                       │            │
///                       └──stop──────┴──────────► STOPPED
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Transport being established.
    Connecting,
    /// Transport up, tool list cached.
    Connected,
    /// Transport failed; a reconnect may be scheduled.
    Error,
    /// Health-probe-driven restart in flight.
    Restarting,
    /// Terminal. Not present in the live index.
    Stopped,
}

struct MutableState {
    state: WorkerState,
    client: Option<Arc<dyn WorkerClient>>,
    process_id: Option<u32>,
    cached_tools: Vec<ToolDescriptor>,
    last_error: Option<String>,
    reconnect_count: u32,
}

/// One live attempt to run a worker.
///
/// Identity fields are fixed at spawn; everything mutable lives behind
/// the internal lock. The `busy` gate guarantees at most one
/// outstanding call per instance.
pub struct Instance {
    /// Name the instance is indexed under (`base`, `base#k`, `base@p`).
    pub internal_name: String,
    /// The declared base name.
    pub base_name: String,
    /// Pool index: `Some(0)` primary, `Some(k)` scaled, `None` for
    /// session-owned instances (which never join a pool).
    pub index: Option<usize>,
    /// The config this instance was spawned from.
    pub config: WorkerConfig,
    state: RwLock<MutableState>,
    busy: AtomicBool,
    last_active: Mutex<Instant>,
    /// Serializes direct (non-queued) calls on this instance.
    pub(crate) call_lock: tokio::sync::Mutex<()>,
}

impl Instance {
    /// Create a fresh instance in the CONNECTING state.
    #[must_use]
    pub fn new(internal_name: String, base_name: String, index: Option<usize>, config: WorkerConfig) -> Self {
        Self {
            internal_name,
            base_name,
            index,
            config,
            state: RwLock::new(MutableState {
                state: WorkerState::Connecting,
                client: None,
                process_id: None,
                cached_tools: Vec::new(),
                last_error: None,
                reconnect_count: 0,
            }),
            busy: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
            call_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Whether this is a session-owned instance.
    #[must_use]
    pub fn is_session_owned(&self) -> bool {
        self.internal_name.contains('@')
    }

    /// Whether this is the pool primary.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.index == Some(0)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.state.read().state
    }

    /// The client, if the instance holds one.
    #[must_use]
    pub fn client(&self) -> Option<Arc<dyn WorkerClient>> {
        self.state.read().client.clone()
    }

    /// Transition to CONNECTED with a live client.
    pub fn set_connected(&self, client: Arc<dyn WorkerClient>) {
        let process_id = client.process_id();
        let mut guard = self.state.write();
        guard.state = WorkerState::Connected;
        guard.client = Some(client);
        guard.process_id = process_id;
        guard.last_error = None;
    }

    /// Transition to a failed state, detaching the client.
    pub fn set_error(&self, message: impl Into<String>) {
        let mut guard = self.state.write();
        guard.state = WorkerState::Error;
        guard.client = None;
        guard.last_error = Some(message.into());
    }

    /// Transition to CONNECTING (fresh spawn or retry).
    pub fn set_connecting(&self) {
        let mut guard = self.state.write();
        guard.state = WorkerState::Connecting;
        guard.client = None;
    }

    /// Transition to the transient RESTARTING state.
    pub fn set_restarting(&self) {
        self.state.write().state = WorkerState::Restarting;
    }

    /// Terminal transition; detaches the client.
    pub fn set_stopped(&self) {
        let mut guard = self.state.write();
        guard.state = WorkerState::Stopped;
        guard.client = None;
    }

    /// Replace the cached tool list.
    pub fn set_tools(&self, tools: Vec<ToolDescriptor>) {
        self.state.write().cached_tools = tools;
    }

    /// The cached tool list.
    #[must_use]
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.state.read().cached_tools.clone()
    }

    /// Current reconnect attempt count.
    #[must_use]
    pub fn reconnect_count(&self) -> u32 {
        self.state.read().reconnect_count
    }

    /// Set the reconnect attempt count.
    pub fn set_reconnect_count(&self, count: u32) {
        self.state.write().reconnect_count = count;
    }

    /// Mark busy; returns `false` if the instance was already busy.
    pub fn try_mark_busy(&self) -> bool {
        !self.busy.swap(true, Ordering::AcqRel)
    }

    /// Clear busy and bump the activity clock.
    pub fn mark_idle(&self) {
        self.busy.store(false, Ordering::Release);
        *self.last_active.lock() = Instant::now();
    }

    /// Whether a call is in flight.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Time since the last completed call (or spawn).
    #[must_use]
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_active.lock().elapsed()
    }

    /// Bump the activity clock without touching the busy flag.
    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Read-only snapshot for API surfaces and events.
    #[must_use]
    pub fn snapshot(&self) -> InstanceSnapshot {
        let guard = self.state.read();
        InstanceSnapshot {
            internal_name: self.internal_name.clone(),
            base_name: self.base_name.clone(),
            index: self.index,
            state: guard.state,
            transport: self.config.transport,
            process_id: guard.process_id,
            tool_count: guard.cached_tools.len(),
            stateful: self.config.stateful,
            last_error: guard.last_error.clone(),
            reconnect_count: guard.reconnect_count,
            busy: self.is_busy(),
        }
    }
}

/// Serializable view of one instance.
#[derive(Clone, Debug, Serialize)]
pub struct InstanceSnapshot {
    /// Index key in the live index.
    pub internal_name: String,
    /// Declared base name.
    pub base_name: String,
    /// Pool index; `None` for session-owned instances.
    pub index: Option<usize>,
    /// Lifecycle state.
    pub state: WorkerState,
    /// Transport kind.
    pub transport: WorkerTransport,
    /// Child PID (local only).
    pub process_id: Option<u32>,
    /// Cached tool count.
    pub tool_count: usize,
    /// Whether the worker is session-isolated.
    pub stateful: bool,
    /// Last failure message, if any.
    pub last_error: Option<String>,
    /// Reconnect attempts since the last successful connect.
    pub reconnect_count: u32,
    /// Whether a call is in flight.
    pub busy: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(name: &str) -> WorkerConfig {
        WorkerConfig {
            name: name.into(),
            transport: WorkerTransport::Local,
            command: Some("cmd".into()),
            args: vec![],
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            description: String::new(),
            stateful: false,
        }
    }

    fn instance(internal: &str, index: Option<usize>) -> Instance {
        Instance::new(internal.into(), "w".into(), index, config("w"))
    }

    #[test]
    fn starts_connecting() {
        let inst = instance("w", Some(0));
        assert_eq!(inst.state(), WorkerState::Connecting);
        assert!(inst.client().is_none());
        assert!(!inst.is_busy());
    }

    #[test]
    fn primary_and_session_detection() {
        assert!(instance("w", Some(0)).is_primary());
        assert!(!instance("w#2", Some(2)).is_primary());
        assert!(instance("w@abcd1234", None).is_session_owned());
        assert!(!instance("w", Some(0)).is_session_owned());
    }

    #[test]
    fn error_detaches_client_and_keeps_message() {
        let inst = instance("w", Some(0));
        inst.set_error("npm ERR! code E404");
        assert_eq!(inst.state(), WorkerState::Error);
        assert!(inst.client().is_none());
        assert_eq!(
            inst.snapshot().last_error.as_deref(),
            Some("npm ERR! code E404")
        );
    }

    #[test]
    fn busy_gate_admits_one() {
        let inst = instance("w", Some(0));
        assert!(inst.try_mark_busy());
        assert!(!inst.try_mark_busy());
        inst.mark_idle();
        assert!(inst.try_mark_busy());
    }

    #[test]
    fn mark_idle_resets_activity_clock() {
        let inst = instance("w", Some(0));
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(inst.idle_for() >= std::time::Duration::from_millis(20));
        inst.mark_idle();
        assert!(inst.idle_for() < std::time::Duration::from_millis(20));
    }

    #[test]
    fn reconnect_count_round_trip() {
        let inst = instance("w", Some(0));
        assert_eq!(inst.reconnect_count(), 0);
        inst.set_reconnect_count(2);
        assert_eq!(inst.reconnect_count(), 2);
    }

    #[test]
    fn snapshot_reflects_state() {
        let inst = instance("w#1", Some(1));
        inst.set_tools(vec![ToolDescriptor::new(
            "t",
            "",
            serde_json::json!({"type": "object"}),
        )]);
        let snap = inst.snapshot();
        assert_eq!(snap.internal_name, "w#1");
        assert_eq!(snap.index, Some(1));
        assert_eq!(snap.tool_count, 1);
        assert_eq!(snap.state, WorkerState::Connecting);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["state"], "connecting");
        assert_eq!(json["transport"], "local");
    }

    #[test]
    fn stopped_is_terminal_shape() {
        let inst = instance("w", Some(0));
        inst.set_stopped();
        assert_eq!(inst.state(), WorkerState::Stopped);
        assert!(inst.client().is_none());
    }
}
