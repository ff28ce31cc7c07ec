//! Multi-client session registry.
//!
//! Sessions are minted on the first protocol message without a valid
//! session header, capped at a configurable maximum, touched on every
//! message, and garbage-collected when idle past the timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use swarm_core::events::{epoch_ms, EventKind};

use crate::bus::EventBus;

/// Callback run for each expired or removed session during teardown.
pub type TeardownFn = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

struct SessionMeta {
    created_at_ms: u64,
    last_active: Mutex<Instant>,
}

/// Serializable session metadata for the admin API.
#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    /// The session id.
    pub id: String,
    /// Epoch milliseconds at creation.
    pub created_at_ms: u64,
    /// Milliseconds since the last message.
    pub idle_ms: u64,
}

/// The session index.
pub struct SessionRegistry {
    sessions: DashMap<String, SessionMeta>,
    max_sessions: usize,
    bus: EventBus,
    weak_self: std::sync::Weak<Self>,
}

impl SessionRegistry {
    /// Create a registry capped at `max_sessions`.
    #[must_use]
    pub fn new(max_sessions: usize, bus: EventBus) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            sessions: DashMap::new(),
            max_sessions,
            bus,
            weak_self: weak.clone(),
        })
    }

    /// Mint a fresh session. Returns `None` at capacity.
    #[must_use]
    pub fn open(&self) -> Option<String> {
        if self.sessions.len() >= self.max_sessions {
            return None;
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        let _ = self.sessions.insert(
            id.clone(),
            SessionMeta {
                created_at_ms: epoch_ms(),
                last_active: Mutex::new(Instant::now()),
            },
        );
        self.bus
            .emit(EventKind::SessionOpened, json!({"session_id": id}));
        info!(session_id = %id, total = self.sessions.len(), "session opened");
        Some(id)
    }

    /// Bump a session's activity clock. Returns whether it exists.
    pub fn touch(&self, id: &str) -> bool {
        match self.sessions.get(id) {
            Some(meta) => {
                *meta.last_active.lock() = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Whether a session id is live.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Remove a session from the index, emitting `session:closed`.
    /// Returns whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        let existed = self.sessions.remove(id).is_some();
        if existed {
            self.bus
                .emit(EventKind::SessionClosed, json!({"session_id": id}));
            info!(session_id = %id, "session closed");
        }
        existed
    }

    /// Number of live sessions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Metadata for every live session.
    #[must_use]
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| SessionInfo {
                id: entry.key().clone(),
                created_at_ms: entry.created_at_ms,
                idle_ms: u64::try_from(entry.last_active.lock().elapsed().as_millis())
                    .unwrap_or(u64::MAX),
            })
            .collect();
        infos.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        infos
    }

    /// Session ids idle past `timeout`.
    #[must_use]
    pub fn expired(&self, timeout: Duration) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|entry| entry.last_active.lock().elapsed() >= timeout)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Start the idle GC loop. Each expired session is removed from
    /// the index and handed to `teardown`.
    pub fn start_gc(
        &self,
        interval: Duration,
        idle_timeout: Duration,
        teardown: TeardownFn,
    ) -> JoinHandle<()> {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let _ = tick.tick().await;
                let Some(registry) = weak.upgrade() else { break };
                for id in registry.expired(idle_timeout) {
                    debug!(session_id = %id, "session idle timeout");
                    if registry.remove(&id) {
                        teardown(id).await;
                    }
                }
            }
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
