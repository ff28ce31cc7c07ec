//! Per-pool FIFO admission queues.
//!
//! Each base name owns a FIFO of queued calls plus the list of
//! registered instances. Dispatch runs on enqueue, on instance
//! registration, and after every completion, saturating every idle
//! instance in a single pass. A 1 Hz tick expires stale calls and
//! signals scale-up.
//!
//! The queue holds no reference to the supervisor: the two callbacks
//! (`execute`, `on_scale_up`) are provided at construction.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use swarm_core::errors::HubError;
use swarm_core::tools::ToolCallOutcome;

/// Executes one call on a specific instance.
pub type ExecuteFn = Arc<
    dyn Fn(String, String, Value) -> BoxFuture<'static, Result<ToolCallOutcome, HubError>>
        + Send
        + Sync,
>;

/// Asks the supervisor to grow a pool. Invoked at most once per
/// pending interval; the supervisor clears the latch when the attempt
/// resolves.
pub type ScaleUpFn = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

type CallResult = Result<ToolCallOutcome, HubError>;

struct QueuedCall {
    tool: String,
    args: Value,
    enqueued_at: Instant,
    tx: oneshot::Sender<CallResult>,
}

struct InstanceSlot {
    internal: String,
    busy: bool,
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<String, VecDeque<QueuedCall>>,
    instances: HashMap<String, Vec<InstanceSlot>>,
    pending_scale: HashSet<String>,
}

/// The admission queue shared by every pool.
pub struct AdmissionQueue {
    state: Mutex<QueueState>,
    execute: ExecuteFn,
    on_scale_up: ScaleUpFn,
    ttl: Duration,
    scale_up_wait: Duration,
    cancel: CancellationToken,
    weak_self: Weak<Self>,
}

impl AdmissionQueue {
    /// Create a queue with the supervisor-provided callbacks.
    #[must_use]
    pub fn new(
        execute: ExecuteFn,
        on_scale_up: ScaleUpFn,
        ttl: Duration,
        scale_up_wait: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            state: Mutex::new(QueueState::default()),
            execute,
            on_scale_up,
            ttl,
            scale_up_wait,
            cancel: CancellationToken::new(),
            weak_self: weak.clone(),
        })
    }

    /// Start the 1 Hz maintenance tick.
    pub fn start_tick(&self) {
        let weak = self.weak_self.clone();
        let cancel = self.cancel.clone();
        let _ = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let Some(queue) = weak.upgrade() else { break };
                        queue.tick();
                    }
                }
            }
        });
    }

    /// Stop the maintenance tick.
    pub fn stop_tick(&self) {
        self.cancel.cancel();
    }

    /// Enqueue a call for `base` and await its completion.
    ///
    /// Resolves when a worker finishes the call, when the TTL expires,
    /// or when the pool is drained.
    pub async fn enqueue(&self, base: &str, tool: &str, args: Value) -> CallResult {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            state.queues.entry(base.to_owned()).or_default().push_back(QueuedCall {
                tool: tool.to_owned(),
                args,
                enqueued_at: Instant::now(),
                tx,
            });
        }
        self.dispatch(base);

        rx.await
            .unwrap_or_else(|_| Err(HubError::internal("queued call dropped")))
    }

    /// Register an instance as dispatchable for `base`.
    pub fn register_instance(&self, base: &str, internal: &str) {
        {
            let mut state = self.state.lock();
            let slots = state.instances.entry(base.to_owned()).or_default();
            if slots.iter().any(|s| s.internal == internal) {
                return;
            }
            slots.push(InstanceSlot {
                internal: internal.to_owned(),
                busy: false,
            });
        }
        debug!(base, internal, "instance registered with queue");
        self.dispatch(base);
    }

    /// Remove an instance from dispatch.
    pub fn unregister_instance(&self, base: &str, internal: &str) {
        let mut state = self.state.lock();
        if let Some(slots) = state.instances.get_mut(base) {
            slots.retain(|s| s.internal != internal);
        }
    }

    /// Atomically reject every queued call for `base`, clear its
    /// instance list, and clear its pending-scale-up latch.
    pub fn drain(&self, base: &str) {
        let calls = {
            let mut state = self.state.lock();
            let _ = state.instances.remove(base);
            let _ = state.pending_scale.remove(base);
            state.queues.remove(base).unwrap_or_default()
        };
        let rejected = calls.len();
        for call in calls {
            let _ = call
                .tx
                .send(Err(HubError::Cancelled("server stopped".into())));
        }
        if rejected > 0 {
            debug!(base, rejected, "queue drained");
        }
    }

    /// Drain every pool (supervisor shutdown).
    pub fn drain_all(&self) {
        let bases: Vec<String> = self.state.lock().queues.keys().cloned().collect();
        for base in bases {
            self.drain(&base);
        }
        let mut state = self.state.lock();
        state.instances.clear();
        state.pending_scale.clear();
    }

    /// Clear the pending-scale-up latch after an attempt resolves.
    pub fn clear_pending_scale(&self, base: &str) {
        let _ = self.state.lock().pending_scale.remove(base);
    }

    /// Queued call count for `base` (tests and introspection).
    #[must_use]
    pub fn queued_len(&self, base: &str) -> usize {
        self.state.lock().queues.get(base).map_or(0, VecDeque::len)
    }

    // ── internals ──────────────────────────────────────────────────────

    /// Hand queued calls to idle instances, saturating in one pass.
    fn dispatch(&self, base: &str) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let mut started: Vec<(String, QueuedCall)> = Vec::new();
        {
            let mut state = self.state.lock();
            let QueueState {
                queues, instances, ..
            } = &mut *state;
            let (Some(queue), Some(slots)) = (queues.get_mut(base), instances.get_mut(base))
            else {
                return;
            };
            for slot in slots.iter_mut() {
                if queue.is_empty() {
                    break;
                }
                if slot.busy {
                    continue;
                }
                if let Some(call) = queue.pop_front() {
                    slot.busy = true;
                    started.push((slot.internal.clone(), call));
                }
            }
        }

        for (internal, call) in started {
            let queue = this.clone();
            let base = base.to_owned();
            let _ = tokio::spawn(async move {
                queue.run_one(&base, internal, call).await;
            });
        }
    }

    async fn run_one(self: Arc<Self>, base: &str, internal: String, call: QueuedCall) {
        let waited = call.enqueued_at.elapsed();
        debug!(base, instance = %internal, tool = %call.tool, waited_ms = waited.as_millis() as u64, "dispatching queued call");

        let result = (self.execute)(internal.clone(), call.tool, call.args).await;
        let _ = call.tx.send(result);

        {
            let mut state = self.state.lock();
            if let Some(slot) = state
                .instances
                .get_mut(base)
                .and_then(|slots| slots.iter_mut().find(|s| s.internal == internal))
            {
                slot.busy = false;
            }
        }
        self.dispatch(base);
    }

    /// One maintenance pass: expire stale calls, then signal scale-up.
    fn tick(&self) {
        let mut expired: Vec<QueuedCall> = Vec::new();
        let mut scale_targets: Vec<String> = Vec::new();
        {
            let mut state = self.state.lock();
            let QueueState {
                queues,
                instances,
                pending_scale,
            } = &mut *state;

            // 1. Expire.
            for queue in queues.values_mut() {
                while queue
                    .front()
                    .is_some_and(|call| call.enqueued_at.elapsed() >= self.ttl)
                {
                    if let Some(call) = queue.pop_front() {
                        expired.push(call);
                    }
                }
            }

            // 2. Scale check.
            for (base, queue) in queues.iter() {
                let Some(head) = queue.front() else { continue };
                if head.enqueued_at.elapsed() < self.scale_up_wait {
                    continue;
                }
                let all_busy = instances
                    .get(base)
                    .is_none_or(|slots| slots.iter().all(|s| s.busy));
                if all_busy && pending_scale.insert(base.clone()) {
                    scale_targets.push(base.clone());
                }
            }
        }

        let expired_count = expired.len();
        for call in expired {
            let _ = call.tx.send(Err(HubError::Timeout(format!(
                "queued call '{}' expired after {:?}",
                call.tool, self.ttl
            ))));
        }
        if expired_count > 0 {
            warn!(expired = expired_count, "expired queued calls");
        }

        for base in scale_targets {
            let scale = self.on_scale_up.clone();
            let _ = tokio::spawn(async move {
                scale(base).await;
            });
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
