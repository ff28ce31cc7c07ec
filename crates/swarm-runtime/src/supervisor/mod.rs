//! The supervisor: per-worker lifecycle, pool scaling, reconnects,
//! health probes, and session-scoped instance routing.
//!
//! The supervisor owns the live instance index, per-base spawn
//! mutexes, and the reconnect timer set. Two periodic loops run while
//! it is alive: an idle reaper (10 s) and a health probe (configurable
//! interval). The admission queue is constructed with callbacks into
//! the supervisor so the queue itself holds no supervisor reference.

mod markers;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use swarm_client::local::LocalWorkerClient;
use swarm_client::sse::SseWorkerClient;
use swarm_client::streamable::StreamableHttpWorkerClient;
use swarm_client::{ClientError, WorkerClient};
use swarm_core::config::HubConfig;
use swarm_core::errors::HubError;
use swarm_core::events::EventKind;
use swarm_core::tools::{ToolCallOutcome, ToolDescriptor};
use swarm_core::worker::{scaled_name, session_name, WorkerConfig, WorkerTransport};
use swarm_store::Store;

use crate::bus::EventBus;
use crate::instance::{Instance, InstanceSnapshot, WorkerState};
use crate::queue::{AdmissionQueue, ExecuteFn, ScaleUpFn};

pub use markers::{has_permanent_failure_marker, PERMANENT_FAILURE_MARKERS};

/// Base delay of the reconnect backoff (`delay = base × 2^attempt`).
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(2);
/// Reconnect attempts before an instance stays in ERROR.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;
/// Idle reaper cadence.
pub const REAPER_INTERVAL: Duration = Duration::from_secs(10);
/// How many stderr lines go into `last_error` on permanent failure.
const LAST_ERROR_LINES: usize = 5;

/// Pluggable transport factory. Production wires the three adapters;
/// tests inject scripted fakes.
pub type Connector = Arc<
    dyn Fn(String, WorkerConfig) -> BoxFuture<'static, Result<Arc<dyn WorkerClient>, ClientError>>
        + Send
        + Sync,
>;

#[derive(Default)]
struct SessionOwnership {
    /// base name → internal name of the session-owned instance.
    instances: HashMap<String, String>,
    /// Per-instance disk state to remove on teardown.
    temp_dirs: Vec<PathBuf>,
}

/// The singleton supervisor.
pub struct Supervisor {
    config: HubConfig,
    store: Arc<Store>,
    bus: EventBus,
    queue: Arc<AdmissionQueue>,
    instances: DashMap<String, Arc<Instance>>,
    spawn_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    session_spawn_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    reconnect_timers: DashMap<String, JoinHandle<()>>,
    sessions: DashMap<String, SessionOwnership>,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    connector: Connector,
    weak_self: Weak<Self>,
}

impl Supervisor {
    /// Create a supervisor with the production transport adapters.
    #[must_use]
    pub fn new(config: HubConfig, store: Arc<Store>, bus: EventBus) -> Arc<Self> {
        Self::with_connector(config, store, bus, default_connector())
    }

    /// Create a supervisor with an injected transport factory.
    #[must_use]
    pub fn with_connector(
        config: HubConfig,
        store: Arc<Store>,
        bus: EventBus,
        connector: Connector,
    ) -> Arc<Self> {
        let ttl = config.queue_ttl;
        let scale_up_wait = config.scale_up_wait;

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let execute: ExecuteFn = {
                let weak = weak.clone();
                Arc::new(move |internal, tool, args| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        match weak.upgrade() {
                            Some(supervisor) => {
                                supervisor.execute_queued(&internal, &tool, args).await
                            }
                            None => Err(HubError::Cancelled("supervisor gone".into())),
                        }
                    })
                })
            };
            let on_scale_up: ScaleUpFn = {
                let weak = weak.clone();
                Arc::new(move |base| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        if let Some(supervisor) = weak.upgrade() {
                            supervisor.scale_up(&base).await;
                        }
                    })
                })
            };

            Self {
                queue: AdmissionQueue::new(execute, on_scale_up, ttl, scale_up_wait),
                config,
                store,
                bus,
                instances: DashMap::new(),
                spawn_locks: DashMap::new(),
                session_spawn_locks: DashMap::new(),
                reconnect_timers: DashMap::new(),
                sessions: DashMap::new(),
                sweepers: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
                connector,
                weak_self: weak.clone(),
            }
        })
    }

    /// The event bus.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The resolved configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// The persistence gateway.
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Start the queue tick, the idle reaper, and the health watchdog.
    pub fn start_background_tasks(&self) {
        self.queue.start_tick();

        let mut sweepers = self.sweepers.lock();

        let reaper = {
            let weak = self.weak_self.clone();
            let cancel = self.shutdown.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(REAPER_INTERVAL);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = tick.tick() => {
                            let Some(supervisor) = weak.upgrade() else { break };
                            supervisor.reap_idle().await;
                        }
                    }
                }
            })
        };
        sweepers.push(reaper);

        if self.config.health_enabled() {
            let watchdog = {
                let weak = self.weak_self.clone();
                let cancel = self.shutdown.clone();
                let interval = self.config.health_interval;
                tokio::spawn(async move {
                    let mut tick = tokio::time::interval(interval);
                    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    // The first tick fires immediately; skip it so a fresh
                    // supervisor does not probe workers mid-restore.
                    tick.tick().await;
                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            _ = tick.tick() => {
                                let Some(supervisor) = weak.upgrade() else { break };
                                supervisor.probe_health();
                            }
                        }
                    }
                })
            };
            sweepers.push(watchdog);
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // Declare / stop / restart
    // ─────────────────────────────────────────────────────────────────

    /// Create-or-replace the primary for `config.name`.
    ///
    /// Any existing primary is stopped first. Returns the resulting
    /// snapshot, which may be in ERROR when the spawn failed; the
    /// config is persisted only after a successful connect.
    #[instrument(skip(self, config), fields(worker = %config.name))]
    pub async fn declare(&self, config: WorkerConfig) -> Result<InstanceSnapshot, HubError> {
        let config = config.validate()?;
        let base = config.name.clone();

        let lock = self.base_lock(&base);
        let _guard = lock.lock().await;

        if self.instances.contains_key(&base) {
            self.stop_pool_locked(&base).await;
        }

        let snapshot = self
            .spawn_instance(base.clone(), base.clone(), Some(0), config, true)
            .await;
        Ok(snapshot)
    }

    /// Idempotently stop every instance of `base` and drain its queue.
    pub async fn stop(&self, base: &str) -> bool {
        let lock = self.base_lock(base);
        let _guard = lock.lock().await;
        self.stop_pool_locked(base).await
    }

    /// Stop everything; pauses the reapers and the watchdog.
    pub async fn stop_all(&self) {
        info!("stopping all workers");
        self.shutdown.cancel();
        for sweeper in self.sweepers.lock().drain(..) {
            sweeper.abort();
        }
        self.queue.stop_tick();

        let bases: Vec<String> = {
            let mut bases: Vec<String> = self
                .instances
                .iter()
                .map(|entry| entry.base_name.clone())
                .collect();
            bases.sort();
            bases.dedup();
            bases
        };
        for base in bases {
            let _ = self.stop(&base).await;
        }
        self.queue.drain_all();
    }

    /// Snapshot the config, stop, declare again.
    pub async fn restart(&self, base: &str) -> Result<InstanceSnapshot, HubError> {
        let config = self
            .instances
            .get(base)
            .map(|inst| inst.config.clone())
            .or(self.store.get_worker(base).map_err(HubError::from)?)
            .ok_or_else(|| HubError::not_found(format!("worker '{base}'")))?;
        let _ = self.stop(base).await;
        self.declare(config).await
    }

    // ─────────────────────────────────────────────────────────────────
    // Calls
    // ─────────────────────────────────────────────────────────────────

    /// Direct, unqueued call on the primary.
    pub async fn call(
        &self,
        base: &str,
        tool: &str,
        args: Value,
    ) -> Result<ToolCallOutcome, HubError> {
        let instance = self
            .instances
            .get(base)
            .map(|e| e.clone())
            .ok_or_else(|| HubError::not_found(format!("worker '{base}'")))?;
        self.execute_on_instance(&instance, tool, args).await
    }

    /// The concurrency-aware entry point.
    ///
    /// Stateful bases with a session route to a dedicated
    /// session-owned instance; everything else goes through the
    /// admission queue.
    pub async fn call_queued(
        &self,
        base: &str,
        tool: &str,
        args: Value,
        session: Option<&str>,
    ) -> Result<ToolCallOutcome, HubError> {
        if let Some(session_id) = session {
            let stateful = self
                .instances
                .get(base)
                .map(|inst| inst.config.stateful)
                .unwrap_or(false);
            if stateful {
                return self
                    .call_session_instance(session_id, base, tool, args)
                    .await;
            }
        }
        self.queue.enqueue(base, tool, args).await
    }

    /// Stop and remove every instance owned by `session_id`, deleting
    /// its temp directories.
    pub async fn release_session(&self, session_id: &str) {
        let Some((_, ownership)) = self.sessions.remove(session_id) else {
            return;
        };
        for (base, internal) in ownership.instances {
            debug!(session_id, base, instance = %internal, "releasing session instance");
            self.stop_instance(&internal).await;
        }
        for dir in ownership.temp_dirs {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!(dir = %dir.display(), error = %e, "failed to remove session temp dir");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // Read-only
    // ─────────────────────────────────────────────────────────────────

    /// Snapshots of every live instance, sorted by internal name.
    #[must_use]
    pub fn list(&self) -> Vec<InstanceSnapshot> {
        let mut snapshots: Vec<InstanceSnapshot> = self
            .instances
            .iter()
            .map(|entry| entry.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.internal_name.cmp(&b.internal_name));
        snapshots
    }

    /// Snapshot of one instance by internal name.
    #[must_use]
    pub fn get(&self, internal: &str) -> Option<InstanceSnapshot> {
        self.instances.get(internal).map(|entry| entry.snapshot())
    }

    /// Cached tool list for an instance.
    #[must_use]
    pub fn tools_of(&self, internal: &str) -> Option<Vec<ToolDescriptor>> {
        self.instances.get(internal).map(|entry| entry.tools())
    }

    /// Stderr tail for a local instance.
    #[must_use]
    pub fn stderr_tail(&self, internal: &str) -> Option<Vec<String>> {
        self.instances
            .get(internal)
            .and_then(|entry| entry.client())
            .and_then(|client| client.stderr_tail())
    }

    /// Number of live instances.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.instances.len()
    }

    // ─────────────────────────────────────────────────────────────────
    // Spawning
    // ─────────────────────────────────────────────────────────────────

    fn base_lock(&self, base: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.spawn_locks
            .entry(base.to_owned())
            .or_default()
            .clone()
    }

    fn session_lock(&self, session_id: &str, base: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.session_spawn_locks
            .entry(format!("{session_id}:{base}"))
            .or_default()
            .clone()
    }

    /// Spawn one instance and connect it. Callers hold the relevant
    /// spawn mutex.
    async fn spawn_instance(
        &self,
        internal: String,
        base: String,
        index: Option<usize>,
        config: WorkerConfig,
        persist: bool,
    ) -> InstanceSnapshot {
        let instance = Arc::new(Instance::new(internal.clone(), base.clone(), index, config));
        let _ = self.instances.insert(internal.clone(), instance.clone());

        if index == Some(0) {
            self.bus
                .emit(EventKind::WorkerAdded, json!({"name": base}));
        }
        self.emit_state(&instance, "connecting", None);

        match self.connect_and_attach(&instance, persist).await {
            Ok(()) => {}
            Err(e) => {
                warn!(worker = %internal, error = %e, "spawn failed");
                instance.set_error(e.to_string());
                self.emit_state(&instance, "error", Some(&e.to_string()));
            }
        }
        instance.snapshot()
    }

    /// Connect the transport, wire callbacks, cache tools, register
    /// with the queue, and persist on success.
    async fn connect_and_attach(
        &self,
        instance: &Arc<Instance>,
        persist: bool,
    ) -> Result<(), HubError> {
        let client = (self.connector)(instance.internal_name.clone(), instance.config.clone())
            .await
            .map_err(|e| HubError::SpawnFailed(e.to_string()))?;

        // Tools-changed: overwrite the cache in place.
        {
            let cached = instance.clone();
            client.on_tools_changed(Box::new(move |tools| {
                debug!(worker = %cached.internal_name, count = tools.len(), "tool list changed");
                cached.set_tools(tools);
            }));
        }
        // Transport death feeds the reconnect machinery.
        {
            let weak = self.weak_self.clone();
            let internal = instance.internal_name.clone();
            client.on_closed(Box::new(move || {
                if let Some(supervisor) = weak.upgrade() {
                    let _ = tokio::spawn(async move {
                        supervisor.handle_closed(&internal).await;
                    });
                }
            }));
        }

        instance.set_connected(client.clone());
        instance.touch();

        // Eager tool caching: failure is a warning, not an error.
        match client.list_tools().await {
            Ok(tools) => instance.set_tools(tools),
            Err(e) => {
                warn!(worker = %instance.internal_name, error = %e, "initial tool listing failed");
            }
        }

        if persist {
            if let Err(e) = self.store.save_worker(&instance.config) {
                warn!(worker = %instance.internal_name, error = %e, "failed to persist config");
            }
            if let Some(pid) = client.process_id() {
                if let Err(e) = self.store.save_pid(&instance.base_name, pid) {
                    warn!(worker = %instance.internal_name, error = %e, "failed to persist pid");
                }
            }
        }

        // Session-owned instances never join the pool queue.
        if instance.index.is_some() {
            self.queue
                .register_instance(&instance.base_name, &instance.internal_name);
        }

        self.emit_state(instance, "connected", None);
        info!(worker = %instance.internal_name, tools = instance.tools().len(), "worker connected");
        Ok(())
    }

    /// Stop every instance of `base`; caller holds the base lock.
    async fn stop_pool_locked(&self, base: &str) -> bool {
        self.queue.drain(base);
        let internals: Vec<String> = self
            .instances
            .iter()
            .filter(|entry| entry.base_name == base)
            .map(|entry| entry.internal_name.clone())
            .collect();
        let stopped_any = !internals.is_empty();
        for internal in internals {
            self.stop_instance(&internal).await;
        }
        stopped_any
    }

    /// Idempotently stop one instance by internal name.
    async fn stop_instance(&self, internal: &str) {
        if let Some((_, timer)) = self.reconnect_timers.remove(internal) {
            timer.abort();
        }
        let Some((_, instance)) = self.instances.remove(internal) else {
            return;
        };
        self.queue.unregister_instance(&instance.base_name, internal);

        let client = instance.client();
        instance.set_stopped();
        if let Some(client) = client {
            client.close().await;
        }

        if instance.is_primary() && instance.config.transport.is_local() {
            if let Err(e) = self.store.delete_pid(&instance.base_name) {
                warn!(worker = %internal, error = %e, "failed to clear pid");
            }
        }

        self.emit_state(&instance, "stopped", None);
        self.bus.emit(
            EventKind::WorkerRemoved,
            json!({"name": instance.base_name, "internal": internal}),
        );
        debug!(worker = %internal, "instance stopped");
    }

    // ─────────────────────────────────────────────────────────────────
    // Failure handling and reconnect
    // ─────────────────────────────────────────────────────────────────

    /// Transport-closed entry point: classify the failure and schedule
    /// reconnects.
    async fn handle_closed(&self, internal: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let Some(instance) = self.instances.get(internal).map(|e| e.clone()) else {
            return;
        };
        match instance.state() {
            WorkerState::Stopped | WorkerState::Error => return,
            WorkerState::Connecting | WorkerState::Connected | WorkerState::Restarting => {}
        }

        let tail = instance.client().and_then(|c| c.stderr_tail());
        self.queue
            .unregister_instance(&instance.base_name, internal);

        // Permanent-failure markers keep the instance in ERROR with the
        // stderr evidence attached; no reconnect is scheduled.
        if let Some(tail) = &tail {
            if has_permanent_failure_marker(tail) {
                let evidence = last_lines(tail, LAST_ERROR_LINES);
                warn!(worker = %internal, "permanent failure detected, not reconnecting");
                instance.set_error(evidence.clone());
                self.emit_state(&instance, "error", Some(&evidence));
                return;
            }
        }

        instance.set_error("transport closed");
        self.emit_state(&instance, "error", Some("transport closed"));

        // Session-owned instances live and die with their session.
        if instance.is_session_owned() {
            return;
        }

        self.schedule_reconnect(instance);
    }

    fn schedule_reconnect(&self, instance: Arc<Instance>) {
        let start_attempt = instance.reconnect_count();
        if start_attempt >= MAX_RECONNECT_ATTEMPTS {
            warn!(worker = %instance.internal_name, "reconnect attempts exhausted");
            return;
        }

        let weak = self.weak_self.clone();
        let internal = instance.internal_name.clone();
        let timer = tokio::spawn(async move {
            let mut attempt = start_attempt;
            while attempt < MAX_RECONNECT_ATTEMPTS {
                let delay = RECONNECT_BASE_DELAY * 2u32.pow(attempt);
                debug!(worker = %instance.internal_name, attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                let Some(supervisor) = weak.upgrade() else { return };
                tokio::select! {
                    () = supervisor.shutdown.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
                if instance.state() == WorkerState::Stopped {
                    return;
                }

                instance.set_connecting();
                supervisor.emit_state(&instance, "connecting", None);
                match supervisor.connect_and_attach(&instance, false).await {
                    Ok(()) => {
                        instance.set_reconnect_count(0);
                        info!(worker = %instance.internal_name, "reconnected");
                        return;
                    }
                    Err(e) => {
                        attempt += 1;
                        // Carried forward so a later crash resumes the
                        // backoff where it left off.
                        instance.set_reconnect_count(attempt);
                        instance.set_error(e.to_string());
                        supervisor.emit_state(&instance, "error", Some(&e.to_string()));
                        warn!(worker = %instance.internal_name, attempt, error = %e, "reconnect failed");
                    }
                }
            }
        });
        let _ = self.reconnect_timers.insert(internal, timer);
    }

    // ─────────────────────────────────────────────────────────────────
    // Queue integration
    // ─────────────────────────────────────────────────────────────────

    /// `execute` callback target: run one queued call on an instance.
    async fn execute_queued(
        &self,
        internal: &str,
        tool: &str,
        args: Value,
    ) -> Result<ToolCallOutcome, HubError> {
        let instance = self
            .instances
            .get(internal)
            .map(|e| e.clone())
            .ok_or_else(|| HubError::not_found(format!("instance '{internal}'")))?;
        self.execute_on_instance(&instance, tool, args).await
    }

    /// Shared call path: busy gate, timeout, event emission.
    async fn execute_on_instance(
        &self,
        instance: &Arc<Instance>,
        tool: &str,
        args: Value,
    ) -> Result<ToolCallOutcome, HubError> {
        // At most one outstanding call per instance.
        let _serial = instance.call_lock.lock().await;

        if instance.state() != WorkerState::Connected {
            return Err(HubError::NotConnected(format!(
                "worker '{}' is {:?}",
                instance.internal_name,
                instance.state()
            )));
        }
        let client = instance.client().ok_or_else(|| {
            HubError::NotConnected(format!("worker '{}' has no client", instance.internal_name))
        })?;

        self.bus.emit(
            EventKind::ToolCall,
            json!({"server": instance.internal_name, "tool": tool}),
        );
        let _ = instance.try_mark_busy();

        let result = client
            .call_tool(tool, args, self.config.call_timeout)
            .await;
        instance.mark_idle();

        let mapped = result.map_err(|e| match e {
            ClientError::Timeout(m) => HubError::Timeout(m),
            ClientError::Cancelled => HubError::Cancelled("call cancelled".into()),
            ClientError::Worker(m) => HubError::Worker(m),
            ClientError::Protocol(m) | ClientError::Unreachable(m) => HubError::Worker(m),
            ClientError::Closed => HubError::Worker("transport closed mid-call".into()),
        });

        self.bus.emit(
            EventKind::ToolResult,
            json!({
                "server": instance.internal_name,
                "tool": tool,
                "ok": mapped.as_ref().map(|o| !o.is_error).unwrap_or(false),
            }),
        );
        mapped
    }

    /// `on_scale_up` callback target: grow the pool for `base` by one.
    async fn scale_up(&self, base: &str) {
        let outcome = self.try_scale_up(base).await;
        if let Err(reason) = outcome {
            debug!(base, reason, "scale-up refused");
        }
        self.queue.clear_pending_scale(base);
    }

    async fn try_scale_up(&self, base: &str) -> Result<(), &'static str> {
        if self.shutdown.is_cancelled() {
            return Err("shutting down");
        }
        let primary = self
            .instances
            .get(base)
            .map(|e| e.clone())
            .ok_or("no primary")?;
        if primary.config.transport != WorkerTransport::Local {
            return Err("transport is not local");
        }
        if primary.config.stateful {
            return Err("stateful workers never scale");
        }

        let lock = self.base_lock(base);
        let _guard = lock.lock().await;

        let pool: Vec<usize> = self
            .instances
            .iter()
            .filter(|e| e.base_name == base)
            .filter_map(|e| e.index)
            .collect();
        if pool.len() >= self.config.max_pool {
            return Err("pool at max size");
        }
        let k = smallest_free_index(&pool);
        let internal = scaled_name(base, k);

        info!(base, instance = %internal, "scaling pool up");
        let snapshot = self
            .spawn_instance(internal.clone(), base.to_owned(), Some(k), primary.config.clone(), false)
            .await;

        if snapshot.state == WorkerState::Connected {
            self.bus.emit(
                EventKind::PoolScaled,
                json!({"name": base, "instance": internal, "size": pool.len() + 1}),
            );
            Ok(())
        } else {
            // Failed clone: drop it from the index rather than leaving
            // a dead scaled instance behind.
            self.stop_instance(&internal).await;
            Err("scaled spawn failed")
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // Periodic loops
    // ─────────────────────────────────────────────────────────────────

    /// Stop non-primary, non-session, idle instances past the idle-kill
    /// age. Primaries and session-owned instances are never reaped.
    async fn reap_idle(&self) {
        let idle_kill = self.config.idle_kill;
        let victims: Vec<String> = self
            .instances
            .iter()
            .filter(|e| matches!(e.index, Some(i) if i > 0))
            .filter(|e| !e.is_busy() && e.idle_for() >= idle_kill)
            .map(|e| e.internal_name.clone())
            .collect();
        for internal in victims {
            info!(instance = %internal, "reaping idle scaled instance");
            self.stop_instance(&internal).await;
        }
    }

    /// Probe every CONNECTED primary with a bounded `list_tools`.
    /// Failures are isolated per worker and trigger a restart.
    fn probe_health(&self) {
        let primaries: Vec<Arc<Instance>> = self
            .instances
            .iter()
            .filter(|e| e.is_primary() && e.state() == WorkerState::Connected)
            .map(|e| e.clone())
            .collect();

        for instance in primaries {
            let weak = self.weak_self.clone();
            let _ = tokio::spawn(async move {
                let Some(supervisor) = weak.upgrade() else { return };
                let Some(client) = instance.client() else { return };
                let probe =
                    tokio::time::timeout(supervisor.config.health_timeout, client.list_tools())
                        .await;
                let healthy = matches!(probe, Ok(Ok(_)));
                if healthy {
                    return;
                }
                warn!(worker = %instance.internal_name, "health probe failed, restarting");
                instance.set_restarting();
                supervisor.emit_state(&instance, "restarting", Some("health_check_failed"));
                if let Err(e) = supervisor.restart(&instance.base_name).await {
                    warn!(worker = %instance.internal_name, error = %e, "health restart failed");
                }
            });
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // Session-scoped routing
    // ─────────────────────────────────────────────────────────────────

    /// Route a call from `session_id` to its dedicated instance of a
    /// stateful base, spawning it on first use.
    async fn call_session_instance(
        &self,
        session_id: &str,
        base: &str,
        tool: &str,
        args: Value,
    ) -> Result<ToolCallOutcome, HubError> {
        // Fast path: mapping exists and the instance is live.
        if let Some(instance) = self.session_instance(session_id, base) {
            return self.execute_on_instance(&instance, tool, args).await;
        }

        let lock = self.session_lock(session_id, base);
        let _guard = lock.lock().await;

        // Re-check under the mutex; a concurrent call may have spawned it.
        if let Some(instance) = self.session_instance(session_id, base) {
            return self.execute_on_instance(&instance, tool, args).await;
        }

        let primary = self
            .instances
            .get(base)
            .map(|e| e.clone())
            .ok_or_else(|| HubError::not_found(format!("worker '{base}'")))?;

        let internal = session_name(base, session_id);
        let mut config = primary.config.clone();
        self.apply_session_launch_mutation(session_id, &mut config)?;

        info!(session_id, base, instance = %internal, "spawning session-owned instance");
        let snapshot = self
            .spawn_instance(internal.clone(), base.to_owned(), None, config, false)
            .await;
        if snapshot.state != WorkerState::Connected {
            let message = snapshot
                .last_error
                .unwrap_or_else(|| "session instance failed to start".into());
            self.stop_instance(&internal).await;
            return Err(HubError::SpawnFailed(message));
        }

        let _ = self
            .sessions
            .entry(session_id.to_owned())
            .or_default()
            .instances
            .insert(base.to_owned(), internal.clone());

        let instance = self
            .instances
            .get(&internal)
            .map(|e| e.clone())
            .ok_or_else(|| HubError::internal("session instance vanished after spawn"))?;
        self.execute_on_instance(&instance, tool, args).await
    }

    fn session_instance(&self, session_id: &str, base: &str) -> Option<Arc<Instance>> {
        let internal = self
            .sessions
            .get(session_id)?
            .instances
            .get(base)?
            .clone();
        self.instances.get(&internal).map(|e| e.clone())
    }

    /// Browser-automation launch mutator: isolated-capable variants get
    /// a sentinel flag; profile-dir variants get a fresh temp directory
    /// recorded against the session for teardown.
    fn apply_session_launch_mutation(
        &self,
        session_id: &str,
        config: &mut WorkerConfig,
    ) -> Result<(), HubError> {
        let haystack = |needle: &str| {
            config
                .command
                .as_deref()
                .is_some_and(|c| c.contains(needle))
                || config.args.iter().any(|a| a.contains(needle))
        };

        if haystack("playwright") {
            if !config.args.iter().any(|a| a == "--isolated") {
                config.args.push("--isolated".into());
            }
        } else if haystack("puppeteer") {
            let sessions_dir = self.config.data_dir.join("session-profiles");
            std::fs::create_dir_all(&sessions_dir)
                .map_err(|e| HubError::internal(format!("create profile dir: {e}")))?;
            let dir = tempfile::Builder::new()
                .prefix("profile-")
                .tempdir_in(&sessions_dir)
                .map_err(|e| HubError::internal(format!("create profile dir: {e}")))?
                .keep();
            config
                .args
                .push(format!("--user-data-dir={}", dir.display()));
            self.sessions
                .entry(session_id.to_owned())
                .or_default()
                .temp_dirs
                .push(dir);
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────
    // Restore
    // ─────────────────────────────────────────────────────────────────

    /// Re-declare every persisted worker concurrently. Per-worker
    /// failures are logged and non-fatal.
    pub async fn restore_persisted(&self) {
        let configs = match self.store.list_workers() {
            Ok(configs) => configs,
            Err(e) => {
                warn!(error = %e, "failed to read persisted workers");
                return;
            }
        };
        if configs.is_empty() {
            return;
        }
        info!(count = configs.len(), "restoring persisted workers");

        let declares = configs.into_iter().map(|config| async move {
            let name = config.name.clone();
            match self.declare(config).await {
                Ok(snapshot) if snapshot.state == WorkerState::Connected => {}
                Ok(snapshot) => {
                    warn!(worker = %name, state = ?snapshot.state, "restore did not connect");
                }
                Err(e) => warn!(worker = %name, error = %e, "restore failed"),
            }
        });
        futures::future::join_all(declares).await;
    }

    // ─────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────

    fn emit_state(&self, instance: &Instance, state: &str, reason: Option<&str>) {
        let mut data = json!({
            "name": instance.base_name,
            "internal": instance.internal_name,
            "state": state,
        });
        if let Some(reason) = reason {
            data["reason"] = Value::String(reason.to_owned());
        }
        self.bus.emit(EventKind::WorkerState, data);
    }
}

/// Smallest positive integer not currently used as a scaled index.
fn smallest_free_index(used: &[usize]) -> usize {
    let mut k = 1;
    while used.contains(&k) {
        k += 1;
    }
    k
}

/// Last `n` lines of a tail, joined with newlines.
fn last_lines(tail: &[String], n: usize) -> String {
    let skip = tail.len().saturating_sub(n);
    tail[skip..].join("\n")
}

/// The production transport factory.
fn default_connector() -> Connector {
    Arc::new(|internal: String, config: WorkerConfig| {
        Box::pin(async move {
            let client: Arc<dyn WorkerClient> = match config.transport {
                WorkerTransport::Local => {
                    let command = config
                        .command
                        .as_deref()
                        .ok_or_else(|| ClientError::Unreachable("missing command".into()))?;
                    Arc::new(
                        LocalWorkerClient::connect(&internal, command, &config.args, &config.env)
                            .await?,
                    )
                }
                WorkerTransport::Sse => {
                    let url = config
                        .url
                        .as_deref()
                        .ok_or_else(|| ClientError::Unreachable("missing url".into()))?;
                    Arc::new(SseWorkerClient::connect(&internal, url, &config.headers).await?)
                }
                WorkerTransport::StreamableHttp => {
                    let url = config
                        .url
                        .as_deref()
                        .ok_or_else(|| ClientError::Unreachable("missing url".into()))?;
                    Arc::new(
                        StreamableHttpWorkerClient::connect(&internal, url, &config.headers)
                            .await?,
                    )
                }
            };
            Ok(client)
        })
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallest_free_index_fills_gaps() {
        assert_eq!(smallest_free_index(&[0]), 1);
        assert_eq!(smallest_free_index(&[0, 1, 2]), 3);
        assert_eq!(smallest_free_index(&[0, 1, 3]), 2);
        assert_eq!(smallest_free_index(&[]), 1);
        assert_eq!(smallest_free_index(&[0, 2, 3]), 1);
    }

    #[test]
    fn last_lines_takes_suffix() {
        let tail: Vec<String> = (0..8).map(|i| format!("l{i}")).collect();
        assert_eq!(last_lines(&tail, 3), "l5\nl6\nl7");
        assert_eq!(last_lines(&tail, 100).lines().count(), 8);
        assert_eq!(last_lines(&[], 5), "");
    }

    #[test]
    fn backoff_schedule_doubles() {
        let delays: Vec<Duration> = (0..MAX_RECONNECT_ATTEMPTS)
            .map(|attempt| RECONNECT_BASE_DELAY * 2u32.pow(attempt))
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
    }
}
