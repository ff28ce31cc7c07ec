//! End-to-end supervisor scenarios against scripted worker clients.
//!
//! The connector is injected, so these tests exercise the lifecycle
//! machinery (pools, queues, reconnects, sessions) without spawning
//! real processes. Timing-sensitive tests run on tokio's paused clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use swarm_client::{ClientError, ClosedHandler, ToolsChangedHandler, WorkerClient};
use swarm_core::config::HubConfig;
use swarm_core::tools::{ToolCallOutcome, ToolDescriptor};
use swarm_core::worker::{WorkerConfig, WorkerTransport};
use swarm_runtime::supervisor::Connector;
use swarm_runtime::{EventBus, Supervisor, WorkerState};
use swarm_store::Store;

// ─────────────────────────────────────────────────────────────────────────────
// Scripted client
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct Script {
    /// How long each tool call takes.
    call_delay: Duration,
    /// Lines exposed as the stderr tail.
    stderr: Option<Vec<String>>,
    /// Fail `list_tools` (health probes) when set.
    fail_list_tools: Arc<AtomicBool>,
}

struct ScriptedClient {
    script: Script,
    closed: Mutex<Option<ClosedHandler>>,
    closed_fired: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedClient {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            closed: Mutex::new(None),
            closed_fired: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    /// Simulate the transport dying (crash, EOF).
    fn trigger_close(&self) {
        if self.closed_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handler) = self.closed.lock().take() {
            handler();
        }
    }
}

#[async_trait]
impl WorkerClient for ScriptedClient {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ClientError> {
        if self.script.fail_list_tools.load(Ordering::SeqCst) {
            return Err(ClientError::Worker("probe refused".into()));
        }
        Ok(vec![ToolDescriptor::new(
            "run",
            "scripted tool",
            json!({"type": "object"}),
        )])
    }

    async fn call_tool(
        &self,
        tool: &str,
        _args: Value,
        _timeout: Duration,
    ) -> Result<ToolCallOutcome, ClientError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.script.call_delay.is_zero() {
            tokio::time::sleep(self.script.call_delay).await;
        }
        Ok(ToolCallOutcome::text(format!("{tool}: done")))
    }

    fn on_tools_changed(&self, _handler: ToolsChangedHandler) {}

    fn on_closed(&self, handler: ClosedHandler) {
        if self.closed_fired.load(Ordering::SeqCst) {
            handler();
        } else {
            *self.closed.lock() = Some(handler);
        }
    }

    async fn close(&self) {
        self.trigger_close();
    }

    fn stderr_tail(&self) -> Option<Vec<String>> {
        self.script.stderr.clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

/// Shared record of every connect attempt and the clients handed out.
#[derive(Default)]
struct ConnectLog {
    attempts: Mutex<Vec<(String, tokio::time::Instant)>>,
    clients: Mutex<Vec<(String, Arc<ScriptedClient>)>>,
    /// Refuse connections after the first `allow` successes per name.
    fail_after: Mutex<HashMap<String, usize>>,
}

impl ConnectLog {
    fn attempts_for(&self, internal: &str) -> Vec<tokio::time::Instant> {
        self.attempts
            .lock()
            .iter()
            .filter(|(name, _)| name == internal)
            .map(|(_, at)| *at)
            .collect()
    }

    fn latest_client(&self, internal: &str) -> Option<Arc<ScriptedClient>> {
        self.clients
            .lock()
            .iter()
            .rev()
            .find(|(name, _)| name == internal)
            .map(|(_, c)| c.clone())
    }
}

fn scripted_connector(script: Script, log: Arc<ConnectLog>) -> Connector {
    Arc::new(move |internal: String, _config: WorkerConfig| {
        let script = script.clone();
        let log = log.clone();
        Box::pin(async move {
            log.attempts
                .lock()
                .push((internal.clone(), tokio::time::Instant::now()));

            let mut budgets = log.fail_after.lock();
            if let Some(allowed) = budgets.get_mut(&internal) {
                if *allowed == 0 {
                    return Err(ClientError::Unreachable("scripted refusal".into()));
                }
                *allowed -= 1;
            }
            drop(budgets);

            let client = ScriptedClient::new(script);
            log.clients.lock().push((internal.clone(), client.clone()));
            Ok(Arc::clone(&client) as Arc<dyn WorkerClient>)
        })
    })
}

fn test_config() -> HubConfig {
    HubConfig {
        data_dir: std::env::temp_dir().join("swarm-scenarios"),
        health_interval: Duration::ZERO,
        ..HubConfig::default()
    }
}

fn harness(script: Script, config: HubConfig) -> (Arc<Supervisor>, Arc<ConnectLog>) {
    let log = Arc::new(ConnectLog::default());
    let store = Arc::new(Store::open_in_memory().unwrap());
    let supervisor = Supervisor::with_connector(
        config,
        store,
        EventBus::new(),
        scripted_connector(script, log.clone()),
    );
    (supervisor, log)
}

fn local_config(name: &str, stateful: bool) -> WorkerConfig {
    WorkerConfig {
        name: name.into(),
        transport: WorkerTransport::Local,
        command: Some("scripted".into()),
        args: vec![],
        env: HashMap::new(),
        url: None,
        headers: HashMap::new(),
        description: String::new(),
        stateful,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn declare_connects_and_caches_tools() {
    let (supervisor, _log) = harness(Script::default(), test_config());
    let snapshot = supervisor.declare(local_config("w", false)).await.unwrap();
    assert_eq!(snapshot.state, WorkerState::Connected);
    assert_eq!(snapshot.tool_count, 1);
    assert_eq!(snapshot.index, Some(0));

    let tools = supervisor.tools_of("w").unwrap();
    assert_eq!(tools[0].name, "run");
}

#[tokio::test]
async fn declare_persists_only_after_connect() {
    let (supervisor, log) = harness(Script::default(), test_config());
    let _ = log.fail_after.lock().insert("broken".into(), 0);

    let snapshot = supervisor
        .declare(local_config("broken", false))
        .await
        .unwrap();
    assert_eq!(snapshot.state, WorkerState::Error);
    assert!(supervisor.store().get_worker("broken").unwrap().is_none());

    let ok = supervisor.declare(local_config("ok", false)).await.unwrap();
    assert_eq!(ok.state, WorkerState::Connected);
    assert!(supervisor.store().get_worker("ok").unwrap().is_some());
}

#[tokio::test]
async fn declare_replaces_existing_primary() {
    let (supervisor, _log) = harness(Script::default(), test_config());
    let _ = supervisor.declare(local_config("w", false)).await.unwrap();

    let mut updated = local_config("w", false);
    updated.description = "v2".into();
    let snapshot = supervisor.declare(updated).await.unwrap();
    assert_eq!(snapshot.state, WorkerState::Connected);

    // Exactly one live instance for the base.
    let live: Vec<_> = supervisor
        .list()
        .into_iter()
        .filter(|s| s.base_name == "w")
        .collect();
    assert_eq!(live.len(), 1);
    assert_eq!(
        supervisor.store().get_worker("w").unwrap().unwrap().description,
        "v2"
    );
}

#[tokio::test]
async fn declared_config_round_trips_through_stop_and_start() {
    let (supervisor, _log) = harness(Script::default(), test_config());
    let mut config = local_config("w", false);
    let _ = config.env.insert("KEY".into(), "value".into());
    config.args = vec!["--flag".into()];
    let declared = config.clone().validate().unwrap();

    let _ = supervisor.declare(config).await.unwrap();
    assert!(supervisor.stop("w").await);
    assert!(supervisor.get("w").is_none());

    // The persisted config is exactly what was declared.
    assert_eq!(
        supervisor.store().get_worker("w").unwrap().unwrap(),
        declared
    );

    // And a restart from the store comes back CONNECTED.
    let snapshot = supervisor.restart("w").await.unwrap();
    assert_eq!(snapshot.state, WorkerState::Connected);
}

#[tokio::test]
async fn direct_call_requires_connected_instance() {
    let (supervisor, _log) = harness(Script::default(), test_config());
    let err = supervisor.call("ghost", "run", json!({})).await.unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");

    let _ = supervisor.declare(local_config("w", false)).await.unwrap();
    let outcome = supervisor.call("w", "run", json!({})).await.unwrap();
    assert!(!outcome.is_error);
    assert_eq!(outcome.joined_text(), "run: done");
}

#[tokio::test(start_paused = true)]
async fn queued_calls_flow_through_the_pool() {
    let (supervisor, _log) = harness(Script::default(), test_config());
    supervisor.start_background_tasks();
    let _ = supervisor.declare(local_config("w", false)).await.unwrap();

    let outcome = supervisor
        .call_queued("w", "run", json!({}), None)
        .await
        .unwrap();
    assert_eq!(outcome.joined_text(), "run: done");
    supervisor.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn pool_scales_under_sustained_load_then_reaps() {
    let script = Script {
        call_delay: Duration::from_secs(3),
        ..Script::default()
    };
    let (supervisor, _log) = harness(script, test_config());
    supervisor.start_background_tasks();
    let _ = supervisor.declare(local_config("w", false)).await.unwrap();

    let calls: Vec<_> = (0..4)
        .map(|_| {
            let supervisor = supervisor.clone();
            tokio::spawn(async move {
                supervisor.call_queued("w", "run", json!({}), None).await
            })
        })
        .collect();
    for call in calls {
        let outcome = call.await.unwrap().unwrap();
        assert!(!outcome.is_error);
    }

    // The pool grew past the primary but never past max_pool.
    let pool: Vec<_> = supervisor
        .list()
        .into_iter()
        .filter(|s| s.base_name == "w")
        .collect();
    assert!(pool.len() > 1, "pool should have scaled, got {}", pool.len());
    assert!(pool.len() <= supervisor.config().max_pool);
    assert!(pool.iter().any(|s| s.internal_name == "w#1"));

    // Indices are unique.
    let mut indices: Vec<_> = pool.iter().filter_map(|s| s.index).collect();
    indices.sort_unstable();
    indices.dedup();
    assert_eq!(indices.len(), pool.len());

    // Idle reaper clears the scaled copies; the primary survives.
    tokio::time::sleep(Duration::from_secs(90)).await;
    let remaining: Vec<_> = supervisor
        .list()
        .into_iter()
        .filter(|s| s.base_name == "w")
        .collect();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].internal_name, "w");
    supervisor.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn stateful_base_never_scales() {
    let script = Script {
        call_delay: Duration::from_secs(3),
        ..Script::default()
    };
    let (supervisor, _log) = harness(script, test_config());
    supervisor.start_background_tasks();
    let _ = supervisor.declare(local_config("b", true)).await.unwrap();

    // Queue without a session id: stateful routing is not taken, but
    // scaling must still be refused.
    let calls: Vec<_> = (0..3)
        .map(|_| {
            let supervisor = supervisor.clone();
            tokio::spawn(async move {
                supervisor.call_queued("b", "run", json!({}), None).await
            })
        })
        .collect();
    for call in calls {
        let _ = call.await.unwrap().unwrap();
    }

    let pool: Vec<_> = supervisor
        .list()
        .into_iter()
        .filter(|s| s.base_name == "b")
        .collect();
    assert_eq!(pool.len(), 1, "stateful pools must not scale");
    supervisor.stop_all().await;
}

#[tokio::test]
async fn session_isolation_spawns_dedicated_instances() {
    let (supervisor, _log) = harness(Script::default(), test_config());
    let _ = supervisor.declare(local_config("browser", true)).await.unwrap();

    let s1 = "11111111aaaa";
    let s2 = "22222222bbbb";
    let _ = supervisor
        .call_queued("browser", "run", json!({}), Some(s1))
        .await
        .unwrap();
    let _ = supervisor
        .call_queued("browser", "run", json!({}), Some(s2))
        .await
        .unwrap();

    let owned: Vec<_> = supervisor
        .list()
        .into_iter()
        .filter(|s| s.internal_name.contains('@'))
        .collect();
    assert_eq!(owned.len(), 2);
    assert!(owned.iter().any(|s| s.internal_name == "browser@11111111"));
    assert!(owned.iter().any(|s| s.internal_name == "browser@22222222"));
    assert!(owned.iter().all(|s| s.index.is_none()));

    // Closing one session removes exactly its instance.
    supervisor.release_session(s2).await;
    let after: Vec<_> = supervisor
        .list()
        .into_iter()
        .filter(|s| s.internal_name.contains('@'))
        .collect();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].internal_name, "browser@11111111");
    assert_eq!(after[0].state, WorkerState::Connected);
}

#[tokio::test]
async fn session_instances_reused_within_session() {
    let (supervisor, log) = harness(Script::default(), test_config());
    let _ = supervisor.declare(local_config("browser", true)).await.unwrap();

    let sid = "33333333cccc";
    for _ in 0..3 {
        let _ = supervisor
            .call_queued("browser", "run", json!({}), Some(sid))
            .await
            .unwrap();
    }
    // One primary connect plus exactly one session spawn.
    assert_eq!(log.attempts_for("browser@33333333").len(), 1);
    let client = log.latest_client("browser@33333333").unwrap();
    assert_eq!(client.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn reconnect_backoff_schedule() {
    let (supervisor, log) = harness(Script::default(), test_config());
    let _ = supervisor.declare(local_config("w", false)).await.unwrap();

    // Every reconnect attempt is refused.
    let _ = log.fail_after.lock().insert("w".into(), 0);

    let client = log.latest_client("w").unwrap();
    let crash_at = tokio::time::Instant::now();
    client.trigger_close();

    // Let the full backoff schedule elapse (2 + 4 + 8 s, plus slack).
    tokio::time::sleep(Duration::from_secs(60)).await;

    let attempts = log.attempts_for("w");
    // First entry is the original declare; three reconnects follow.
    assert_eq!(attempts.len(), 4, "exactly three reconnect attempts");
    let gaps: Vec<Duration> = attempts[1..]
        .iter()
        .map(|at| at.duration_since(crash_at))
        .collect();
    assert!(gaps[0] >= Duration::from_secs(2));
    assert!(gaps[1] >= gaps[0] + Duration::from_secs(4));
    assert!(gaps[2] >= gaps[1] + Duration::from_secs(8));

    let snapshot = supervisor.get("w").unwrap();
    assert_eq!(snapshot.state, WorkerState::Error);
    assert_eq!(snapshot.reconnect_count, 3);
}

#[tokio::test(start_paused = true)]
async fn successful_reconnect_resets_counter() {
    let (supervisor, log) = harness(Script::default(), test_config());
    let _ = supervisor.declare(local_config("w", false)).await.unwrap();

    let client = log.latest_client("w").unwrap();
    client.trigger_close();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let snapshot = supervisor.get("w").unwrap();
    assert_eq!(snapshot.state, WorkerState::Connected);
    assert_eq!(snapshot.reconnect_count, 0);
    // Original connect plus one reconnect.
    assert_eq!(log.attempts_for("w").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_markers_suppress_reconnect() {
    let script = Script {
        stderr: Some(vec![
            "npm ERR! code E404".into(),
            "npm ERR! 404 'ghost-worker' is not in this registry.".into(),
        ]),
        ..Script::default()
    };
    let (supervisor, log) = harness(script, test_config());
    let _ = supervisor.declare(local_config("w", false)).await.unwrap();

    let client = log.latest_client("w").unwrap();
    client.trigger_close();
    tokio::time::sleep(Duration::from_secs(60)).await;

    let snapshot = supervisor.get("w").unwrap();
    assert_eq!(snapshot.state, WorkerState::Error);
    let last_error = snapshot.last_error.unwrap();
    assert!(last_error.contains("not in this registry"));

    // No reconnect was ever attempted.
    assert_eq!(log.attempts_for("w").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_drains_queued_calls() {
    let (supervisor, _log) = harness(Script::default(), test_config());
    supervisor.start_background_tasks();

    // No worker declared for the base: the call queues and waits.
    let pending = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.call_queued("w", "run", json!({}), None).await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(!supervisor.stop("w").await);
    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.code(), "CANCELLED");
    assert!(err.to_string().contains("server stopped"));
    supervisor.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn health_probe_failure_triggers_restart() {
    let fail_list = Arc::new(AtomicBool::new(false));
    let script = Script {
        fail_list_tools: fail_list.clone(),
        ..Script::default()
    };
    let mut config = test_config();
    config.health_interval = Duration::from_secs(30);
    let (supervisor, log) = harness(script, config);
    supervisor.start_background_tasks();
    let _ = supervisor.declare(local_config("w", false)).await.unwrap();
    assert_eq!(log.attempts_for("w").len(), 1);

    // Break the probe after connect: list_tools now fails.
    fail_list.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(40)).await;

    // The watchdog restarted the worker (a fresh connect attempt).
    assert!(log.attempts_for("w").len() >= 2);
    supervisor.stop_all().await;
}

#[tokio::test]
async fn stop_all_leaves_nothing_live() {
    let (supervisor, _log) = harness(Script::default(), test_config());
    supervisor.start_background_tasks();
    let _ = supervisor.declare(local_config("a", false)).await.unwrap();
    let _ = supervisor.declare(local_config("b", true)).await.unwrap();
    let _ = supervisor
        .call_queued("b", "run", json!({}), Some("44444444dddd"))
        .await
        .unwrap();

    supervisor.stop_all().await;
    assert_eq!(supervisor.live_count(), 0);
}
