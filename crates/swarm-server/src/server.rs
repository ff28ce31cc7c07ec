//! `HubServer` — the Axum control surface.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

use swarm_core::config::HubConfig;
use swarm_runtime::sessions::TeardownFn;
use swarm_runtime::{SessionRegistry, Supervisor};

use crate::events_route::events_handler;
use crate::health::{self, HealthResponse};
use crate::hub_tools::HubTools;
use crate::mcp;
use crate::shutdown::ShutdownCoordinator;

/// Shared state accessible from handlers.
#[derive(Clone)]
pub struct AppState {
    /// The singleton supervisor.
    pub supervisor: Arc<Supervisor>,
    /// The session index.
    pub sessions: Arc<SessionRegistry>,
    /// The meta-tool dispatcher.
    pub tools: Arc<HubTools>,
    /// Per-session server-push channels.
    pub session_channels: Arc<DashMap<String, mpsc::Sender<String>>>,
    /// Resolved configuration.
    pub config: HubConfig,
    /// Process start time.
    pub start_time: Instant,
    /// Prometheus render handle.
    pub metrics_handle: PrometheusHandle,
}

/// The HTTP control surface.
pub struct HubServer {
    state: AppState,
    shutdown: Arc<ShutdownCoordinator>,
}

impl HubServer {
    /// Wire the server around a supervisor.
    #[must_use]
    pub fn new(supervisor: Arc<Supervisor>, config: HubConfig) -> Self {
        let sessions = SessionRegistry::new(config.max_sessions, supervisor.bus().clone());
        let tools = Arc::new(HubTools::new(supervisor.clone()));
        let state = AppState {
            supervisor,
            sessions,
            tools,
            session_channels: Arc::new(DashMap::new()),
            config,
            start_time: Instant::now(),
            metrics_handle: metrics_handle(),
        };
        Self {
            state,
            shutdown: Arc::new(ShutdownCoordinator::new()),
        }
    }

    /// The shutdown coordinator.
    #[must_use]
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The shared state (tests and the stdio surface).
    #[must_use]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the router with all routes and middleware.
    #[must_use]
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route(
                "/mcp",
                get(mcp::get_handler)
                    .post(mcp::post_handler)
                    .delete(mcp::delete_handler),
            )
            .route("/health", get(health_handler))
            .route("/events", get(events_handler))
            .route("/metrics", get(metrics_handler))
            .route("/api/sessions", get(sessions_handler))
            .route("/api/logs/{base}", get(logs_handler))
            .route("/api/config", get(config_handler))
            .with_state(self.state.clone())
            .layer(CatchPanicLayer::new())
            .layer(RequestBodyLimitLayer::new(1024 * 1024));

        if self.state.config.cors {
            router = router.layer(CorsLayer::permissive());
        }
        router
    }

    /// Start the session idle GC; the handle joins the shutdown set.
    pub fn start_session_gc(&self) {
        let state = self.state.clone();
        let teardown: TeardownFn = Arc::new(move |session_id: String| {
            let state = state.clone();
            Box::pin(async move {
                // The registry already removed the session; finish the
                // teardown (channel + stateful instances).
                let _ = state.session_channels.remove(&session_id);
                state.supervisor.release_session(&session_id).await;
            })
        });
        let gc = self.state.sessions.start_gc(
            self.state.config.session_cleanup_interval,
            self.state.config.session_idle_timeout,
            teardown,
        );
        self.shutdown.register_task(gc);
    }

    /// Bind and serve. A configured unix socket path overrides
    /// host:port.
    pub async fn listen(
        &self,
    ) -> std::io::Result<(String, tokio::task::JoinHandle<()>)> {
        let router = self.router();
        let token = self.shutdown.token();

        if let Some(socket_path) = self.state.config.socket_path.clone() {
            let _ = std::fs::remove_file(&socket_path);
            let listener = tokio::net::UnixListener::bind(&socket_path)?;
            let bound = socket_path.display().to_string();
            info!(socket = %bound, "listening on unix socket");
            let handle = tokio::spawn(async move {
                let _ = axum::serve(listener, router)
                    .with_graceful_shutdown(async move { token.cancelled().await })
                    .await;
            });
            return Ok((bound, handle));
        }

        let addr = format!("{}:{}", self.state.config.host, self.state.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let bound = listener.local_addr()?.to_string();
        info!(addr = %bound, "listening");
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
        });
        Ok((bound, handle))
    }
}

/// Install (or fall back to a detached) Prometheus recorder.
fn metrics_handle() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .unwrap_or_else(|_| PrometheusBuilder::new().build_recorder().handle())
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.config.mode,
        state.sessions.count(),
        state.supervisor.live_count(),
    ))
}

/// GET /metrics — Prometheus text format.
async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics_handle.render()
}

/// GET /api/sessions
async fn sessions_handler(State(state): State<AppState>) -> Response {
    Json(state.sessions.list()).into_response()
}

/// GET /api/logs/{base} — stderr tail for a local worker.
async fn logs_handler(State(state): State<AppState>, Path(base): Path<String>) -> Response {
    match state.supervisor.stderr_tail(&base) {
        Some(lines) => Json(lines).into_response(),
        None => (StatusCode::NOT_FOUND, "no such local worker").into_response(),
    }
}

/// GET /api/config — the resolved runtime configuration.
async fn config_handler(State(state): State<AppState>) -> Json<HubConfig> {
    Json(state.config.clone())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
