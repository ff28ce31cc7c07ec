//! `/health` payload.

use std::time::Instant;

use serde::Serialize;

use swarm_core::config::HubMode;

/// Response body for `GET /health`.
#[derive(Clone, Debug, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the process serves requests.
    pub status: &'static str,
    /// Exposure mode.
    pub mode: HubMode,
    /// Live client sessions.
    pub sessions: usize,
    /// Live worker instances.
    pub workers: usize,
    /// Seconds since startup.
    pub uptime_s: u64,
}

/// Build the health payload.
#[must_use]
pub fn health_check(
    start_time: Instant,
    mode: HubMode,
    sessions: usize,
    workers: usize,
) -> HealthResponse {
    HealthResponse {
        status: "ok",
        mode,
        sessions,
        workers,
        uptime_s: start_time.elapsed().as_secs(),
    }
}
