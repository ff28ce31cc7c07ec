//! Runtime configuration with environment overrides.
//!
//! Every tunable has an environment variable with the `SWARM_` prefix
//! and a legacy `HUB_` alias (`SWARM_` wins when both are set). Each
//! variable has strict parsing rules; invalid values are silently
//! ignored and the default stands.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

/// How the supervisor is exposed to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HubMode {
    /// Single client over the parent's standard streams.
    Stdio,
    /// Multi-client HTTP control surface.
    Http,
}

/// Resolved runtime configuration.
#[derive(Clone, Debug, Serialize)]
pub struct HubConfig {
    /// Data directory (database, session temp dirs).
    pub data_dir: PathBuf,
    /// SQLite database path. Defaults to `<data_dir>/swarm.db`.
    pub db_path: PathBuf,
    /// TCP port for the HTTP surface.
    pub port: u16,
    /// Bind host. Loopback by default.
    pub host: String,
    /// Optional unix socket path; overrides host:port when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    /// Exposure mode.
    pub mode: HubMode,
    /// Maximum concurrent client sessions.
    pub max_sessions: usize,
    /// Session idle timeout.
    #[serde(with = "millis")]
    pub session_idle_timeout: Duration,
    /// Session GC sweep interval.
    #[serde(with = "millis")]
    pub session_cleanup_interval: Duration,
    /// Per-call timeout after dispatch.
    #[serde(with = "millis")]
    pub call_timeout: Duration,
    /// Queue admission TTL.
    #[serde(with = "millis")]
    pub queue_ttl: Duration,
    /// Maximum instances per pool (primary included).
    pub max_pool: usize,
    /// How long the oldest queued call must wait before scale-up.
    #[serde(with = "millis")]
    pub scale_up_wait: Duration,
    /// Idle age after which non-primary instances are reaped.
    #[serde(with = "millis")]
    pub idle_kill: Duration,
    /// Health probe interval. Zero disables the watchdog.
    #[serde(with = "millis")]
    pub health_interval: Duration,
    /// Health probe budget.
    #[serde(with = "millis")]
    pub health_timeout: Duration,
    /// Whether CORS headers are served.
    pub cors: bool,
}

mod millis {
    use super::Duration;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        let db_path = data_dir.join("swarm.db");
        Self {
            data_dir,
            db_path,
            port: 37373,
            host: "127.0.0.1".into(),
            socket_path: None,
            mode: HubMode::Http,
            max_sessions: 50,
            session_idle_timeout: Duration::from_secs(30 * 60),
            session_cleanup_interval: Duration::from_secs(60),
            call_timeout: Duration::from_secs(60),
            queue_ttl: Duration::from_secs(60),
            max_pool: 4,
            scale_up_wait: Duration::from_secs(5),
            idle_kill: Duration::from_secs(60),
            health_interval: Duration::from_secs(60),
            health_timeout: Duration::from_secs(10),
            cors: false,
        }
    }
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_owned());
    PathBuf::from(home).join(".swarm")
}

impl HubConfig {
    /// Defaults overridden by `SWARM_*` (or legacy `HUB_*`) variables.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = read_string("DATA_DIR") {
            cfg.data_dir = PathBuf::from(v);
            cfg.db_path = cfg.data_dir.join("swarm.db");
        }
        if let Some(v) = read_string("DB_PATH") {
            cfg.db_path = PathBuf::from(v);
        }
        if let Some(v) = read_u64("PORT", 1, 65535) {
            #[allow(clippy::cast_possible_truncation)]
            {
                cfg.port = v as u16;
            }
        }
        if let Some(v) = read_string("HOST") {
            cfg.host = v;
        }
        if let Some(v) = read_string("SOCKET_PATH") {
            cfg.socket_path = Some(PathBuf::from(v));
        }
        if let Some(v) = read_string("MODE") {
            match v.as_str() {
                "stdio" => cfg.mode = HubMode::Stdio,
                "http" => cfg.mode = HubMode::Http,
                _ => {}
            }
        }
        if let Some(v) = read_u64("MAX_SESSIONS", 1, 10_000) {
            cfg.max_sessions = usize::try_from(v).unwrap_or(cfg.max_sessions);
        }
        if let Some(v) = read_u64("SESSION_IDLE_TIMEOUT_MS", 1_000, 86_400_000) {
            cfg.session_idle_timeout = Duration::from_millis(v);
        }
        if let Some(v) = read_u64("SESSION_CLEANUP_INTERVAL_MS", 1_000, 3_600_000) {
            cfg.session_cleanup_interval = Duration::from_millis(v);
        }
        if let Some(v) = read_u64("CALL_TIMEOUT_MS", 100, 3_600_000) {
            cfg.call_timeout = Duration::from_millis(v);
        }
        if let Some(v) = read_u64("QUEUE_TTL_MS", 100, 3_600_000) {
            cfg.queue_ttl = Duration::from_millis(v);
        }
        if let Some(v) = read_u64("MAX_POOL", 1, 64) {
            cfg.max_pool = usize::try_from(v).unwrap_or(cfg.max_pool);
        }
        if let Some(v) = read_u64("SCALE_UP_WAIT_MS", 100, 600_000) {
            cfg.scale_up_wait = Duration::from_millis(v);
        }
        if let Some(v) = read_u64("IDLE_KILL_MS", 1_000, 86_400_000) {
            cfg.idle_kill = Duration::from_millis(v);
        }
        if let Some(v) = read_u64("HEALTH_INTERVAL_MS", 0, 86_400_000) {
            cfg.health_interval = Duration::from_millis(v);
        }
        if let Some(v) = read_u64("HEALTH_TIMEOUT_MS", 100, 600_000) {
            cfg.health_timeout = Duration::from_millis(v);
        }
        if let Some(v) = read_bool("CORS") {
            cfg.cors = v;
        }

        cfg
    }

    /// Whether the health watchdog is enabled.
    #[must_use]
    pub fn health_enabled(&self) -> bool {
        !self.health_interval.is_zero()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Env helpers
// ─────────────────────────────────────────────────────────────────────────────

fn read_raw(suffix: &str) -> Option<String> {
    std::env::var(format!("SWARM_{suffix}"))
        .or_else(|_| std::env::var(format!("HUB_{suffix}")))
        .ok()
}

fn read_string(suffix: &str) -> Option<String> {
    read_raw(suffix).filter(|v| !v.trim().is_empty())
}

fn read_u64(suffix: &str, min: u64, max: u64) -> Option<u64> {
    read_raw(suffix)?
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|v| (min..=max).contains(v))
}

fn read_bool(suffix: &str) -> Option<bool> {
    match read_raw(suffix)?.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
