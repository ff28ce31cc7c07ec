//! # swarm-hub
//!
//! Supervisor daemon binary: resolves configuration, opens the store,
//! terminates orphaned workers from a previous run, restores declared
//! workers, and serves the control surface (HTTP or stdio) until a
//! signal arrives.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use swarm_core::config::{HubConfig, HubMode};
use swarm_core::logging::init_subscriber;
use swarm_runtime::{EventBus, Supervisor};
use swarm_server::{HubServer, SHUTDOWN_DEADLINE};
use swarm_store::{ConnectionConfig, Store};

/// Local supervisor for tool-providing workers.
#[derive(Parser, Debug)]
#[command(name = "swarm-hub", about = "Local supervisor for tool workers")]
struct Cli {
    /// Bind host (loopback by default).
    #[arg(long)]
    host: Option<String>,

    /// TCP port for the HTTP surface.
    #[arg(long)]
    port: Option<u16>,

    /// Data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// SQLite database path.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Unix socket path (overrides host:port).
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Exposure mode: http or stdio.
    #[arg(long)]
    mode: Option<String>,

    /// Log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn apply(self, mut config: HubConfig) -> HubConfig {
        if let Some(data_dir) = self.data_dir {
            config.db_path = data_dir.join("swarm.db");
            config.data_dir = data_dir;
        }
        if let Some(db_path) = self.db_path {
            config.db_path = db_path;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(socket) = self.socket {
            config.socket_path = Some(socket);
        }
        match self.mode.as_deref() {
            Some("stdio") => config.mode = HubMode::Stdio,
            Some("http") => config.mode = HubMode::Http,
            Some(other) => warn!(mode = other, "unknown mode, keeping configured value"),
            None => {}
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_subscriber(&cli.log_level);
    let config = cli.apply(HubConfig::from_env());

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("create data dir {}", config.data_dir.display()))?;
    let store = Arc::new(
        Store::open(&config.db_path, &ConnectionConfig::default())
            .with_context(|| format!("open database {}", config.db_path.display()))?,
    );

    cleanup_orphans(&store).await;

    let bus = EventBus::new();
    let supervisor = Supervisor::new(config.clone(), store, bus);
    supervisor.start_background_tasks();
    supervisor.restore_persisted().await;

    match config.mode {
        HubMode::Http => run_http(supervisor, config).await,
        HubMode::Stdio => run_stdio(supervisor).await,
    }
}

async fn run_http(supervisor: Arc<Supervisor>, config: HubConfig) -> Result<()> {
    let server = HubServer::new(supervisor.clone(), config);
    server.start_session_gc();
    let (addr, serve_handle) = server.listen().await.context("bind control surface")?;
    info!(addr = %addr, "swarm-hub ready");

    wait_for_signal().await;
    info!("shutdown signal received");

    // Hard deadline: force-exit if graceful shutdown wedges.
    arm_force_exit();

    server.shutdown().graceful_shutdown(None).await;
    supervisor.stop_all().await;
    serve_handle.abort();
    info!("shutdown complete");
    Ok(())
}

async fn run_stdio(supervisor: Arc<Supervisor>) -> Result<()> {
    let shutdown = tokio_util::sync::CancellationToken::new();
    let stdio = {
        let supervisor = supervisor.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { swarm_server::stdio_mode::run(supervisor, token).await })
    };

    tokio::select! {
        () = wait_for_signal() => {
            info!("shutdown signal received");
            shutdown.cancel();
        }
        result = stdio => {
            if let Err(e) = result.context("stdio task")? {
                warn!(error = %e, "stdio surface failed");
            }
        }
    }

    arm_force_exit();
    supervisor.stop_all().await;
    info!("shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

/// Exit the process if graceful shutdown exceeds its deadline.
fn arm_force_exit() {
    let _ = tokio::spawn(async {
        tokio::time::sleep(SHUTDOWN_DEADLINE + Duration::from_secs(1)).await;
        warn!("graceful shutdown exceeded deadline, force-exiting");
        std::process::exit(1);
    });
}

/// Terminate workers recorded by a previous run: probe with signal 0,
/// SIGTERM the live ones, escalate to SIGKILL after 2 s, then clear
/// the table so restoration starts from a clean slate.
async fn cleanup_orphans(store: &Store) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pids = match store.list_pids() {
        Ok(pids) => pids,
        Err(e) => {
            warn!(error = %e, "failed to read pid table");
            return;
        }
    };
    if pids.is_empty() {
        return;
    }

    // Signal-0 probe first: stale table entries may point at pids that
    // no longer exist or were recycled by unrelated processes.
    let live: Vec<(String, i32)> = pids
        .into_iter()
        .filter_map(|(name, pid)| i32::try_from(pid).ok().map(|pid| (name, pid)))
        .filter(|(name, pid)| {
            let alive = kill(Pid::from_raw(*pid), None).is_ok();
            if !alive {
                info!(worker = %name, pid, "recorded pid no longer running");
            }
            alive
        })
        .collect();

    for (name, pid) in &live {
        info!(worker = %name, pid, "terminating orphaned worker");
        if let Err(e) = kill(Pid::from_raw(*pid), Signal::SIGTERM) {
            warn!(worker = %name, pid, error = %e, "SIGTERM failed");
        }
    }

    if !live.is_empty() {
        tokio::time::sleep(Duration::from_secs(2)).await;
        for (name, pid) in &live {
            if kill(Pid::from_raw(*pid), None).is_ok() {
                warn!(worker = %name, pid, "escalating to SIGKILL");
                let _ = kill(Pid::from_raw(*pid), Signal::SIGKILL);
            }
        }
    }

    if let Err(e) = store.clear_pids() {
        warn!(error = %e, "failed to clear pid table");
    }
}
