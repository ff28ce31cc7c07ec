//! Single-client stdio surface.
//!
//! The meta-tool server attaches to the parent process's standard
//! streams: newline-delimited JSON-RPC in on stdin, responses out on
//! stdout. No HTTP is started and no sessions are kept, so stateful
//! isolation is never taken — calls go to the supervisor without a
//! session id.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use swarm_runtime::Supervisor;

use crate::hub_tools::HubTools;
use crate::rpc::{handle_rpc, RpcIn};

/// Serve the tool protocol on stdin/stdout until EOF or shutdown.
pub async fn run(supervisor: Arc<Supervisor>, shutdown: CancellationToken) -> std::io::Result<()> {
    let tools = HubTools::new(supervisor);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    info!("stdio surface ready");
    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            info!("stdin closed, leaving stdio loop");
            break;
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let req = match serde_json::from_str::<RpcIn>(trimmed) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "ignoring malformed stdio message");
                continue;
            }
        };
        debug!(method = %req.method, "stdio request");

        // No session id: the stateful-isolation branch is not taken.
        if let Some(response) = handle_rpc(&tools, None, &req).await {
            let mut payload = serde_json::to_string(&response)?;
            payload.push('\n');
            stdout.write_all(payload.as_bytes()).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}
