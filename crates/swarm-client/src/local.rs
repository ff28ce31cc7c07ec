//! Child-process transport: newline-delimited JSON-RPC on stdin/stdout.
//!
//! The adapter owns the child exclusively. A background reader task
//! demultiplexes responses to pending requests and dispatches peer
//! notifications; a second task feeds the stderr tail ring.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use swarm_core::tools::{ToolCallOutcome, ToolDescriptor};

use crate::pending::PendingMap;
use crate::protocol::{
    initialize_params, parse_tool_outcome, parse_tools_list, tool_call_params, InboundMessage,
    JsonRpcNotification, JsonRpcRequest, TOOLS_CHANGED_METHOD,
};
use crate::tail::StderrTail;
use crate::{Callbacks, ClientError, ClosedHandler, ToolsChangedHandler, WorkerClient,
    CLOSE_TIMEOUT, CONNECT_TIMEOUT};

/// Environment variables inherited by child workers. Everything else
/// is dropped so host secrets never leak into worker processes.
const INHERITED_ENV: [&str; 5] = ["PATH", "HOME", "USER", "LANG", "TERM"];

struct Shared {
    name: String,
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
    callbacks: Callbacks,
    tail: Arc<StderrTail>,
    cancel: CancellationToken,
}

impl Shared {
    async fn send_line(&self, line: &str) -> Result<(), ClientError> {
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|_| ClientError::Closed)?;
        stdin.write_all(b"\n").await.map_err(|_| ClientError::Closed)?;
        stdin.flush().await.map_err(|_| ClientError::Closed)?;
        Ok(())
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.pending.register(id);

        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        if let Err(e) = self.send_line(&line).await {
            self.pending.forget(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.pending.forget(id);
                Err(ClientError::Timeout(format!("{method} on '{}'", self.name)))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params))
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.send_line(&line).await
    }

    /// Drop every pending request; waiters observe [`ClientError::Closed`].
    fn fail_pending(&self) {
        self.pending.fail_all();
    }
}

/// Worker client for the local child-process transport.
pub struct LocalWorkerClient {
    shared: Arc<Shared>,
    child: tokio::sync::Mutex<Option<Child>>,
    pid: Option<u32>,
}

impl std::fmt::Debug for LocalWorkerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalWorkerClient")
            .field("name", &self.shared.name)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl LocalWorkerClient {
    /// Spawn the child and perform the initialize handshake.
    ///
    /// The whole connection sequence is bounded by [`CONNECT_TIMEOUT`].
    pub async fn connect(
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, ClientError> {
        let mut cmd = Command::new(command);
        let _ = cmd
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        // Minimal inherited environment plus the configured extras.
        cmd.env_clear();
        for key in INHERITED_ENV {
            if let Ok(val) = std::env::var(key) {
                let _ = cmd.env(key, val);
            }
        }
        for (k, v) in env {
            let _ = cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ClientError::Unreachable(format!("failed to spawn '{command}': {e}")))?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::Unreachable("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::Unreachable("failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ClientError::Unreachable("failed to capture stderr".into()))?;

        let shared = Arc::new(Shared {
            name: name.to_owned(),
            stdin: tokio::sync::Mutex::new(stdin),
            pending: PendingMap::default(),
            next_id: AtomicU64::new(1),
            callbacks: Callbacks::default(),
            tail: Arc::new(StderrTail::new()),
            cancel: CancellationToken::new(),
        });

        spawn_stderr_reader(shared.tail.clone(), shared.cancel.clone(), stderr);
        spawn_stdout_reader(shared.clone(), stdout);

        let client = Self {
            shared,
            child: tokio::sync::Mutex::new(Some(child)),
            pid,
        };

        match tokio::time::timeout(CONNECT_TIMEOUT, client.handshake()).await {
            Ok(Ok(())) => Ok(client),
            Ok(Err(e)) => {
                client.close().await;
                Err(e)
            }
            Err(_) => {
                client.close().await;
                Err(ClientError::Timeout(format!("connect to '{name}'")))
            }
        }
    }

    async fn handshake(&self) -> Result<(), ClientError> {
        let result = self
            .shared
            .request("initialize", Some(initialize_params()), CONNECT_TIMEOUT)
            .await?;
        debug!(worker = %self.shared.name, result = %result, "worker initialized");
        self.shared
            .notify("notifications/initialized", None)
            .await
    }

    /// The stderr tail ring, shared with the reader task.
    #[must_use]
    pub fn tail(&self) -> Arc<StderrTail> {
        self.shared.tail.clone()
    }
}

fn spawn_stderr_reader(
    tail: Arc<StderrTail>,
    cancel: CancellationToken,
    stderr: tokio::process::ChildStderr,
) {
    let _ = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                next = lines.next_line() => match next {
                    Ok(Some(line)) => tail.push(&line),
                    _ => break,
                },
            }
        }
    });
}

fn spawn_stdout_reader(shared: Arc<Shared>, stdout: tokio::process::ChildStdout) {
    let _ = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let next = tokio::select! {
                () = shared.cancel.cancelled() => break,
                next = lines.next_line() => next,
            };
            match next {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    handle_inbound(&shared, trimmed);
                }
                _ => break,
            }
        }
        shared.fail_pending();
        shared.callbacks.fire_closed();
        debug!(worker = %shared.name, "stdout reader finished");
    });
}

fn handle_inbound(shared: &Arc<Shared>, line: &str) {
    match serde_json::from_str::<InboundMessage>(line) {
        Ok(InboundMessage::Response(resp)) => {
            let id = resp.id;
            if id.is_none_or(|id| !shared.pending.resolve(id, resp)) {
                debug!(worker = %shared.name, ?id, "unmatched response, dropping");
            }
        }
        Ok(InboundMessage::Notification(notif)) => {
            if notif.method == TOOLS_CHANGED_METHOD {
                // Fetch the fresh list off the reader task so the
                // demux loop stays responsive.
                let shared = shared.clone();
                let _ = tokio::spawn(async move {
                    match shared.request("tools/list", None, CONNECT_TIMEOUT).await {
                        Ok(result) => match parse_tools_list(result) {
                            Ok(tools) => shared.callbacks.fire_tools_changed(tools),
                            Err(e) => {
                                warn!(worker = %shared.name, error = %e, "bad tools/list after change notification");
                            }
                        },
                        Err(e) => {
                            warn!(worker = %shared.name, error = %e, "tools/list after change notification failed");
                        }
                    }
                });
            } else {
                debug!(worker = %shared.name, method = %notif.method, "ignoring notification");
            }
        }
        Err(_) => {
            // Workers sometimes write diagnostics to stdout; skip them.
            debug!(worker = %shared.name, line, "ignoring non-protocol stdout line");
        }
    }
}

#[async_trait]
impl WorkerClient for LocalWorkerClient {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ClientError> {
        let result = self
            .shared
            .request("tools/list", None, CONNECT_TIMEOUT)
            .await?;
        parse_tools_list(result)
    }

    async fn call_tool(
        &self,
        tool: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<ToolCallOutcome, ClientError> {
        let result = self
            .shared
            .request("tools/call", Some(tool_call_params(tool, args)), timeout)
            .await?;
        parse_tool_outcome(result)
    }

    fn on_tools_changed(&self, handler: ToolsChangedHandler) {
        self.shared.callbacks.set_tools_changed(handler);
    }

    fn on_closed(&self, handler: ClosedHandler) {
        self.shared.callbacks.set_closed(handler);
    }

    async fn close(&self) {
        self.shared.cancel.cancel();
        self.shared.fail_pending();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            let _ = child.kill().await;
            match tokio::time::timeout(CLOSE_TIMEOUT, child.wait()).await {
                Ok(_) => {}
                Err(_) => warn!(worker = %self.shared.name, "child did not exit within close budget"),
            }
        }
        self.shared.callbacks.fire_closed();
    }

    fn process_id(&self) -> Option<u32> {
        self.pid
    }

    fn stderr_tail(&self) -> Option<Vec<String>> {
        Some(self.shared.tail.snapshot())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
