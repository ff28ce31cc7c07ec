//! Streamable HTTP transport.
//!
//! Every JSON-RPC message is POSTed to the endpoint; the response body
//! is either direct JSON or a one-shot SSE stream carrying the
//! response. The peer may assign a session id via the
//! `Mcp-Session-Id` header, echoed on subsequent requests. An optional
//! GET stream carries server-initiated notifications when the peer
//! supports one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use swarm_core::tools::{ToolCallOutcome, ToolDescriptor};

use crate::protocol::{
    initialize_params, parse_tool_outcome, parse_tools_list, tool_call_params, InboundMessage,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, TOOLS_CHANGED_METHOD,
};
use crate::sse::build_http_client;
use crate::sse_stream::parse_sse_events;
use crate::{Callbacks, ClientError, ClosedHandler, ToolsChangedHandler, WorkerClient,
    CLOSE_TIMEOUT, CONNECT_TIMEOUT};

/// Session header defined by the streamable-HTTP protocol.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

struct Shared {
    name: String,
    http: reqwest::Client,
    url: reqwest::Url,
    next_id: AtomicU64,
    session_id: parking_lot::Mutex<Option<String>>,
    callbacks: Callbacks,
    cancel: CancellationToken,
    weak_self: std::sync::Weak<Self>,
}

impl Shared {
    fn apply_session(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.session_id.lock().as_deref() {
            Some(sid) => req.header(SESSION_HEADER, sid),
            None => req,
        }
    }

    fn remember_session(&self, resp: &reqwest::Response) {
        if let Some(sid) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut guard = self.session_id.lock();
            if guard.as_deref() != Some(sid) {
                debug!(worker = %self.name, session = sid, "peer assigned session");
                *guard = Some(sid.to_owned());
            }
        }
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_value(JsonRpcRequest::new(id, method, params))
            .map_err(|e| ClientError::Protocol(e.to_string()))?;

        let fut = self.round_trip(id, &body);
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(format!("{method} on '{}'", self.name))),
        }
    }

    async fn round_trip(&self, id: u64, body: &Value) -> Result<Value, ClientError> {
        let resp = self
            .apply_session(self.http.post(self.url.clone()))
            .header("Accept", "application/json, text/event-stream")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                self.callbacks.fire_closed();
                ClientError::Unreachable(format!("post failed: {e}"))
            })?;
        self.remember_session(&resp);

        if !resp.status().is_success() {
            return Err(ClientError::Protocol(format!(
                "post rejected with {}",
                resp.status()
            )));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();

        if content_type.starts_with("text/event-stream") {
            // The response rides a one-shot SSE body.
            let mut events = Box::pin(parse_sse_events(Box::pin(resp.bytes_stream())));
            while let Some(ev) = events.next().await {
                if ev.event != "message" {
                    continue;
                }
                match serde_json::from_str::<InboundMessage>(&ev.data) {
                    Ok(InboundMessage::Response(r)) if r.id == Some(id) => {
                        return r.into_result();
                    }
                    Ok(InboundMessage::Notification(n)) => self.dispatch_notification(&n.method),
                    Ok(InboundMessage::Response(_)) | Err(_) => {}
                }
            }
            Err(ClientError::Protocol(
                "response stream ended without an answer".into(),
            ))
        } else {
            let response: JsonRpcResponse = resp
                .json()
                .await
                .map_err(|e| ClientError::Protocol(format!("malformed response: {e}")))?;
            response.into_result()
        }
    }

    async fn notify(&self, method: &str) -> Result<(), ClientError> {
        let body = serde_json::to_value(JsonRpcNotification::new(method, None))
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        let resp = self
            .apply_session(self.http.post(self.url.clone()))
            .header("Accept", "application/json, text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Unreachable(format!("post failed: {e}")))?;
        self.remember_session(&resp);
        Ok(())
    }

    fn dispatch_notification(&self, method: &str) {
        if method != TOOLS_CHANGED_METHOD {
            return;
        }
        let Some(shared) = self.weak_self.upgrade() else {
            return;
        };
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
    }
}

/// Worker client for the streamable HTTP transport.
pub struct StreamableHttpWorkerClient {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for StreamableHttpWorkerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpWorkerClient")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

impl StreamableHttpWorkerClient {
    /// Perform the initialize handshake. Bounded by [`CONNECT_TIMEOUT`].
    pub async fn connect(
        name: &str,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Self, ClientError> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| ClientError::Unreachable(format!("bad url '{url}': {e}")))?;
        let http = build_http_client(headers)?;

        let shared = Arc::new_cyclic(|weak| Shared {
            name: name.to_owned(),
            http,
            url: parsed,
            next_id: AtomicU64::new(1),
            session_id: parking_lot::Mutex::new(None),
            callbacks: Callbacks::default(),
            cancel: CancellationToken::new(),
            weak_self: weak.clone(),
        });

        let _ = shared
            .request("initialize", Some(initialize_params()), CONNECT_TIMEOUT)
            .await?;
        shared.notify("notifications/initialized").await?;

        spawn_notification_listener(shared.clone());
        Ok(Self { shared })
    }
}

/// Open a best-effort GET stream for server-initiated notifications.
/// Peers without one answer 4xx/405 and the listener quietly stops.
fn spawn_notification_listener(shared: Arc<Shared>) {
    let _ = tokio::spawn(async move {
        let resp = shared
            .apply_session(shared.http.get(shared.url.clone()))
            .header("Accept", "text/event-stream")
            .send()
            .await;
        let resp = match resp {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(worker = %shared.name, status = %r.status(), "no notification stream");
                return;
            }
            Err(e) => {
                debug!(worker = %shared.name, error = %e, "no notification stream");
                return;
            }
        };

        let mut events = Box::pin(parse_sse_events(Box::pin(resp.bytes_stream())));
        loop {
            let event = tokio::select! {
                () = shared.cancel.cancelled() => break,
                ev = events.next() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            if event.event != "message" {
                continue;
            }
            if let Ok(InboundMessage::Notification(n)) =
                serde_json::from_str::<InboundMessage>(&event.data)
            {
                shared.dispatch_notification(&n.method);
            }
        }
    });
}

#[async_trait]
impl WorkerClient for StreamableHttpWorkerClient {
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

        // Tell the peer the session is over; best effort.
        let delete = self
            .shared
            .apply_session(self.shared.http.delete(self.shared.url.clone()))
            .send();
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, delete).await;

        self.shared.callbacks.fire_closed();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
