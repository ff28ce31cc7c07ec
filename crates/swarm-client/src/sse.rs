//! Server-sent-event HTTP transport.
//!
//! The adapter opens a long-lived GET stream; the peer's first
//! `endpoint` event names the POST URL for requests, and every
//! response (plus server-initiated notifications) arrives back over
//! the stream.

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

use crate::pending::PendingMap;
use crate::protocol::{
    initialize_params, parse_tool_outcome, parse_tools_list, tool_call_params, InboundMessage,
    JsonRpcNotification, JsonRpcRequest, TOOLS_CHANGED_METHOD,
};
use crate::sse_stream::{parse_sse_events, SseEvent};
use crate::{Callbacks, ClientError, ClosedHandler, ToolsChangedHandler, WorkerClient,
    CONNECT_TIMEOUT};

type EventStream = futures::stream::BoxStream<'static, SseEvent>;

struct Shared {
    name: String,
    http: reqwest::Client,
    post_url: reqwest::Url,
    pending: PendingMap,
    next_id: AtomicU64,
    callbacks: Callbacks,
    cancel: CancellationToken,
}

impl Shared {
    async fn post(&self, body: &Value) -> Result<(), ClientError> {
        let resp = self
            .http
            .post(self.post_url.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::Unreachable(format!("post failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(ClientError::Protocol(format!(
                "post rejected with {}",
                resp.status()
            )));
        }
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

        let body = serde_json::to_value(JsonRpcRequest::new(id, method, params))
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        if let Err(e) = self.post(&body).await {
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

    async fn notify(&self, method: &str) -> Result<(), ClientError> {
        let body = serde_json::to_value(JsonRpcNotification::new(method, None))
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.post(&body).await
    }
}

/// Worker client for the SSE transport.
pub struct SseWorkerClient {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SseWorkerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseWorkerClient")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

impl SseWorkerClient {
    /// Open the stream, resolve the endpoint, and perform the
    /// initialize handshake. Bounded by [`CONNECT_TIMEOUT`].
    pub async fn connect(
        name: &str,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Self, ClientError> {
        tokio::time::timeout(CONNECT_TIMEOUT, Self::connect_inner(name, url, headers))
            .await
            .map_err(|_| ClientError::Timeout(format!("connect to '{name}'")))?
    }

    async fn connect_inner(
        name: &str,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Self, ClientError> {
        let base = reqwest::Url::parse(url)
            .map_err(|e| ClientError::Unreachable(format!("bad url '{url}': {e}")))?;
        let http = build_http_client(headers)?;

        let resp = http
            .get(base.clone())
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| ClientError::Unreachable(format!("stream open failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(ClientError::Unreachable(format!(
                "stream open rejected with {}",
                resp.status()
            )));
        }

        let mut events: EventStream = parse_sse_events(Box::pin(resp.bytes_stream())).boxed();

        // The first protocol event names the POST endpoint.
        let post_url = loop {
            match events.next().await {
                Some(ev) if ev.event == "endpoint" => {
                    break base.join(ev.data.trim()).map_err(|e| {
                        ClientError::Protocol(format!("bad endpoint '{}': {e}", ev.data))
                    })?;
                }
                Some(other) => {
                    debug!(worker = name, event = %other.event, "skipping pre-endpoint event");
                }
                None => {
                    return Err(ClientError::Protocol(
                        "stream ended before endpoint event".into(),
                    ))
                }
            }
        };

        let shared = Arc::new(Shared {
            name: name.to_owned(),
            http,
            post_url,
            pending: PendingMap::default(),
            next_id: AtomicU64::new(1),
            callbacks: Callbacks::default(),
            cancel: CancellationToken::new(),
        });

        spawn_stream_reader(shared.clone(), events);

        let client = Self { shared };
        client.handshake().await?;
        Ok(client)
    }

    async fn handshake(&self) -> Result<(), ClientError> {
        let _ = self
            .shared
            .request("initialize", Some(initialize_params()), CONNECT_TIMEOUT)
            .await?;
        self.shared.notify("notifications/initialized").await
    }
}

pub(crate) fn build_http_client(
    headers: &HashMap<String, String>,
) -> Result<reqwest::Client, ClientError> {
    use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

    let mut map = HeaderMap::new();
    for (k, v) in headers {
        let Ok(key) = HeaderName::try_from(k.as_str()) else {
            warn!(header = %k, "skipping invalid header name");
            continue;
        };
        let Ok(value) = HeaderValue::try_from(v.as_str()) else {
            warn!(header = %k, "skipping invalid header value");
            continue;
        };
        let _ = map.insert(key, value);
    }
    reqwest::Client::builder()
        .default_headers(map)
        .build()
        .map_err(|e| ClientError::Unreachable(format!("http client: {e}")))
}

fn spawn_stream_reader(shared: Arc<Shared>, mut events: EventStream) {
    let _ = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = shared.cancel.cancelled() => break,
                ev = events.next() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            if event.event != "message" {
                debug!(worker = %shared.name, event = %event.event, "ignoring event");
                continue;
            }
            handle_inbound(&shared, &event.data);
        }
        shared.pending.fail_all();
        shared.callbacks.fire_closed();
        debug!(worker = %shared.name, "sse stream finished");
    });
}

fn handle_inbound(shared: &Arc<Shared>, data: &str) {
    match serde_json::from_str::<InboundMessage>(data) {
        Ok(InboundMessage::Response(resp)) => {
            let id = resp.id;
            if id.is_none_or(|id| !shared.pending.resolve(id, resp)) {
                debug!(worker = %shared.name, ?id, "unmatched response, dropping");
            }
        }
        Ok(InboundMessage::Notification(notif)) => {
            if notif.method == TOOLS_CHANGED_METHOD {
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
            }
        }
        Err(e) => {
            debug!(worker = %shared.name, error = %e, "ignoring unparsable stream frame");
        }
    }
}

#[async_trait]
impl WorkerClient for SseWorkerClient {
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
        self.shared.pending.fail_all();
        self.shared.callbacks.fire_closed();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
