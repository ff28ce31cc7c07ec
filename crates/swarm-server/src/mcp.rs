//! The `/mcp` session endpoint.
//!
//! POST carries tool-call protocol messages. A POST `initialize`
//! without a valid session header mints a fresh session (503 at the
//! cap) and returns its id in the response header; subsequent messages
//! carry the id. GET opens the per-session server-push stream; DELETE
//! ends the session.

use std::convert::Infallible;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::rpc::{handle_rpc, RpcIn};
use crate::server::AppState;

/// Session header carried on every `/mcp` request and response.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok())
}

fn with_session_header(session_id: &str, body: Value) -> Response {
    ([(SESSION_HEADER, session_id.to_owned())], Json(body)).into_response()
}

/// POST /mcp
pub async fn post_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let Ok(req) = serde_json::from_value::<RpcIn>(body) else {
        return (StatusCode::BAD_REQUEST, "malformed JSON-RPC message").into_response();
    };

    let presented = session_header(&headers);
    let session_id = match presented {
        Some(id) if state.sessions.touch(id) => id.to_owned(),
        // Unknown or missing header: only an initialize may mint.
        _ if req.method == "initialize" => match state.sessions.open() {
            Some(id) => id,
            None => {
                return (StatusCode::SERVICE_UNAVAILABLE, "session capacity reached")
                    .into_response()
            }
        },
        Some(_) => return (StatusCode::NOT_FOUND, "unknown session").into_response(),
        None => return (StatusCode::BAD_REQUEST, "missing session header").into_response(),
    };

    match handle_rpc(&state.tools, Some(&session_id), &req).await {
        Some(response) => with_session_header(&session_id, response),
        // Notifications get an empty acknowledgement.
        None => (
            StatusCode::ACCEPTED,
            [(SESSION_HEADER, session_id)],
        )
            .into_response(),
    }
}

/// GET /mcp — the server-push stream for one session.
pub async fn get_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Response> {
    let Some(session_id) = session_header(&headers) else {
        return Err((StatusCode::BAD_REQUEST, "missing session header").into_response());
    };
    if !state.sessions.touch(session_id) {
        return Err((StatusCode::NOT_FOUND, "unknown session").into_response());
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<String>(64);
    let _ = state.session_channels.insert(session_id.to_owned(), tx);
    debug!(session_id, "session stream opened");

    let stream = ReceiverStream::new(rx).map(|frame| Ok(Event::default().data(frame)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// DELETE /mcp — end a session by id.
pub async fn delete_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(session_id) = session_header(&headers) else {
        return (StatusCode::BAD_REQUEST, "missing session header").into_response();
    };
    if !state.sessions.contains(session_id) {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    }
    teardown_session(&state, session_id).await;
    StatusCode::NO_CONTENT.into_response()
}

/// Shared teardown path: close the push channel, drop the session,
/// release its stateful instances.
pub async fn teardown_session(state: &AppState, session_id: &str) {
    let _ = state.session_channels.remove(session_id);
    let _ = state.sessions.remove(session_id);
    state.supervisor.release_session(session_id).await;
}
