//! `/events` — the lifecycle event stream.
//!
//! Every bus event becomes one SSE data frame; a `{"type":"ping"}`
//! frame goes out every 15 seconds so intermediaries keep the
//! connection open.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures::Stream;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tokio_stream::StreamExt;

use crate::server::AppState;

/// Keep-alive cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);

/// GET /events
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = BroadcastStream::new(state.supervisor.bus().subscribe()).filter_map(|item| {
        // A lagged subscriber drops its own backlog and continues.
        let event = item.ok()?;
        let frame = serde_json::to_string(&event).ok()?;
        Some(Ok(Event::default().data(frame)))
    });

    let pings = IntervalStream::new(tokio::time::interval(PING_INTERVAL))
        .map(|_| Ok(Event::default().data(r#"{"type":"ping"}"#)));

    Sse::new(events.merge(pings))
}
