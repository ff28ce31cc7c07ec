//! Server-sent-event parser for worker transports.
//!
//! Handles line buffering from chunked responses, `event:`/`data:`
//! field accumulation, multi-line data, and comment filtering. Unlike
//! an LLM-style stream there is no `[DONE]` marker; the stream ends
//! when the transport closes.

use bytes::BytesMut;
use futures::Stream;
use tokio_stream::StreamExt;
use tracing::warn;

/// One parsed SSE event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name; `"message"` when the peer sent none.
    pub event: String,
    /// Concatenated data lines.
    pub data: String,
}

#[derive(Default)]
struct EventAccumulator {
    event: Option<String>,
    data: Vec<String>,
}

impl EventAccumulator {
    /// Feed one line. Returns a completed event on a blank line.
    fn feed(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            if self.data.is_empty() {
                self.event = None;
                return None;
            }
            let event = SseEvent {
                event: self.event.take().unwrap_or_else(|| "message".to_owned()),
                data: std::mem::take(&mut self.data).join("\n"),
            };
            return Some(event);
        }
        if line.starts_with(':') {
            return None; // comment / keep-alive
        }
        if let Some(value) = field_value(line, "event") {
            self.event = Some(value.to_owned());
        } else if let Some(value) = field_value(line, "data") {
            self.data.push(value.to_owned());
        }
        None
    }
}

fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?;
    let rest = rest.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Parse SSE events from a byte stream.
///
/// Invalid UTF-8 lines are skipped; a transport read error ends the
/// stream with a warning.
pub fn parse_sse_events<S>(byte_stream: S) -> impl Stream<Item = SseEvent> + Send
where
    S: Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    futures::stream::unfold(
        (
            byte_stream,
            BytesMut::with_capacity(8192),
            EventAccumulator::default(),
            false,
        ),
        |(mut stream, mut buffer, mut acc, done)| async move {
            if done {
                return None;
            }
            loop {
                if let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                    let mut line_bytes = buffer.split_to(newline_pos + 1);
                    line_bytes.truncate(line_bytes.len() - 1);
                    if line_bytes.last() == Some(&b'\r') {
                        line_bytes.truncate(line_bytes.len() - 1);
                    }
                    let Ok(line) = std::str::from_utf8(&line_bytes) else {
                        continue;
                    };
                    if let Some(event) = acc.feed(line) {
                        return Some((event, (stream, buffer, acc, false)));
                    }
                    continue;
                }

                match stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        warn!(error = %e, "sse stream read error");
                        return None;
                    }
                    None => {
                        // Flush a final unterminated event if any.
                        if let Some(event) = acc.feed("") {
                            return Some((event, (stream, buffer, acc, true)));
                        }
                        return None;
                    }
                }
            }
        },
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_stream(
        chunks: Vec<&'static str>,
    ) -> impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + Unpin {
        Box::pin(futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok(bytes::Bytes::from_static(c.as_bytes()))),
        ))
    }

    async fn collect(chunks: Vec<&'static str>) -> Vec<SseEvent> {
        parse_sse_events(byte_stream(chunks)).collect().await
    }

    #[tokio::test]
    async fn single_event_with_name() {
        let events = collect(vec!["event: endpoint\ndata: /messages?id=1\n\n"]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "endpoint");
        assert_eq!(events[0].data, "/messages?id=1");
    }

    #[tokio::test]
    async fn default_event_name_is_message() {
        let events = collect(vec!["data: {\"x\":1}\n\n"]).await;
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "{\"x\":1}");
    }

    #[tokio::test]
    async fn event_split_across_chunks() {
        let events = collect(vec!["data: hel", "lo\n", "\n", "data: world\n\n"]).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "hello");
        assert_eq!(events[1].data, "world");
    }

    #[tokio::test]
    async fn multi_line_data_joined_with_newline() {
        let events = collect(vec!["data: a\ndata: b\n\n"]).await;
        assert_eq!(events[0].data, "a\nb");
    }

    #[tokio::test]
    async fn comments_and_blank_lines_skipped() {
        let events = collect(vec![": keep-alive\n\n: ping\ndata: x\n\n"]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[tokio::test]
    async fn crlf_lines_accepted() {
        let events = collect(vec!["event: message\r\ndata: y\r\n\r\n"]).await;
        assert_eq!(events[0].data, "y");
    }

    #[tokio::test]
    async fn unterminated_final_event_flushed() {
        let events = collect(vec!["data: tail\n"]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[tokio::test]
    async fn data_without_space_after_colon() {
        let events = collect(vec!["data:compact\n\n"]).await;
        assert_eq!(events[0].data, "compact");
    }
}
