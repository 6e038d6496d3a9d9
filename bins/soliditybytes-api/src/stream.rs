/// Event Stream Endpoint
///
/// **Wire format:** Server-Sent Events on `GET /submissions/:id/stream`
/// - `event: log`  `data: {"stream":"stdout"|"stderr","chunk":"..."}`
/// - `event: done` `data: {"code":N[,"reason":"..."]}`, always last
///
/// Each connection replays the submission's output log from the start with
/// its own byte budget. Dropping the connection never touches the run.
use axum::{
    extract::{Path, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures_util::Stream;
use soliditybytes_common::types::{DoneEvent, OutputChunk};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::debug;

use crate::error::ApiError;
use crate::metrics::StreamGuard;
use crate::output::{LogEntry, OutputLog};
use crate::AppState;

pub const TRUNCATION_MARKER: &str = "\n[truncated]\n";
const KEEPALIVE_TEXT: &str = "keepalive";

/// Result of offering one chunk to a [`ByteBudget`]
#[derive(Debug, PartialEq)]
pub struct Admitted {
    pub chunk: Option<OutputChunk>,
    /// Emit the truncation marker after `chunk`
    pub truncated: bool,
}

/// Cumulative cap on `log` payload bytes for one connection.
///
/// Chunks pass whole while they fit. The chunk that crosses the cap is cut
/// at the last char boundary that fits and followed by the marker; every
/// later chunk is dropped.
#[derive(Debug)]
pub struct ByteBudget {
    cap: usize,
    sent: usize,
    exhausted: bool,
}

impl ByteBudget {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            sent: 0,
            exhausted: false,
        }
    }

    pub fn admit(&mut self, chunk: OutputChunk) -> Admitted {
        if self.exhausted {
            return Admitted {
                chunk: None,
                truncated: false,
            };
        }

        let len = chunk.chunk.len();
        if self.sent + len <= self.cap {
            self.sent += len;
            return Admitted {
                chunk: Some(chunk),
                truncated: false,
            };
        }

        let mut cut = self.cap - self.sent;
        while !chunk.chunk.is_char_boundary(cut) {
            cut -= 1;
        }
        self.sent += cut;
        self.exhausted = true;

        let head = (cut > 0).then(|| OutputChunk {
            stream: chunk.stream,
            chunk: chunk.chunk[..cut].to_string(),
        });
        Admitted {
            chunk: head,
            truncated: true,
        }
    }

    pub fn sent(&self) -> usize {
        self.sent
    }
}

fn log_event(chunk: &OutputChunk) -> Event {
    Event::default()
        .event("log")
        .data(serde_json::to_string(chunk).unwrap_or_default())
}

fn done_event(done: &DoneEvent) -> Event {
    Event::default()
        .event("done")
        .data(serde_json::to_string(done).unwrap_or_default())
}

/// SSE events for one listener of `log`, capped at `max_bytes`
pub fn event_stream(
    log: Arc<OutputLog>,
    max_bytes: usize,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    async_stream::stream! {
        let _guard = StreamGuard::open();
        let mut budget = ByteBudget::new(max_bytes);
        let mut cursor = log.cursor();

        while let Some(entry) = cursor.next().await {
            match entry {
                LogEntry::Output(chunk) => {
                    let admitted = budget.admit(chunk);
                    if let Some(chunk) = admitted.chunk {
                        yield Ok(log_event(&chunk));
                    }
                    if admitted.truncated {
                        yield Ok(log_event(&OutputChunk::stderr(TRUNCATION_MARKER)));
                    }
                }
                LogEntry::Done(done) => {
                    yield Ok(done_event(&done));
                    break;
                }
            }
        }
        debug!(bytes = budget.sent(), "Event stream finished");
    }
}

/// GET /submissions/:id/stream - Live output of a submission
pub async fn stream_submission(
    State(state): State<Arc<AppState>>,
    Path(submission_id): Path<String>,
) -> Result<Response, ApiError> {
    let entry = state
        .registry
        .get(&submission_id)
        .ok_or(ApiError::NotFound)?;
    debug!(submission_id = %submission_id, "Stream listener attached");

    let limits = &state.config.limits;
    let stream = event_stream(entry.log.clone(), limits.max_output_bytes);
    Ok(Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(limits.keepalive)
                .text(KEEPALIVE_TEXT),
        )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn test_budget_passes_until_cap() {
        let mut budget = ByteBudget::new(10);
        assert_eq!(
            budget.admit(OutputChunk::stdout("12345")),
            Admitted { chunk: Some(OutputChunk::stdout("12345")), truncated: false }
        );
        assert_eq!(
            budget.admit(OutputChunk::stdout("67890")),
            Admitted { chunk: Some(OutputChunk::stdout("67890")), truncated: false }
        );
        assert_eq!(
            budget.admit(OutputChunk::stdout("x")),
            Admitted { chunk: None, truncated: true }
        );
        assert_eq!(
            budget.admit(OutputChunk::stdout("y")),
            Admitted { chunk: None, truncated: false }
        );
    }

    #[test]
    fn test_budget_cuts_on_char_boundary() {
        let mut budget = ByteBudget::new(4);
        // "aé€" is 1 + 2 + 3 bytes; only "aé" fits in 4
        let admitted = budget.admit(OutputChunk::stderr("aé€"));
        assert_eq!(admitted.chunk, Some(OutputChunk::stderr("aé")));
        assert!(admitted.truncated);
        assert_eq!(budget.sent(), 3);
    }

    #[tokio::test]
    async fn test_stream_total_stays_within_cap_plus_marker() {
        let log = Arc::new(OutputLog::new(100));
        for _ in 0..50 {
            log.push(OutputChunk::stdout("0123456789"));
        }
        log.close(DoneEvent::exited(1));

        let events: Vec<_> = event_stream(log, 100).collect().await;
        // 10 full chunks, one marker, one done
        assert_eq!(events.len(), 12);
    }

    #[tokio::test]
    async fn test_exactly_one_done_after_close() {
        let log = Arc::new(OutputLog::new(1024));
        log.push(OutputChunk::stdout("ok"));
        log.close(DoneEvent::exited(0));

        let first: Vec<_> = event_stream(log.clone(), 1024).collect().await;
        let second: Vec<_> = event_stream(log, 1024).collect().await;
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
    }
}
