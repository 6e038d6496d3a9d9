/// Submission Output Log
///
/// **Responsibility:**
/// Hold everything a run produced so that any number of stream listeners,
/// connecting at any time, can replay it in order and then follow it live.
///
/// **Rules:**
/// - Append-only; entries are never rewritten
/// - Output chunks are retained until `retain_bytes` is passed, after which
///   further chunks are dropped (listeners truncate at the same cap)
/// - `close` appends the single terminal `Done` entry; nothing follows it
use soliditybytes_common::types::{DoneEvent, OutputChunk};
use soliditybytes_runner::OutputSink;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    Output(OutputChunk),
    Done(DoneEvent),
}

#[derive(Debug, Default)]
struct LogState {
    entries: Vec<LogEntry>,
    retained_bytes: usize,
    dropped_chunks: usize,
    done: Option<DoneEvent>,
}

pub struct OutputLog {
    state: Mutex<LogState>,
    version: watch::Sender<u64>,
    retain_bytes: usize,
}

impl OutputLog {
    pub fn new(retain_bytes: usize) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Mutex::new(LogState::default()),
            version,
            retain_bytes,
        }
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    pub fn push(&self, chunk: OutputChunk) {
        {
            let mut state = self.state();
            if state.done.is_some() {
                return;
            }
            // Keep one chunk past the cap so listeners see the crossing
            if state.retained_bytes > self.retain_bytes {
                state.dropped_chunks += 1;
                return;
            }
            state.retained_bytes += chunk.chunk.len();
            state.entries.push(LogEntry::Output(chunk));
        }
        self.notify();
    }

    /// Append the terminal event. Later calls are ignored.
    pub fn close(&self, done: DoneEvent) {
        {
            let mut state = self.state();
            if state.done.is_some() {
                return;
            }
            state.entries.push(LogEntry::Done(done.clone()));
            state.done = Some(done);
        }
        self.notify();
    }

    pub fn done(&self) -> Option<DoneEvent> {
        self.state().done.clone()
    }

    pub fn dropped_chunks(&self) -> usize {
        self.state().dropped_chunks
    }

    /// Entries from `offset` on, and whether the log is closed
    fn read_from(&self, offset: usize) -> (Vec<LogEntry>, bool) {
        let state = self.state();
        let batch = state.entries.get(offset..).map(|s| s.to_vec()).unwrap_or_default();
        (batch, state.done.is_some())
    }

    /// Independent reader starting at the first entry
    pub fn cursor(self: &Arc<Self>) -> LogCursor {
        LogCursor {
            log: self.clone(),
            changes: self.version.subscribe(),
            next: 0,
            pending: VecDeque::new(),
        }
    }
}

impl OutputSink for OutputLog {
    fn emit(&self, chunk: OutputChunk) {
        self.push(chunk);
    }
}

pub struct LogCursor {
    log: Arc<OutputLog>,
    changes: watch::Receiver<u64>,
    next: usize,
    pending: VecDeque<LogEntry>,
}

impl LogCursor {
    /// Next entry, waiting for one if necessary. `None` once the terminal
    /// entry has been returned.
    pub async fn next(&mut self) -> Option<LogEntry> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Some(entry);
            }

            self.changes.borrow_and_update();
            let (batch, closed) = self.log.read_from(self.next);
            if !batch.is_empty() {
                self.next += batch.len();
                self.pending.extend(batch);
                continue;
            }
            if closed {
                return None;
            }
            if self.changes.changed().await.is_err() {
                return None;
            }
        }
    }
}
