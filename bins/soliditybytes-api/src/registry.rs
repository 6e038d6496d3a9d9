/// Submission Registry
///
/// **Responsibility:**
/// Map submission ids to their live state: the output log, the cancellation
/// token and exit bookkeeping. Entries outlive their run by a grace period
/// so late listeners can still replay the result, then disappear.
///
/// Time comes from an injected [`Clock`] so expiry is testable without
/// sleeping.
use crate::output::OutputLog;
use chrono::{DateTime, Utc};
use serde::Serialize;
use soliditybytes_common::types::{DoneReason, Mode, Requester};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[cfg(test)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut offset) = self.offset.lock() {
            *offset += by;
        }
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = self.offset.lock().map(|o| *o).unwrap_or_default();
        self.base + offset
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ExitState {
    exited_at: Option<Instant>,
    code: Option<i32>,
}

pub struct SubmissionEntry {
    pub id: String,
    pub exercise_id: String,
    pub mode: Mode,
    pub requester: Option<Requester>,
    pub started_at: DateTime<Utc>,
    pub log: Arc<OutputLog>,
    pub cancel: CancellationToken,
    exit: Mutex<ExitState>,
}

impl SubmissionEntry {
    pub fn new(
        id: String,
        exercise_id: String,
        mode: Mode,
        requester: Option<Requester>,
        log: Arc<OutputLog>,
    ) -> Self {
        Self {
            id,
            exercise_id,
            mode,
            requester,
            started_at: Utc::now(),
            log,
            cancel: CancellationToken::new(),
            exit: Mutex::new(ExitState::default()),
        }
    }

    fn exit_state(&self) -> ExitState {
        self.exit.lock().map(|s| *s).unwrap_or_default()
    }

    pub fn snapshot(&self) -> SubmissionSnapshot {
        let exit = self.exit_state();
        let done = self.log.done();
        SubmissionSnapshot {
            submission_id: self.id.clone(),
            exercise_id: self.exercise_id.clone(),
            mode: self.mode,
            status: if exit.exited_at.is_some() {
                SubmissionStatus::Exited
            } else {
                SubmissionStatus::Running
            },
            started_at: self.started_at,
            code: exit.code,
            reason: done.and_then(|d| d.reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Running,
    Exited,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionSnapshot {
    pub submission_id: String,
    pub exercise_id: String,
    pub mode: Mode,
    pub status: SubmissionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DoneReason>,
}

pub struct SubmissionRegistry {
    entries: RwLock<HashMap<String, Arc<SubmissionEntry>>>,
    clock: Arc<dyn Clock>,
    grace: Duration,
}

impl SubmissionRegistry {
    pub fn new(clock: Arc<dyn Clock>, grace: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            grace,
        }
    }

    fn is_expired(&self, entry: &SubmissionEntry, now: Instant) -> bool {
        match entry.exit_state().exited_at {
            Some(exited_at) => now.duration_since(exited_at) >= self.grace,
            None => false,
        }
    }

    pub fn insert(&self, entry: Arc<SubmissionEntry>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(entry.id.clone(), entry);
    }

    /// Live or recently exited entry; expired entries read as absent even
    /// before the sweeper removes them.
    pub fn get(&self, id: &str) -> Option<Arc<SubmissionEntry>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(id)?;
        if self.is_expired(entry, self.clock.now()) {
            return None;
        }
        Some(entry.clone())
    }

    /// Record the run's exit; starts the grace period
    pub fn mark_exited(&self, id: &str, code: i32) {
        let Some(entry) = self.get(id) else {
            return;
        };
        let now = self.clock.now();
        if let Ok(mut exit) = entry.exit.lock() {
            if exit.exited_at.is_none() {
                exit.exited_at = Some(now);
                exit.code = Some(code);
            }
        };
    }

    /// Drop expired entries, returning how many went
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry, now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "Swept expired submissions");
        }
        removed
    }

    /// Cancel every run that has not exited yet
    pub fn cancel_all(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut cancelled = 0;
        for entry in entries.values() {
            if entry.exit_state().exited_at.is_none() {
                entry.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> Arc<SubmissionEntry> {
        Arc::new(SubmissionEntry::new(
            id.to_string(),
            "basic-variables".to_string(),
            Mode::Starter,
            Some(Requester::Device("d1".into())),
            Arc::new(OutputLog::new(1024)),
        ))
    }

    fn registry(clock: Arc<ManualClock>) -> SubmissionRegistry {
        SubmissionRegistry::new(clock, Duration::from_secs(300))
    }

    #[test]
    fn test_unknown_id_is_absent() {
        let registry = registry(Arc::new(ManualClock::new()));
        assert!(registry.get("sub_missing").is_none());
    }

    #[test]
    fn test_running_entry_never_expires() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(clock.clone());
        registry.insert(entry("sub_a"));

        clock.advance(Duration::from_secs(3600));
        assert!(registry.get("sub_a").is_some());
        assert_eq!(registry.sweep(), 0);
    }

    #[test]
    fn test_exited_entry_expires_after_grace() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(clock.clone());
        registry.insert(entry("sub_a"));
        registry.mark_exited("sub_a", 0);

        clock.advance(Duration::from_secs(299));
        let snapshot = registry.get("sub_a").unwrap().snapshot();
        assert_eq!(snapshot.status, SubmissionStatus::Exited);
        assert_eq!(snapshot.code, Some(0));

        clock.advance(Duration::from_secs(1));
        assert!(registry.get("sub_a").is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.sweep(), 1);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_first_exit_wins() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(clock);
        registry.insert(entry("sub_a"));
        registry.mark_exited("sub_a", 3);
        registry.mark_exited("sub_a", 0);
        assert_eq!(registry.get("sub_a").unwrap().snapshot().code, Some(3));
    }

    #[test]
    fn test_cancel_all_skips_exited_runs() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(clock);
        let running = entry("sub_run");
        let finished = entry("sub_done");
        registry.insert(running.clone());
        registry.insert(finished.clone());
        registry.mark_exited("sub_done", 1);

        assert_eq!(registry.cancel_all(), 1);
        assert!(running.cancel.is_cancelled());
        assert!(!finished.cancel.is_cancelled());
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let entry = entry("sub_a");
        let json = serde_json::to_value(entry.snapshot()).unwrap();
        assert_eq!(json["submissionId"], "sub_a");
        assert_eq!(json["status"], "running");
        assert!(json.get("code").is_none());
    }
}
