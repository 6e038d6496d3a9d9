/// Submission Service - Accept and Supervise Runs
///
/// **Responsibility:**
/// Turn a validated request into a registered submission and a background
/// run. The supervisor task owns the run from start to `done`:
/// 1. Executes the exercise under the wall-clock deadline
/// 2. Maps the outcome (or failure) to a terminal [`DoneEvent`]
/// 3. Records progress on success, before `done` becomes observable
/// 4. Starts the registry grace period
///
/// Nothing here depends on a listener being attached.
use soliditybytes_common::progress::ProgressStore;
use soliditybytes_common::types::{
    DoneEvent, DoneReason, Exercise, ExerciseFile, Mode, OutputChunk, Requester,
};
use soliditybytes_runner::{Executor, RunReport, RunRequest, RunStatus, RunnerError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::metrics::{DEPENDENCY_INSTALLS, RUNS_FINISHED, SUBMISSIONS_CREATED};
use crate::output::OutputLog;
use crate::registry::{SubmissionEntry, SubmissionRegistry};

pub struct NewSubmission {
    pub exercise: Arc<Exercise>,
    pub mode: Mode,
    pub overrides: Vec<ExerciseFile>,
    pub requester: Option<Requester>,
}

#[derive(Clone)]
pub struct SubmissionService {
    executor: Arc<Executor>,
    registry: Arc<SubmissionRegistry>,
    progress: Arc<dyn ProgressStore>,
    run_timeout: Duration,
    max_output_bytes: usize,
}

pub fn new_submission_id() -> String {
    format!("sub_{}", Uuid::new_v4().simple())
}

impl SubmissionService {
    pub fn new(
        executor: Arc<Executor>,
        registry: Arc<SubmissionRegistry>,
        progress: Arc<dyn ProgressStore>,
        run_timeout: Duration,
        max_output_bytes: usize,
    ) -> Self {
        Self {
            executor,
            registry,
            progress,
            run_timeout,
            max_output_bytes,
        }
    }

    /// Register a submission and start its run. The returned id is already
    /// resolvable through the registry.
    pub fn create(&self, request: NewSubmission) -> Result<String, ApiError> {
        let workspaces = self.executor.workspaces();
        for file in &request.overrides {
            workspaces
                .validate_path(&file.path)
                .map_err(|_| ApiError::InvalidPath(file.path.clone()))?;
        }
        self.executor.preflight().map_err(|e| {
            error!(error = %e, "Toolchain preflight failed");
            ApiError::Spawn(e.to_string())
        })?;

        let id = new_submission_id();
        let log = Arc::new(OutputLog::new(self.max_output_bytes));
        let entry = Arc::new(SubmissionEntry::new(
            id.clone(),
            request.exercise.id.clone(),
            request.mode,
            request.requester,
            log,
        ));
        self.registry.insert(entry.clone());

        SUBMISSIONS_CREATED
            .with_label_values(&[&request.mode.to_string()])
            .inc();
        info!(
            submission_id = %id,
            exercise_id = %request.exercise.id,
            mode = %request.mode,
            requester = ?entry.requester.as_ref().map(|r| r.key()),
            "Submission accepted"
        );

        let service = self.clone();
        let deadline = Instant::now() + self.run_timeout;
        tokio::spawn(async move {
            service
                .supervise(entry, request.exercise, request.overrides, deadline)
                .await;
        });

        Ok(id)
    }

    async fn supervise(
        &self,
        entry: Arc<SubmissionEntry>,
        exercise: Arc<Exercise>,
        overrides: Vec<ExerciseFile>,
        deadline: Instant,
    ) {
        let request = RunRequest {
            exercise: &exercise,
            mode: entry.mode,
            overrides: &overrides,
        };

        let outcome = self
            .executor
            .execute(request, &*entry.log, Some(deadline), &entry.cancel)
            .await;

        let done = match outcome {
            Ok(report) => {
                if let Some(label) = install_label(&report) {
                    DEPENDENCY_INSTALLS.with_label_values(&[label]).inc();
                }
                match report.status {
                    RunStatus::Exited(code) => DoneEvent::exited(code),
                    RunStatus::TimedOut => {
                        warn!(submission_id = %entry.id, "Run timed out");
                        DoneEvent::with_reason(report.code(), DoneReason::Timeout)
                    }
                    RunStatus::Cancelled => {
                        DoneEvent::with_reason(report.code(), DoneReason::Cancelled)
                    }
                }
            }
            Err(e) => {
                warn!(submission_id = %entry.id, error = %e, "Run failed");
                entry.log.push(OutputChunk::stderr(format!("{}\n", failure_message(&e))));
                let reason = match &e {
                    RunnerError::Install { .. } => DoneReason::InstallFailed,
                    RunnerError::Spawn { .. } | RunnerError::ToolchainMissing(_) => {
                        DoneReason::SpawnFailed
                    }
                    _ => DoneReason::Error,
                };
                DoneEvent::with_reason(e.exit_code(), reason)
            }
        };

        if done.is_success() {
            if let Some(requester) = &entry.requester {
                match self.progress.mark_solved(requester, &entry.exercise_id).await {
                    Ok(()) => info!(
                        submission_id = %entry.id,
                        requester = %requester,
                        exercise_id = %entry.exercise_id,
                        "Exercise marked solved"
                    ),
                    Err(e) => error!(submission_id = %entry.id, error = %e, "Failed to record progress"),
                }
            }
        }

        RUNS_FINISHED.with_label_values(&[outcome_label(&done)]).inc();
        info!(
            submission_id = %entry.id,
            code = done.code,
            reason = ?done.reason,
            dropped_chunks = entry.log.dropped_chunks(),
            "Submission finished"
        );

        self.registry.mark_exited(&entry.id, done.code);
        entry.log.close(done);
    }
}

fn failure_message(error: &RunnerError) -> String {
    match error {
        RunnerError::Install { code } => {
            format!("Dependency install failed (exit code {})", code)
        }
        RunnerError::Spawn { program, .. } => format!("Failed to start '{}'", program),
        other => other.to_string(),
    }
}

/// Label for the install counter; `None` when the run was cut short and
/// may never have reached the install check.
fn install_label(report: &RunReport) -> Option<&'static str> {
    match report.status {
        RunStatus::Exited(_) if report.installed => Some("installed"),
        RunStatus::Exited(_) => Some("cached"),
        RunStatus::TimedOut | RunStatus::Cancelled => None,
    }
}

fn outcome_label(done: &DoneEvent) -> &'static str {
    match done.reason {
        Some(DoneReason::Timeout) => "timeout",
        Some(DoneReason::Cancelled) => "cancelled",
        Some(DoneReason::InstallFailed) => "install_failed",
        Some(DoneReason::SpawnFailed) => "spawn_failed",
        Some(DoneReason::Error) => "error",
        None if done.code == 0 => "passed",
        None => "failed",
    }
}
