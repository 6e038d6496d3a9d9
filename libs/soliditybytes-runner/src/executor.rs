/// Exercise Executor - High-Level Orchestration
///
/// **Responsibility:**
/// Run one exercise end to end: take the workspace lock, prepare the
/// workspace, then run the toolchain's test command in it.
///
/// This module is the glue layer - it knows nothing about:
/// - How files are laid out or dependencies cached (workspace's job)
/// - How processes are spawned and streamed (process runner's job)
/// - Who is listening to the output (the sink's job)
use crate::error::{Result, RunnerError};
use crate::process::{CommandSpec, OutputSink, ProcessRunner, RunStatus};
use crate::toolchain::ToolchainConfig;
use crate::workspace::WorkspaceManager;
use soliditybytes_common::types::{Exercise, ExerciseFile, Mode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'a> {
    pub exercise: &'a Exercise,
    pub mode: Mode,
    pub overrides: &'a [ExerciseFile],
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub status: RunStatus,
    /// Dependencies were installed as part of this run
    pub installed: bool,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn code(&self) -> i32 {
        self.status.code()
    }
}

pub struct Executor {
    workspaces: WorkspaceManager,
    processes: ProcessRunner,
    toolchain: Arc<ToolchainConfig>,
}

impl Executor {
    pub fn new(toolchain: ToolchainConfig, workspace_root: impl Into<PathBuf>) -> Self {
        let toolchain = Arc::new(toolchain);
        Self {
            workspaces: WorkspaceManager::new(workspace_root, toolchain.clone()),
            processes: ProcessRunner::new(),
            toolchain,
        }
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Check the toolchain is runnable before accepting work
    pub fn preflight(&self) -> Result<()> {
        self.toolchain.preflight()
    }

    /// Prepare and test one exercise.
    ///
    /// A deadline or cancellation that lands during install or test is not
    /// an error: the report carries `TimedOut` / `Cancelled`. Install
    /// failures, spawn failures and bad content are errors.
    pub async fn execute(
        &self,
        request: RunRequest<'_>,
        sink: &dyn OutputSink,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let exercise_id = request.exercise.id.as_str();
        let _guard = self.workspaces.lock(exercise_id).await;

        let prepared = match self
            .workspaces
            .prepare(
                request.exercise,
                request.mode,
                request.overrides,
                sink,
                deadline,
                cancel,
            )
            .await
        {
            Ok(prepared) => prepared,
            Err(RunnerError::Interrupted(status)) => {
                warn!(exercise_id = %exercise_id, status = ?status, "Interrupted during install");
                return Ok(RunReport {
                    status,
                    installed: false,
                    elapsed: started.elapsed(),
                });
            }
            Err(e) => return Err(e),
        };

        info!(
            exercise_id = %exercise_id,
            mode = %request.mode,
            installed = prepared.installed,
            "Workspace ready; running tests"
        );

        let spec = CommandSpec::from_toolchain(&self.toolchain.test, &prepared.path);
        let status = self.processes.run(&spec, sink, deadline, cancel).await?;

        let report = RunReport {
            status,
            installed: prepared.installed,
            elapsed: started.elapsed(),
        };
        info!(
            exercise_id = %exercise_id,
            code = report.code(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Run finished"
        );
        Ok(report)
    }
}
