// CLI commands for running and checking exercises locally
use anyhow::{bail, Context, Result};
use soliditybytes_common::catalog::{ExerciseCatalog, EXAMPLES_TRACK};
use soliditybytes_common::types::{Exercise, ExerciseFile, Mode, OutputChunk, OutputStream};
use soliditybytes_runner::{Executor, MemorySink, OutputSink, RunRequest, ToolchainConfig};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Where the CLI finds content, workspaces and the toolchain description
#[derive(Debug, Clone)]
pub struct Paths {
    pub content_root: PathBuf,
    pub workspace_root: PathBuf,
    pub toolchain_config: PathBuf,
}

impl Paths {
    fn catalog(&self) -> Result<ExerciseCatalog> {
        ExerciseCatalog::load(&self.content_root).with_context(|| {
            format!(
                "Failed to load exercises from {}",
                self.content_root.display()
            )
        })
    }

    fn executor(&self) -> Result<Executor> {
        let toolchain = ToolchainConfig::load_or_default(&self.toolchain_config)
            .context("Failed to load toolchain config")?;
        let executor = Executor::new(toolchain, &self.workspace_root);
        executor
            .preflight()
            .context("Toolchain is not available; install Node.js and npm")?;
        Ok(executor)
    }
}

/// Writes chunks to the terminal as they arrive
struct ConsoleSink;

impl OutputSink for ConsoleSink {
    fn emit(&self, chunk: OutputChunk) {
        let result = match chunk.stream {
            OutputStream::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(chunk.chunk.as_bytes()).and_then(|_| out.flush())
            }
            OutputStream::Stderr => {
                let mut err = io::stderr().lock();
                err.write_all(chunk.chunk.as_bytes()).and_then(|_| err.flush())
            }
        };
        if let Err(e) = result {
            debug!(error = %e, "Console write failed");
        }
    }
}

/// Parse overrides given on the command line or in `RUN_OVERRIDES`.
/// Bad JSON is reported and ignored.
pub fn parse_overrides(raw: Option<&str>) -> Vec<ExerciseFile> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Vec::new();
    };
    match serde_json::from_str(raw) {
        Ok(files) => files,
        Err(e) => {
            warn!(error = %e, "Invalid overrides JSON; ignoring");
            eprintln!("⚠️  Invalid RUN_OVERRIDES JSON; ignoring");
            Vec::new()
        }
    }
}

/// Cancel the token on Ctrl+C so the child is killed rather than orphaned
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    cancel
}

/// Run one exercise; returns the exit code to report.
///
/// Verbose runs stream output live. Otherwise output is buffered and
/// printed once the run is over, or only on failure when `quiet_on_pass`.
async fn run_one(
    executor: &Executor,
    exercise: &Exercise,
    mode: Mode,
    overrides: &[ExerciseFile],
    verbose: bool,
    quiet_on_pass: bool,
    cancel: &CancellationToken,
) -> i32 {
    let request = RunRequest {
        exercise,
        mode,
        overrides,
    };

    let (result, buffered) = if verbose {
        (executor.execute(request, &ConsoleSink, None, cancel).await, None)
    } else {
        let sink = MemorySink::new();
        let result = executor.execute(request, &sink, None, cancel).await;
        (result, Some(sink))
    };

    let code = match &result {
        Ok(report) => {
            debug!(
                exercise_id = %exercise.id,
                code = report.code(),
                installed = report.installed,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Run finished"
            );
            report.code()
        }
        Err(e) => e.exit_code(),
    };

    if let Some(sink) = buffered {
        if code != 0 || !quiet_on_pass {
            for chunk in sink.chunks() {
                ConsoleSink.emit(chunk);
            }
        }
    }
    if let Err(e) = result {
        eprintln!("❌ {}", e);
    }
    code
}

/// `run`: test one exercise's starter (or solution) files
pub async fn run_exercise(
    paths: &Paths,
    id: &str,
    solution: bool,
    verbose: bool,
    overrides: Option<&str>,
) -> Result<i32> {
    let catalog = paths.catalog()?;
    let Some(exercise) = catalog.get(id) else {
        bail!("Exercise not found: {}", id);
    };
    let executor = paths.executor()?;
    let overrides = parse_overrides(overrides);
    let mode = if solution { Mode::Solution } else { Mode::Starter };

    let cancel = cancel_on_ctrl_c();
    Ok(run_one(&executor, &exercise, mode, &overrides, verbose, false, &cancel).await)
}

/// Exercises to validate: one track, or the examples followed by every
/// listed exercise.
fn exercises_to_validate(catalog: &ExerciseCatalog, track: Option<&str>) -> Vec<Arc<Exercise>> {
    match track {
        Some(track) => catalog.listed_exercises(Some(track)).collect(),
        None => catalog
            .listed_exercises(Some(EXAMPLES_TRACK))
            .chain(catalog.listed_exercises(None))
            .collect(),
    }
}

/// `validate`: run every solution and print a pass/fail summary.
/// Returns 1 if any solution failed.
pub async fn validate(paths: &Paths, track: Option<&str>, verbose: bool) -> Result<i32> {
    let catalog = paths.catalog()?;
    let exercises = exercises_to_validate(&catalog, track);
    if exercises.is_empty() {
        bail!("No exercises found");
    }
    let executor = paths.executor()?;
    let cancel = cancel_on_ctrl_c();

    let mut failed = Vec::new();
    for exercise in &exercises {
        if cancel.is_cancelled() {
            break;
        }
        println!("\n=== Running {} ===", exercise.id);
        let code = run_one(&executor, exercise, Mode::Solution, &[], verbose, true, &cancel).await;
        if code == 0 {
            println!("✅ {}", exercise.id);
        } else {
            println!("❌ {} (exit code {})", exercise.id, code);
            failed.push(exercise.id.clone());
        }
    }

    let total = exercises.len();
    let pass = total - failed.len();
    println!(
        "\nSummary: pass={} fail={} total={}",
        pass,
        failed.len(),
        total
    );
    if !failed.is_empty() {
        println!("Failed: {}", failed.join(", "));
    }
    Ok(if failed.is_empty() { 0 } else { 1 })
}

/// `list`: print listed exercises
pub fn list_exercises(paths: &Paths, track: Option<&str>) -> Result<()> {
    let catalog = paths.catalog()?;
    let summaries = catalog.list(track);
    if summaries.is_empty() {
        println!("No exercises found");
        return Ok(());
    }

    println!("{:<32} {:<10} {:<20} TITLE", "ID", "DIFFICULTY", "CATEGORY");
    for summary in summaries {
        println!(
            "{:<32} {:<10} {:<20} {}",
            summary.id,
            summary.difficulty.as_deref().unwrap_or("-"),
            summary.category,
            summary.title
        );
    }
    Ok(())
}
