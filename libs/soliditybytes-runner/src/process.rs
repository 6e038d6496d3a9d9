/// Process Runner - Streaming Subprocess Execution
///
/// **Core Responsibility:**
/// Launch one external command, forward its stdout/stderr to an
/// [`OutputSink`] as it is produced, and report how it ended.
///
/// **Boundaries:**
/// - Knows nothing about exercises, workspaces or toolchains
/// - Never interprets the output
/// - Enforces the deadline and cancellation it is handed, nothing more
use crate::error::{Result, RunnerError};
use crate::toolchain::ToolchainCommand;
use soliditybytes_common::types::OutputChunk;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const READ_BUFFER_BYTES: usize = 8 * 1024;
/// How long pipes may stay open once the process itself has exited
const DRAIN_LIMIT: Duration = Duration::from_secs(2);

/// Receiver of decoded subprocess output, in arrival order per stream.
pub trait OutputSink: Send + Sync {
    fn emit(&self, chunk: OutputChunk);
}

/// Sink that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    chunks: Mutex<Vec<OutputChunk>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> Vec<OutputChunk> {
        self.chunks.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// All output concatenated, both streams interleaved as received
    pub fn text(&self) -> String {
        self.chunks().into_iter().map(|c| c.chunk).collect()
    }
}

impl OutputSink for MemorySink {
    fn emit(&self, chunk: OutputChunk) {
        if let Ok(mut chunks) = self.chunks.lock() {
            chunks.push(chunk);
        }
    }
}

/// What to launch and where.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_dir: None,
        }
    }

    pub fn from_toolchain(command: &ToolchainCommand, work_dir: &Path) -> Self {
        Self::new(command.command.clone())
            .args(command.args.iter().cloned())
            .current_dir(work_dir)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(|s| s.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a process run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The process exited by itself (signal deaths are mapped to 128+n)
    Exited(i32),
    /// Killed because the deadline passed
    TimedOut,
    /// Killed because the run was cancelled
    Cancelled,
}

impl RunStatus {
    pub fn code(&self) -> i32 {
        match self {
            RunStatus::Exited(code) => *code,
            RunStatus::TimedOut => 124,
            RunStatus::Cancelled => 130,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, RunStatus::Exited(0))
    }
}

/// Incremental UTF-8 decoder: holds back a split multi-byte sequence until
/// the rest of it arrives. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let mut out = String::new();
        let mut start = 0;
        while start < self.pending.len() {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(s) => {
                    out.push_str(s);
                    start = self.pending.len();
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(
                        &self.pending[start..start + valid],
                    ));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start += valid + len;
                        }
                        // Incomplete sequence at the end; wait for more bytes
                        None => {
                            start += valid;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);

        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Flush whatever is left once the stream has closed
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(rest)
    }
}

async fn read_pipe<R>(pipe: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match pipe {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// SIGKILL every process in the group led by `group`.
#[cfg(unix)]
fn kill_group(group: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = group.and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "Failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_group: Option<u32>) {}

async fn terminate(child: &mut Child, group: Option<u32>) {
    kill_group(group);
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill process");
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Runs commands with piped output, a deadline and a cancellation token.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    buffer_size: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            buffer_size: READ_BUFFER_BYTES,
        }
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `spec` to completion, forwarding output to `sink`.
    ///
    /// Returns `Err` only when the process cannot be launched. A deadline
    /// in the past or an already-cancelled token still spawns the process
    /// and kills it straight away.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        sink: &dyn OutputSink,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<RunStatus> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        if let Some(dir) = &spec.work_dir {
            command.current_dir(dir);
        }

        debug!(command = %spec.display(), "Spawning process");
        let started = Instant::now();

        let mut child = command.spawn().map_err(|source| RunnerError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        // Group leader, so the group id is the child's pid
        let group = child.id();

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut out_buf = vec![0u8; self.buffer_size];
        let mut err_buf = vec![0u8; self.buffer_size];
        let mut out_text = Utf8Chunker::default();
        let mut err_text = Utf8Chunker::default();

        let timeout = sleep_until_opt(deadline);
        tokio::pin!(timeout);

        let mut exited: Option<i32> = None;
        let mut drain_until: Option<Instant> = None;

        let status = loop {
            if let Some(code) = exited {
                if stdout.is_none() && stderr.is_none() {
                    break RunStatus::Exited(code);
                }
            }

            tokio::select! {
                read = read_pipe(&mut stdout, &mut out_buf) => match read {
                    Ok(n) if n > 0 => {
                        if let Some(text) = out_text.push(&out_buf[..n]) {
                            sink.emit(OutputChunk::stdout(text));
                        }
                    }
                    other => {
                        if let Err(e) = other {
                            debug!(error = %e, "stdout read failed");
                        }
                        stdout = None;
                        if let Some(rest) = out_text.finish() {
                            sink.emit(OutputChunk::stdout(rest));
                        }
                    }
                },
                read = read_pipe(&mut stderr, &mut err_buf) => match read {
                    Ok(n) if n > 0 => {
                        if let Some(text) = err_text.push(&err_buf[..n]) {
                            sink.emit(OutputChunk::stderr(text));
                        }
                    }
                    other => {
                        if let Err(e) = other {
                            debug!(error = %e, "stderr read failed");
                        }
                        stderr = None;
                        if let Some(rest) = err_text.finish() {
                            sink.emit(OutputChunk::stderr(rest));
                        }
                    }
                },
                waited = child.wait(), if exited.is_none() => {
                    exited = Some(exit_code(waited?));
                    // Background processes it left behind would hold the pipes open
                    kill_group(group);
                    drain_until = Some(Instant::now() + DRAIN_LIMIT);
                }
                _ = sleep_until_opt(drain_until) => {
                    if let Some(code) = exited {
                        debug!(command = %spec.display(), "Output still open after exit; abandoning pipes");
                        break RunStatus::Exited(code);
                    }
                }
                _ = &mut timeout, if exited.is_none() => {
                    warn!(command = %spec.display(), "Process exceeded deadline; killing");
                    terminate(&mut child, group).await;
                    break RunStatus::TimedOut;
                }
                _ = cancel.cancelled(), if exited.is_none() => {
                    debug!(command = %spec.display(), "Process cancelled; killing");
                    terminate(&mut child, group).await;
                    break RunStatus::Cancelled;
                }
            }
        };

        // Killed runs forward nothing further
        if let RunStatus::Exited(_) = status {
            if let Some(rest) = out_text.finish() {
                sink.emit(OutputChunk::stdout(rest));
            }
            if let Some(rest) = err_text.finish() {
                sink.emit(OutputChunk::stderr(rest));
            }
        }

        debug!(
            command = %spec.display(),
            status = ?status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Process finished"
        );
        Ok(status)
    }
}
