use crate::process::RunStatus;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Infrastructure failures of the execution pipeline.
///
/// A failing test suite is not an error: it is a non-zero exit code carried
/// by [`RunStatus`].
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The external command could not be launched at all
    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A toolchain program is not on the search path
    #[error("toolchain program '{0}' not found on PATH")]
    ToolchainMissing(String),

    /// Dependency installation exited non-zero
    #[error("dependency install failed with exit code {code}")]
    Install { code: i32 },

    /// Install or run stopped by the deadline or a cancellation
    #[error("run interrupted ({0:?})")]
    Interrupted(RunStatus),

    #[error("exercise '{id}' has no {section} files")]
    MissingFiles { id: String, section: &'static str },

    #[error("invalid file path '{0}'")]
    InvalidPath(String),

    #[error("failed to load toolchain config {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Exit code reported to clients when the pipeline fails before or
    /// around the test command.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunnerError::Spawn { .. } | RunnerError::ToolchainMissing(_) => 127,
            RunnerError::Install { code } if *code != 0 => *code,
            RunnerError::Interrupted(status) => status.code(),
            _ => 1,
        }
    }
}
