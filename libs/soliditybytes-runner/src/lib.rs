pub mod error;
pub mod executor;
pub mod process;
pub mod toolchain;
pub mod workspace;


pub use error::{Result, RunnerError};
pub use executor::{Executor, RunReport, RunRequest};
pub use process::{CommandSpec, MemorySink, OutputSink, ProcessRunner, RunStatus};
pub use toolchain::ToolchainConfig;
