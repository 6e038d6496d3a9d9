mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use crate::commands::Paths;

#[derive(Parser)]
#[command(name = "soliditybytes")]
#[command(about = "Soliditybytes CLI - Run and validate exercises locally", long_about = None)]
struct Cli {
    /// Directory holding one sub-directory of exercise YAML per track
    #[arg(long, global = true, env = "CONTENT_ROOT", default_value = "exercises")]
    content_root: PathBuf,

    /// Where per-exercise workspaces are created
    #[arg(long, global = true, env = "WORKSPACE_ROOT", default_value = ".runner/workspaces")]
    workspace_root: PathBuf,

    /// Toolchain description (defaults to Hardhat when the file is absent)
    #[arg(long, global = true, env = "TOOLCHAIN_CONFIG", default_value = "config/toolchain.json")]
    toolchain_config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an exercise's tests against its starter or solution files
    Run {
        /// Exercise id (e.g., basic-variables)
        #[arg(long)]
        id: String,

        /// Use the solution files instead of the starter
        #[arg(long, default_value = "false")]
        solution: bool,

        /// Stream install and test output as it happens
        #[arg(long = "vv", visible_alias = "verbose", default_value = "false")]
        verbose: bool,

        /// JSON array of {path, content} files written over the exercise
        #[arg(long, env = "RUN_OVERRIDES")]
        overrides: Option<String>,
    },

    /// Run every solution and report which ones fail
    Validate {
        /// Only validate this track
        #[arg(short, long)]
        track: Option<String>,

        /// Stream install and test output as it happens
        #[arg(long = "vv", visible_alias = "verbose", default_value = "false")]
        verbose: bool,
    },

    /// List exercises
    List {
        /// Only list this track
        #[arg(short, long)]
        track: Option<String>,
    },
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let paths = Paths {
        content_root: cli.content_root,
        workspace_root: cli.workspace_root,
        toolchain_config: cli.toolchain_config,
    };

    match cli.command {
        Commands::Run {
            id,
            solution,
            verbose,
            overrides,
        } => {
            let code =
                commands::run_exercise(&paths, &id, solution, verbose, overrides.as_deref())
                    .await?;
            Ok(exit_code(code))
        }
        Commands::Validate { track, verbose } => {
            let code = commands::validate(&paths, track.as_deref(), verbose).await?;
            Ok(exit_code(code))
        }
        Commands::List { track } => {
            commands::list_exercises(&paths, track.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
