mod auth;
mod error;
mod handlers;
mod metrics;
mod output;
mod registry;
mod routes;
mod stream;
mod submissions;

#[cfg(test)]
mod api_tests;

use anyhow::{Context, Result};
use soliditybytes_common::catalog::ExerciseCatalog;
use soliditybytes_common::config::{Config, LogFormat};
use soliditybytes_common::progress::{JsonFileProgressStore, ProgressStore};
use soliditybytes_runner::{Executor, ToolchainConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::auth::SessionStore;
use crate::registry::{Clock, SubmissionRegistry, SystemClock};
use crate::submissions::SubmissionService;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct AppState {
    pub config: Config,
    pub catalog: Arc<ExerciseCatalog>,
    pub registry: Arc<SubmissionRegistry>,
    pub submissions: SubmissionService,
    pub progress: Arc<dyn ProgressStore>,
    pub sessions: SessionStore,
}

impl AppState {
    pub fn new(
        config: Config,
        catalog: ExerciseCatalog,
        executor: Executor,
        progress: Arc<dyn ProgressStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(SubmissionRegistry::new(clock, config.submission_grace));
        let submissions = SubmissionService::new(
            Arc::new(executor),
            registry.clone(),
            progress.clone(),
            config.limits.run_timeout,
            config.limits.max_output_bytes,
        );
        Self {
            sessions: SessionStore::new(config.session_ttl),
            catalog: Arc::new(catalog),
            registry,
            submissions,
            progress,
            config,
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    // Open streams only finish once their runs do
    let cancelled = state.registry.cancel_all();
    info!(cancelled, "Shutdown signal received; cancelling in-flight runs");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("Invalid configuration")?;
    init_tracing(config.log_format);

    info!("Soliditybytes API booting...");

    let catalog = ExerciseCatalog::load(&config.content_root).with_context(|| {
        format!(
            "Failed to load exercises from {}",
            config.content_root.display()
        )
    })?;
    info!(
        exercises = catalog.len(),
        root = %config.content_root.display(),
        "Exercise catalog loaded"
    );

    let toolchain = ToolchainConfig::load_or_default(&config.toolchain_config)
        .context("Failed to load toolchain config")?;
    if let Err(e) = toolchain.preflight() {
        warn!(error = %e, "Toolchain unavailable; submissions will be rejected");
    }
    let executor = Executor::new(toolchain, &config.workspace_root);
    let progress: Arc<dyn ProgressStore> =
        Arc::new(JsonFileProgressStore::new(config.progress_file()));

    let addr = config.listen_addr();
    let state = Arc::new(AppState::new(
        config,
        catalog,
        executor,
        progress,
        Arc::new(SystemClock),
    ));

    let sweeper_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let removed = sweeper_state.registry.sweep();
            let expired = sweeper_state.sessions.purge_expired();
            if removed > 0 || expired > 0 {
                debug!(
                    removed,
                    expired_sessions = expired,
                    live = sweeper_state.registry.len(),
                    "Sweep complete"
                );
            }
        }
    });

    let app = routes::app(state.clone());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("HTTP server listening on {}", addr);
    info!("Ready to accept submissions");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}
