//! fetchd binary entry point: `serve` runs the control plane, `pull` drives
//! a single download from the terminal.

use std::sync::Arc;

use fetchd::api::http::build_router;
use fetchd::api::state::AppState;
use fetchd::cli::{self, Cli, Commands};
use fetchd::engine::{ProgressBus, Scheduler};
use fetchd::error::Result;
use fetchd::store::task::TaskState;
use fetchd::store::TaskStore;
use fetchd::EngineConfig;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse_args();
    match cli.command {
        Commands::Serve { bind } => serve(bind).await,
        Commands::Pull { image, tag, source, platform } => {
            pull(&image, &tag, &source, platform.as_deref()).await
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

async fn serve(bind_override: Option<String>) -> Result<()> {
    let config = cli::apply_overrides(EngineConfig::from_env(), bind_override);
    let store = Arc::new(TaskStore::new(config.downloads_root.clone()));
    store.load_from_disk().await?;
    recover_in_flight_tasks(&store).await?;

    let progress = Arc::new(ProgressBus::new());
    let scheduler = Arc::new(Scheduler::new(store.clone(), progress, config.clone()));
    resume_recovered_tasks(&scheduler).await?;

    let state = AppState::new(scheduler.clone(), Arc::new(config.clone()));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|e| fetchd::Error::Io(format!("failed to bind {}: {e}", config.bind_addr)))?;
    tracing::info!(addr = %config.bind_addr, "fetchd control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| fetchd::Error::Io(format!("server error: {e}")))?;

    tracing::info!("shutdown complete");
    Ok(())
}

/// A task left `Fetching`/`Resolving` at the last shutdown has no scheduler
/// entry yet on this run; normalise it to `Paused` so `resume_recovered_tasks`
/// can re-admit it through the normal scheduler path rather than the engine
/// silently forgetting it ever existed.
async fn recover_in_flight_tasks(store: &TaskStore) -> Result<()> {
    for task in store.list().await {
        if matches!(task.state, TaskState::Fetching | TaskState::Resolving) {
            store.mutate(&task.id, |t| t.state = TaskState::Paused).await?;
        }
    }
    Ok(())
}

async fn resume_recovered_tasks(scheduler: &Scheduler) -> Result<()> {
    for task in scheduler.store().list().await {
        if task.state == TaskState::Paused {
            scheduler.resume(&task.id).await?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received, stopping admission of new tasks");
}

/// Drive a single download from the terminal without a server: build the
/// same store/scheduler pair `serve` uses, submit one task, and poll the
/// task store until it reaches a terminal state.
async fn pull(image: &str, tag: &str, source: &str, platform: Option<&str>) -> Result<()> {
    let config = EngineConfig::from_env();
    let store = Arc::new(TaskStore::new(config.downloads_root.clone()));
    store.load_from_disk().await?;
    let progress = Arc::new(ProgressBus::new());
    let scheduler = Scheduler::new(store, progress, config);

    let (coord, platform) = cli::pull_target(image, tag, source, platform)?;
    tracing::info!(%coord, "starting pull");
    let id = scheduler.submit(coord, platform).await?;

    loop {
        let task = scheduler.store().snapshot(&id).await?;
        tracing::info!(
            state = ?task.state,
            downloaded = task.downloaded_bytes,
            total = task.total_bytes,
            "progress"
        );
        if task.state.is_terminal() {
            match task.state {
                TaskState::Completed => {
                    tracing::info!(checksum = ?task.checksum, dir = %task.target_dir.display(), "pull complete");
                }
                TaskState::Failed => {
                    tracing::error!(error = ?task.last_error, "pull failed");
                }
                _ => {}
            }
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
    Ok(())
}
