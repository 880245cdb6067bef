//! The scheduler: bounds global and per-task concurrency, admits pending
//! tasks FIFO by creation order, and exposes the pause/resume/cancel/retry
//! verbs over running tasks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Semaphore, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::coord::{ImageCoordinate, Platform};
use crate::engine::progress::ProgressBus;
use crate::engine::state_machine::{self, DriveContext};
use crate::error::{Error, Result};
use crate::registry::client::RegistryClient;
use crate::store::task::TaskState;
use crate::store::TaskStore;

struct RunningTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Owns the task store, the progress bus, and the two concurrency bounds
/// (`N_tasks` global, `N_blobs` per task). One `Scheduler` per running
/// engine; `Arc`-shared with the API layer.
pub struct Scheduler {
    store: Arc<TaskStore>,
    progress: Arc<ProgressBus>,
    task_semaphore: Arc<Semaphore>,
    max_blobs_per_task: usize,
    max_retries: u32,
    running: Arc<RwLock<HashMap<String, RunningTask>>>,
    clients: RwLock<HashMap<String, Arc<RegistryClient>>>,
    config: EngineConfig,
}

impl Scheduler {
    pub fn new(store: Arc<TaskStore>, progress: Arc<ProgressBus>, config: EngineConfig) -> Self {
        Self {
            task_semaphore: Arc::new(Semaphore::new(config.max_tasks)),
            max_blobs_per_task: config.max_blobs_per_task,
            max_retries: config.max_retries,
            running: Arc::new(RwLock::new(HashMap::new())),
            clients: RwLock::new(HashMap::new()),
            store,
            progress,
            config,
        }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn progress(&self) -> &Arc<ProgressBus> {
        &self.progress
    }

    /// Create a new task and immediately admit it for scheduling.
    pub async fn submit(&self, coord: ImageCoordinate, platform: Platform) -> Result<String> {
        let id = self.store.create(&coord, platform).await?;
        self.start(&id).await?;
        Ok(id)
    }

    /// (Re-)start a task that is `Pending`, `Paused` or `Failed`. Acquires a
    /// global task permit and spawns the drive loop; the permit is held for
    /// the lifetime of the spawned task.
    pub async fn start(&self, id: &str) -> Result<()> {
        {
            let running = self.running.read().await;
            if running.contains_key(id) {
                return Ok(());
            }
        }

        let task = self.store.snapshot(id).await?;
        if task.state.is_terminal() && task.state != TaskState::Failed {
            return Err(Error::InvalidState(format!(
                "cannot start task {id} from terminal state"
            )));
        }

        let source_key = task.coord.source.to_string();
        let source_config = self.config.resolve_source(&task.coord.source)?;
        let client = self.client_for(&source_key, source_config).await?;

        self.store
            .mutate(id, |t| {
                t.state = TaskState::Pending;
                t.last_error = None;
            })
            .await?;
        self.progress.register(id).await;

        let permit_semaphore = self.task_semaphore.clone();
        let store = self.store.clone();
        let progress = self.progress.clone();
        let cancel = CancellationToken::new();
        let blob_semaphore = Arc::new(Semaphore::new(self.max_blobs_per_task));
        let max_retries = self.max_retries;
        let task_id = id.to_string();
        let drive_cancel = cancel.clone();
        let running_map = self.running.clone();
        let cleanup_id = task_id.clone();

        let handle = tokio::spawn(async move {
            let _permit = match permit_semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let ctx = DriveContext {
                client,
                store,
                progress,
                blob_semaphore,
                cancel: drive_cancel,
                max_retries,
            };
            state_machine::drive_task(task_id, ctx).await;
            // A task that reaches `Completed`/`Failed` on its own (as opposed
            // to being stopped via `pause`/`cancel`, which already remove
            // their own entry before awaiting this handle) would otherwise
            // leave a stale entry behind, making `start`'s `running.contains_key`
            // guard wrongly treat a finished task as still in flight and turn
            // `retry`/`resume` into a silent no-op.
            running_map.write().await.remove(&cleanup_id);
        });

        self.running.write().await.insert(
            id.to_string(),
            RunningTask { handle, cancel },
        );
        Ok(())
    }

    /// Cooperatively pause a running task. The drive loop checks the
    /// cancellation token between blobs and at chunk boundaries within a
    /// blob, so pause takes effect promptly without corrupting a
    /// partially-written blob (resumed on the next `start`).
    pub async fn pause(&self, id: &str) -> Result<()> {
        self.signal_stop(id, TaskState::Paused).await
    }

    pub async fn cancel(&self, id: &str) -> Result<()> {
        self.signal_stop(id, TaskState::Cancelled).await
    }

    async fn signal_stop(&self, id: &str, target_state: TaskState) -> Result<()> {
        let mut running = self.running.write().await;
        if let Some(task) = running.remove(id) {
            task.cancel.cancel();
            drop(running);
            let _ = task.handle.await;
        }
        self.store
            .mutate(id, |t| {
                if !t.state.is_terminal() {
                    t.state = target_state;
                }
            })
            .await?;
        Ok(())
    }

    /// Retry a `Failed` task: clears the error and resubmits it to the
    /// scheduler, resuming from whatever blobs are already on disk.
    pub async fn retry(&self, id: &str) -> Result<()> {
        let task = self.store.snapshot(id).await?;
        if task.state != TaskState::Failed {
            return Err(Error::InvalidState(format!(
                "task {id} is not in a failed state"
            )));
        }
        self.store
            .mutate(id, |t| {
                t.retries = 0;
                t.last_error = None;
            })
            .await?;
        self.start(id).await
    }

    /// Resume a paused task; identical to `start` but named for the verb
    /// the control API exposes.
    pub async fn resume(&self, id: &str) -> Result<()> {
        self.start(id).await
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if let Some(task) = running.remove(id) {
                task.cancel.cancel();
                drop(running);
                let _ = task.handle.await;
            }
        }
        self.progress.unregister(id).await;
        self.store.remove(id, self.config.retain_on_cancel).await
    }

    async fn client_for(&self, source_key: &str, source_config: crate::config::SourceConfig) -> Result<Arc<RegistryClient>> {
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get(source_key) {
            return Ok(client.clone());
        }
        let client = Arc::new(RegistryClient::new(source_config, false)?);
        clients.insert(source_key.to_string(), client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{ImageCoordinate, Source};
    use crate::store::task::TaskState;

    fn build_scheduler(tmp: &std::path::Path) -> Scheduler {
        let mut config = EngineConfig::from_env();
        config.downloads_root = tmp.to_path_buf();
        let store = Arc::new(TaskStore::new(config.downloads_root.clone()));
        let progress = Arc::new(ProgressBus::new());
        Scheduler::new(store, progress, config)
    }

    #[tokio::test]
    async fn retry_rejects_a_task_that_is_not_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = build_scheduler(tmp.path());
        let coord = ImageCoordinate::new(Source::DockerHub, "library/nginx", "latest").unwrap();
        let id = scheduler.store().create(&coord, Platform::default()).await.unwrap();

        let err = scheduler.retry(&id).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidState");
    }

    #[tokio::test]
    async fn pause_on_an_already_terminal_task_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = build_scheduler(tmp.path());
        let coord = ImageCoordinate::new(Source::DockerHub, "library/nginx", "latest").unwrap();
        let id = scheduler.store().create(&coord, Platform::default()).await.unwrap();
        scheduler
            .store()
            .mutate(&id, |t| t.state = TaskState::Completed)
            .await
            .unwrap();

        scheduler.pause(&id).await.unwrap();

        let task = scheduler.store().snapshot(&id).await.unwrap();
        assert_eq!(task.state, TaskState::Completed, "pause must not revive a terminal task");
    }

    #[tokio::test]
    async fn cancel_on_unknown_task_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = build_scheduler(tmp.path());
        let err = scheduler.cancel("does-not-exist").await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[tokio::test]
    async fn cancel_of_a_paused_task_transitions_to_cancelled() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = build_scheduler(tmp.path());
        let coord = ImageCoordinate::new(Source::DockerHub, "library/nginx", "latest").unwrap();
        let id = scheduler.store().create(&coord, Platform::default()).await.unwrap();
        scheduler
            .store()
            .mutate(&id, |t| t.state = TaskState::Paused)
            .await
            .unwrap();

        scheduler.cancel(&id).await.unwrap();

        let task = scheduler.store().snapshot(&id).await.unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
    }
}
