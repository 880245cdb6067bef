//! The task store: an in-memory index over tasks, durable via
//! [`persistence`], with per-task locking so concurrent blob writers and API
//! readers never observe a torn update.

pub mod persistence;
pub mod task;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::coord::{ImageCoordinate, Platform};
use crate::error::{Error, Result};
use crate::store::task::Task;

/// `metadata.json` is rewritten for a mid-blob progress update only once
/// `downloaded_bytes` has advanced by this much since the last write (spec
/// section 4.2's durability contract). State transitions and blob-state
/// changes always persist immediately regardless of this watermark.
pub const PROGRESS_PERSIST_WATERMARK: u64 = 4 * 1024 * 1024;

/// A task plus the lock guarding in-place mutation of it.
pub struct TaskEntry {
    pub task: Mutex<Task>,
    /// `downloaded_bytes` as of the last `metadata.json` write, used to
    /// throttle mid-blob progress persistence to the 4 MiB watermark.
    last_persisted_bytes: AtomicU64,
}

/// The engine's single source of truth for task records.
///
/// Reads and writes to the index (insert, remove, list) take the top-level
/// `RwLock`; mutation of a single task's fields takes only that task's own
/// `Mutex`, so two different tasks never contend with each other.
pub struct TaskStore {
    downloads_root: std::path::PathBuf,
    tasks: RwLock<HashMap<String, Arc<TaskEntry>>>,
}

impl TaskStore {
    pub fn new(downloads_root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            downloads_root: downloads_root.into(),
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Reload every task directory under `downloads_root` into the index.
    /// Called once at startup so an engine restart picks back up whatever
    /// was in flight.
    pub async fn load_from_disk(&self) -> Result<()> {
        let loaded = persistence::load_all_tasks(&self.downloads_root).await?;
        let mut tasks = self.tasks.write().await;
        for task in loaded {
            let last_persisted_bytes = AtomicU64::new(task.downloaded_bytes);
            tasks.insert(task.id.clone(), Arc::new(TaskEntry { task: Mutex::new(task), last_persisted_bytes }));
        }
        Ok(())
    }

    pub fn downloads_root(&self) -> &Path {
        &self.downloads_root
    }

    /// Create and persist a new task for `coord`/`platform`, returning its id.
    pub async fn create(&self, coord: &ImageCoordinate, platform: Platform) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let target_dir = persistence::task_dir(&self.downloads_root, &id);
        let task = Task::new(id.clone(), coord, platform, target_dir);
        persistence::save_task(&task).await?;

        let mut tasks = self.tasks.write().await;
        let entry = TaskEntry {
            last_persisted_bytes: AtomicU64::new(task.downloaded_bytes),
            task: Mutex::new(task),
        };
        tasks.insert(id.clone(), Arc::new(entry));
        Ok(id)
    }

    pub async fn entry(&self, id: &str) -> Result<Arc<TaskEntry>> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no such download: {id}")))
    }

    /// Snapshot every task's current state. Cheap: clones the small `Task`
    /// struct rather than holding locks across the API response.
    pub async fn list(&self) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut out = Vec::with_capacity(tasks.len());
        for entry in tasks.values() {
            out.push(entry.task.lock().await.clone());
        }
        out
    }

    pub async fn snapshot(&self, id: &str) -> Result<Task> {
        let entry = self.entry(id).await?;
        Ok(entry.task.lock().await.clone())
    }

    /// Mutate a task under its own lock, always persisting the result
    /// immediately. Use for state transitions, blob-state changes and any
    /// other durability-critical update.
    pub async fn mutate<F>(&self, id: &str, f: F) -> Result<Task>
    where
        F: FnOnce(&mut Task),
    {
        let entry = self.entry(id).await?;
        let mut task = entry.task.lock().await;
        f(&mut task);
        task.touch();
        persistence::save_task(&task).await?;
        entry.last_persisted_bytes.store(task.downloaded_bytes, Ordering::Relaxed);
        Ok(task.clone())
    }

    /// Mutate a task's mid-blob progress fields, persisting `metadata.json`
    /// only once `downloaded_bytes` has advanced by
    /// [`PROGRESS_PERSIST_WATERMARK`] since the last write. The in-memory
    /// record is always updated; on restart, on-disk blob file lengths are
    /// the ground truth for any bytes not yet flushed to `metadata.json`.
    pub async fn update_progress<F>(&self, id: &str, f: F) -> Result<Task>
    where
        F: FnOnce(&mut Task),
    {
        let entry = self.entry(id).await?;
        let mut task = entry.task.lock().await;
        f(&mut task);
        task.touch();

        let last = entry.last_persisted_bytes.load(Ordering::Relaxed);
        if task.downloaded_bytes.saturating_sub(last) >= PROGRESS_PERSIST_WATERMARK {
            persistence::save_task(&task).await?;
            entry.last_persisted_bytes.store(task.downloaded_bytes, Ordering::Relaxed);
        }
        Ok(task.clone())
    }

    /// Remove a task from the index and, unless `retain`, its on-disk
    /// directory too.
    pub async fn remove(&self, id: &str, retain: bool) -> Result<()> {
        let entry = {
            let mut tasks = self.tasks.write().await;
            tasks
                .remove(id)
                .ok_or_else(|| Error::NotFound(format!("no such download: {id}")))?
        };
        if !retain {
            let task = entry.task.lock().await;
            persistence::remove_task_dir(&task).await?;
        }
        Ok(())
    }

    /// Delete every terminal task (`Completed`/`Failed`/`Cancelled`) whose
    /// `updated_at` is older than `older_than`, removing its on-disk
    /// directory as well. Returns the ids swept. Intended for an optional
    /// periodic background job, not exposed over HTTP.
    pub async fn sweep(&self, older_than: ChronoDuration) -> Result<Vec<String>> {
        let cutoff = chrono::Utc::now() - older_than;
        let candidates: Vec<String> = {
            let tasks = self.tasks.read().await;
            let mut ids = Vec::new();
            for (id, entry) in tasks.iter() {
                let task = entry.task.lock().await;
                if task.state.is_terminal() && task.updated_at < cutoff {
                    ids.push(id.clone());
                }
            }
            ids
        };

        let mut swept = Vec::with_capacity(candidates.len());
        for id in candidates {
            if self.remove(&id, false).await.is_ok() {
                swept.push(id);
            }
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::Source;
    use crate::store::task::TaskState;

    fn coord() -> ImageCoordinate {
        ImageCoordinate::new(Source::DockerHub, "library/nginx", "latest").unwrap()
    }

    #[tokio::test]
    async fn create_then_snapshot_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(tmp.path());
        let id = store.create(&coord(), Platform::default()).await.unwrap();
        let task = store.snapshot(&id).await.unwrap();
        assert_eq!(task.id, id);
    }

    #[tokio::test]
    async fn mutate_persists_across_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(tmp.path());
        let id = store.create(&coord(), Platform::default()).await.unwrap();
        store
            .mutate(&id, |t| t.total_bytes = 1234)
            .await
            .unwrap();

        let reloaded = TaskStore::new(tmp.path());
        reloaded.load_from_disk().await.unwrap();
        let task = reloaded.snapshot(&id).await.unwrap();
        assert_eq!(task.total_bytes, 1234);
    }

    #[tokio::test]
    async fn update_progress_withholds_write_below_watermark() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(tmp.path());
        let id = store.create(&coord(), Platform::default()).await.unwrap();

        store
            .update_progress(&id, |t| t.downloaded_bytes = PROGRESS_PERSIST_WATERMARK - 1)
            .await
            .unwrap();

        let reloaded = TaskStore::new(tmp.path());
        reloaded.load_from_disk().await.unwrap();
        let on_disk = reloaded.snapshot(&id).await.unwrap();
        assert_eq!(on_disk.downloaded_bytes, 0, "sub-watermark progress must not hit disk yet");

        let in_memory = store.snapshot(&id).await.unwrap();
        assert_eq!(in_memory.downloaded_bytes, PROGRESS_PERSIST_WATERMARK - 1);
    }

    #[tokio::test]
    async fn update_progress_persists_once_watermark_crossed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(tmp.path());
        let id = store.create(&coord(), Platform::default()).await.unwrap();

        store
            .update_progress(&id, |t| t.downloaded_bytes = PROGRESS_PERSIST_WATERMARK)
            .await
            .unwrap();

        let reloaded = TaskStore::new(tmp.path());
        reloaded.load_from_disk().await.unwrap();
        let on_disk = reloaded.snapshot(&id).await.unwrap();
        assert_eq!(on_disk.downloaded_bytes, PROGRESS_PERSIST_WATERMARK);
    }

    #[tokio::test]
    async fn mutate_always_persists_regardless_of_watermark() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(tmp.path());
        let id = store.create(&coord(), Platform::default()).await.unwrap();

        store.mutate(&id, |t| t.downloaded_bytes = 1).await.unwrap();

        let reloaded = TaskStore::new(tmp.path());
        reloaded.load_from_disk().await.unwrap();
        let on_disk = reloaded.snapshot(&id).await.unwrap();
        assert_eq!(on_disk.downloaded_bytes, 1);
    }

    #[tokio::test]
    async fn snapshot_of_unknown_id_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(tmp.path());
        let err = store.snapshot("nope").await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[tokio::test]
    async fn remove_without_retain_deletes_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(tmp.path());
        let id = store.create(&coord(), Platform::default()).await.unwrap();
        let dir = store.snapshot(&id).await.unwrap().target_dir;
        store.remove(&id, false).await.unwrap();
        assert!(!dir.exists());
        assert!(store.snapshot(&id).await.is_err());
    }

    #[tokio::test]
    async fn remove_with_retain_keeps_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(tmp.path());
        let id = store.create(&coord(), Platform::default()).await.unwrap();
        let dir = store.snapshot(&id).await.unwrap().target_dir;
        store.remove(&id, true).await.unwrap();
        assert!(dir.exists());
    }

    /// Backdate a task's `updated_at` directly through its entry, bypassing
    /// `mutate`'s `touch()` (which would stomp the very timestamp we're
    /// trying to set) so the sweep test can simulate an old terminal task.
    async fn backdate(store: &TaskStore, id: &str, age: ChronoDuration, state: TaskState) {
        let entry = store.entry(id).await.unwrap();
        let mut task = entry.task.lock().await;
        task.state = state;
        task.updated_at = chrono::Utc::now() - age;
        persistence::save_task(&task).await.unwrap();
    }

    #[tokio::test]
    async fn sweep_only_removes_old_terminal_tasks() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(tmp.path());

        let fresh_terminal = store.create(&coord(), Platform::default()).await.unwrap();
        backdate(&store, &fresh_terminal, ChronoDuration::minutes(1), TaskState::Completed).await;

        let stale_terminal = store.create(&coord(), Platform::default()).await.unwrap();
        backdate(&store, &stale_terminal, ChronoDuration::days(2), TaskState::Failed).await;

        let still_fetching = store.create(&coord(), Platform::default()).await.unwrap();
        backdate(&store, &still_fetching, ChronoDuration::days(2), TaskState::Fetching).await;

        let swept = store.sweep(ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(swept, vec![stale_terminal.clone()]);
        assert!(store.snapshot(&fresh_terminal).await.is_ok());
        assert!(store.snapshot(&stale_terminal).await.is_err());
        assert!(store.snapshot(&still_fetching).await.is_ok());
    }
}
