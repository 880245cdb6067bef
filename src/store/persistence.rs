//! Durable, crash-safe `metadata.json` writes and on-disk layout helpers.
//!
//! A task's durable state lives at `tasks/<id>/metadata.json`, written by
//! serialising to a sibling temp file and renaming over the destination so a
//! reader never observes a half-written file.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::{Error, Result};
use crate::store::task::Task;

pub fn tasks_root(downloads_root: &Path) -> PathBuf {
    downloads_root.join("tasks")
}

pub fn task_dir(downloads_root: &Path, id: &str) -> PathBuf {
    tasks_root(downloads_root).join(id)
}

/// Atomically persist `task` to its `metadata.json`.
///
/// Writes to `metadata.json.tmp` first and renames over the real path, so a
/// process crash mid-write leaves the previous metadata intact.
pub async fn save_task(task: &Task) -> Result<()> {
    fs::create_dir_all(&task.target_dir).await?;
    let tmp_path = task.target_dir.join("metadata.json.tmp");
    let body = serde_json::to_vec_pretty(task)?;
    fs::write(&tmp_path, &body).await?;
    fs::rename(&tmp_path, task.metadata_path()).await?;
    Ok(())
}

pub async fn load_task(path: &Path) -> Result<Task> {
    let body = fs::read(path).await?;
    let task: Task = serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidState(format!("corrupt metadata at {}: {e}", path.display())))?;
    Ok(task)
}

/// Scan `tasks_root(downloads_root)` for every `<id>/metadata.json` and load
/// it. Used once at startup to repopulate the in-memory store. A directory
/// whose metadata is missing or unparsable is skipped rather than aborting
/// the whole scan, since the downloads directory can hold interrupted or
/// half-cleaned task directories after a hard shutdown.
pub async fn load_all_tasks(downloads_root: &Path) -> Result<Vec<Task>> {
    let root = tasks_root(downloads_root);
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut tasks = Vec::new();
    let mut entries = fs::read_dir(&root).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let metadata_path = entry.path().join("metadata.json");
        match load_task(&metadata_path).await {
            Ok(task) => tasks.push(task),
            Err(_) => continue,
        }
    }
    Ok(tasks)
}

pub async fn save_manifest_bytes(task: &Task, body: &[u8]) -> Result<()> {
    fs::create_dir_all(&task.target_dir).await?;
    fs::write(task.manifest_path(), body).await?;
    Ok(())
}

pub async fn save_config_bytes(task: &Task, body: &[u8]) -> Result<()> {
    fs::create_dir_all(&task.target_dir).await?;
    fs::write(task.config_path(), body).await?;
    Ok(())
}

/// Remove a task's entire on-disk directory. Used on cancel when
/// `retain_on_cancel` is disabled, and always on an explicit delete.
pub async fn remove_task_dir(task: &Task) -> Result<()> {
    match fs::remove_dir_all(&task.target_dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{ImageCoordinate, Platform, Source};

    fn sample_task(dir: &Path) -> Task {
        let coord = ImageCoordinate::new(Source::DockerHub, "library/nginx", "latest").unwrap();
        Task::new("t1".into(), &coord, Platform::default(), dir.join("t1"))
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let task = sample_task(tmp.path());
        save_task(&task).await.unwrap();

        let loaded = load_task(&task.metadata_path()).await.unwrap();
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.state, task.state);
    }

    #[tokio::test]
    async fn save_leaves_no_temp_file_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let task = sample_task(tmp.path());
        save_task(&task).await.unwrap();
        assert!(!task.target_dir.join("metadata.json.tmp").exists());
        assert!(task.metadata_path().exists());
    }

    #[tokio::test]
    async fn load_all_tasks_skips_directories_without_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let task = sample_task(tmp.path());
        save_task(&task).await.unwrap();

        let stray = tasks_root(tmp.path()).join("stray");
        fs::create_dir_all(&stray).await.unwrap();

        let loaded = load_all_tasks(tmp.path()).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "t1");
    }

    #[tokio::test]
    async fn load_all_tasks_on_missing_root_returns_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let loaded = load_all_tasks(tmp.path()).await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn remove_task_dir_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let task = sample_task(tmp.path());
        save_task(&task).await.unwrap();
        remove_task_dir(&task).await.unwrap();
        assert!(!task.target_dir.exists());
        remove_task_dir(&task).await.unwrap();
    }
}
