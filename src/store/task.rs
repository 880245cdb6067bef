//! The `Task` and `BlobRecord` records: the engine's unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::coord::{ImageCoordinate, Platform, Source};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Resolving,
    Fetching,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Terminal states initiate no further network activity.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobState {
    Missing,
    InProgress,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobRecord {
    pub digest: String,
    pub media_type: String,
    pub size: u64,
    pub state: BlobState,
    pub bytes_written: u64,
    /// Transient failures consumed for this blob specifically, distinct
    /// from the task-level retry budget.
    pub retries: u32,
}

impl BlobRecord {
    pub fn new(digest: String, media_type: String, size: u64) -> Self {
        Self {
            digest,
            media_type,
            size,
            state: BlobState::Missing,
            bytes_written: 0,
            retries: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == BlobState::Done
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastError {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub coord: CoordRecord,
    pub platform: Platform,
    pub state: TaskState,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub speed_bps: f64,
    pub last_error: Option<LastError>,
    pub retries: u32,
    pub target_dir: PathBuf,
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub blobs: Vec<BlobRecord>,
}

/// A serialisable mirror of [`ImageCoordinate`] (kept distinct so the wire
/// schema doesn't depend on `Source`'s custom `Serialize` impl changing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordRecord {
    pub source: Source,
    pub repository: String,
    pub reference: String,
}

impl From<&ImageCoordinate> for CoordRecord {
    fn from(c: &ImageCoordinate) -> Self {
        CoordRecord {
            source: c.source.clone(),
            repository: c.repository.clone(),
            reference: c.reference.clone(),
        }
    }
}

impl Task {
    pub fn new(id: String, coord: &ImageCoordinate, platform: Platform, target_dir: PathBuf) -> Self {
        let now = Utc::now();
        Task {
            id,
            coord: CoordRecord::from(coord),
            platform,
            state: TaskState::Pending,
            total_bytes: 0,
            downloaded_bytes: 0,
            speed_bps: 0.0,
            last_error: None,
            retries: 0,
            target_dir,
            checksum: None,
            created_at: now,
            updated_at: now,
            blobs: Vec::new(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Keeps `downloaded_bytes` equal to the sum of per-blob bytes written.
    pub fn recompute_downloaded_bytes(&mut self) {
        self.downloaded_bytes = self.blobs.iter().map(|b| b.bytes_written).sum();
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.downloaded_bytes as f64 / self.total_bytes as f64 * 100.0).min(100.0)
        }
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.target_dir.join("blobs")
    }

    pub fn blob_path(&self, digest: &str) -> PathBuf {
        self.blobs_dir().join(crate::digest::safe_filename(digest))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.target_dir.join("manifest.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.target_dir.join("config.json")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.target_dir.join("metadata.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        let coord = ImageCoordinate::new(Source::DockerHub, "library/nginx", "latest").unwrap();
        Task::new("t1".into(), &coord, Platform::default(), PathBuf::from("/tmp/t1"))
    }

    #[test]
    fn new_task_starts_pending_with_zero_bytes() {
        let task = sample_task();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.downloaded_bytes, 0);
        assert!(task.blobs.is_empty());
    }

    #[test]
    fn recompute_downloaded_bytes_sums_blob_records() {
        let mut task = sample_task();
        task.blobs.push(BlobRecord::new("sha256:a".into(), "application/vnd.oci.image.layer.v1.tar+gzip".into(), 100));
        task.blobs[0].bytes_written = 40;
        task.blobs.push(BlobRecord::new("sha256:b".into(), "application/vnd.oci.image.layer.v1.tar+gzip".into(), 200));
        task.blobs[1].bytes_written = 200;
        task.recompute_downloaded_bytes();
        assert_eq!(task.downloaded_bytes, 240);
    }

    #[test]
    fn terminal_states_are_identified() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Fetching.is_terminal());
        assert!(!TaskState::Paused.is_terminal());
    }

    #[test]
    fn blob_path_uses_safe_filename() {
        let task = sample_task();
        let path = task.blob_path("sha256:abc123");
        assert_eq!(path, task.target_dir.join("blobs").join("sha256_abc123"));
    }
}
