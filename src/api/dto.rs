//! Wire-format request/response bodies for the HTTP control surface.
//!
//! Every success and error response wraps `{ code, data?, message? }`, and
//! `TaskDto` normalises the store's internal `Task` onto the fixed schema of
//! spec section 3: no `chunks`, no `downloadedSize` vs `downloadedBytes`
//! ambiguity, one canonical shape at the API boundary.

use serde::{Deserialize, Serialize};

use crate::coord::Platform;
use crate::store::task::Task;

#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Envelope { code: 200, data: Some(data), message: None }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub uptime: u64,
}

#[derive(Debug, Deserialize)]
pub struct CreateDownloadRequest {
    #[serde(rename = "imageName")]
    pub image_name: String,
    pub tag: Option<String>,
    pub source: Option<String>,
    #[serde(rename = "targetPath")]
    pub target_path: Option<String>,
    pub platform: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ImageSizeQuery {
    pub name: String,
    pub source: Option<String>,
    pub tag: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ImageSizeResponse {
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
    pub size: String,
}

#[derive(Debug, Serialize)]
pub struct TaskDto {
    pub id: String,
    pub source: String,
    pub repository: String,
    pub reference: String,
    pub platform: Platform,
    pub state: &'static str,
    #[serde(rename = "totalBytes")]
    pub total_bytes: u64,
    #[serde(rename = "downloadedBytes")]
    pub downloaded_bytes: u64,
    pub progress: f64,
    #[serde(rename = "speedBps")]
    pub speed_bps: f64,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    pub retries: u32,
    #[serde(rename = "targetDir")]
    pub target_dir: String,
    pub checksum: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<Task> for TaskDto {
    fn from(task: Task) -> Self {
        let progress = task.progress_percent();
        TaskDto {
            id: task.id,
            source: task.coord.source.to_string(),
            repository: task.coord.repository,
            reference: task.coord.reference,
            platform: task.platform,
            state: state_name(task.state),
            total_bytes: task.total_bytes,
            downloaded_bytes: task.downloaded_bytes,
            progress,
            speed_bps: task.speed_bps,
            last_error: task.last_error.map(|e| e.message),
            retries: task.retries,
            target_dir: task.target_dir.display().to_string(),
            checksum: task.checksum,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

fn state_name(state: crate::store::task::TaskState) -> &'static str {
    use crate::store::task::TaskState::*;
    match state {
        Pending => "Pending",
        Resolving => "Resolving",
        Fetching => "Fetching",
        Paused => "Paused",
        Completed => "Completed",
        Failed => "Failed",
        Cancelled => "Cancelled",
    }
}

/// Render a byte count as a human-readable size, e.g. `"1.2 GB"`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[unit])
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}
