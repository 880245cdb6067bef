//! Progress reporting: per-task and global broadcast topics, throttled to
//! one update per window with an exponentially-smoothed speed estimate.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

const THROTTLE_WINDOW: Duration = Duration::from_millis(250);
const EMA_TIME_CONSTANT_SECS: f64 = 1.0;
const BROADCAST_CAPACITY: usize = 64;

/// The three event payloads of spec section 6, serialised with the exact
/// field names the duplex channel's clients expect.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum ProgressEvent {
    #[serde(rename = "download:progress")]
    Progress {
        #[serde(rename = "taskId")]
        task_id: String,
        progress: f64,
        speed: f64,
        #[serde(rename = "remainingTime")]
        remaining_time: f64,
        #[serde(rename = "downloadedBytes")]
        downloaded_bytes: u64,
        #[serde(rename = "totalBytes")]
        total_bytes: u64,
    },
    #[serde(rename = "download:complete")]
    Complete {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "filePath")]
        file_path: String,
        checksum: String,
    },
    #[serde(rename = "download:error")]
    Error {
        #[serde(rename = "taskId")]
        task_id: String,
        error: String,
    },
}

impl ProgressEvent {
    pub fn task_id(&self) -> &str {
        match self {
            ProgressEvent::Progress { task_id, .. }
            | ProgressEvent::Complete { task_id, .. }
            | ProgressEvent::Error { task_id, .. } => task_id,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Complete { .. } | ProgressEvent::Error { .. })
    }
}

struct SpeedEstimate {
    last_bytes: u64,
    last_instant: Instant,
    speed_bps: f64,
}

struct TaskTopic {
    sender: broadcast::Sender<ProgressEvent>,
    last_emitted: Option<Instant>,
    estimate: SpeedEstimate,
}

/// Fans byte-delta updates out to per-task and global subscribers.
///
/// Progress events are best-effort: a slow or absent subscriber never
/// blocks the downloader, and a full broadcast channel simply drops the
/// oldest buffered update for that topic. Terminal events (`complete`,
/// `error`) always go out, bypassing the throttle.
pub struct ProgressBus {
    topics: RwLock<HashMap<String, TaskTopic>>,
    global: broadcast::Sender<ProgressEvent>,
}

impl ProgressBus {
    pub fn new() -> Self {
        let (global, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { topics: RwLock::new(HashMap::new()), global }
    }

    pub async fn register(&self, task_id: &str) {
        let mut topics = self.topics.write().await;
        topics.entry(task_id.to_string()).or_insert_with(|| {
            let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
            TaskTopic {
                sender,
                last_emitted: None,
                estimate: SpeedEstimate { last_bytes: 0, last_instant: Instant::now(), speed_bps: 0.0 },
            }
        });
    }

    pub async fn unregister(&self, task_id: &str) {
        self.topics.write().await.remove(task_id);
    }

    pub async fn subscribe_task(&self, task_id: &str) -> Option<broadcast::Receiver<ProgressEvent>> {
        self.topics.read().await.get(task_id).map(|t| t.sender.subscribe())
    }

    pub fn subscribe_global(&self) -> broadcast::Receiver<ProgressEvent> {
        self.global.subscribe()
    }

    /// Report a new cumulative `downloaded_bytes` reading for `task_id`.
    ///
    /// Updates the smoothed speed estimate on every call (so it stays
    /// accurate even between emitted events) but only emits an event if
    /// the throttle window has elapsed since the last one. Returns the
    /// current smoothed speed in bytes/sec so the caller can persist it on
    /// the task record independent of the emit throttle.
    pub async fn report_progress(&self, task_id: &str, downloaded_bytes: u64, total_bytes: u64) -> f64 {
        let mut topics = self.topics.write().await;
        let Some(topic) = topics.get_mut(task_id) else { return 0.0 };

        let now = Instant::now();
        let dt = now.duration_since(topic.estimate.last_instant).as_secs_f64();
        if dt > 0.0 {
            let delta_bytes = downloaded_bytes.saturating_sub(topic.estimate.last_bytes);
            let instantaneous_rate = delta_bytes as f64 / dt;
            let alpha = 1.0 - (-dt / EMA_TIME_CONSTANT_SECS).exp();
            topic.estimate.speed_bps = alpha * instantaneous_rate + (1.0 - alpha) * topic.estimate.speed_bps;
        }
        topic.estimate.last_bytes = downloaded_bytes;
        topic.estimate.last_instant = now;
        let speed_bps = topic.estimate.speed_bps;

        let should_emit = topic.last_emitted.is_none_or(|last| now.duration_since(last) >= THROTTLE_WINDOW);
        if !should_emit {
            return speed_bps;
        }
        topic.last_emitted = Some(now);

        let percent = if total_bytes == 0 {
            0.0
        } else {
            (downloaded_bytes as f64 / total_bytes as f64 * 100.0).min(100.0)
        };
        let remaining_bytes = total_bytes.saturating_sub(downloaded_bytes) as f64;
        let remaining_time = if speed_bps > 0.0 { remaining_bytes / speed_bps } else { 0.0 };
        let event = ProgressEvent::Progress {
            task_id: task_id.to_string(),
            downloaded_bytes,
            total_bytes,
            speed: speed_bps,
            progress: percent,
            remaining_time,
        };
        let _ = topic.sender.send(event.clone());
        let _ = self.global.send(event);
        speed_bps
    }

    /// Force a final, unthrottled progress reading followed by a terminal
    /// event. Used when a task reaches a terminal state so subscribers see
    /// the true final byte count rather than whatever the throttle last let
    /// through.
    pub async fn report_terminal(
        &self,
        task_id: &str,
        downloaded_bytes: u64,
        total_bytes: u64,
        outcome: TerminalOutcome,
    ) {
        {
            let mut topics = self.topics.write().await;
            if let Some(topic) = topics.get_mut(task_id) {
                topic.last_emitted = None;
            }
        }
        self.report_progress(task_id, downloaded_bytes, total_bytes).await;

        let topics = self.topics.read().await;
        let Some(topic) = topics.get(task_id) else { return };
        let event = match outcome {
            TerminalOutcome::Completed { file_path, checksum } => {
                ProgressEvent::Complete { task_id: task_id.to_string(), file_path, checksum }
            }
            TerminalOutcome::Failed(error) => ProgressEvent::Error { task_id: task_id.to_string(), error },
        };
        debug_assert!(event.is_terminal());
        let _ = topic.sender.send(event.clone());
        let _ = self.global.send(event);
    }
}

/// How a task's drive loop ended, for the terminal event it triggers.
pub enum TerminalOutcome {
    Completed { file_path: String, checksum: String },
    Failed(String),
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn throttled_progress_within_window_is_not_emitted_twice() {
        let bus = ProgressBus::new();
        bus.register("t1").await;
        let mut rx = bus.subscribe_task("t1").await.unwrap();

        bus.report_progress("t1", 100, 1000).await;
        bus.report_progress("t1", 200, 1000).await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ProgressEvent::Progress { downloaded_bytes: 100, .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn terminal_event_always_emits_even_right_after_progress() {
        let bus = ProgressBus::new();
        bus.register("t1").await;
        let mut rx = bus.subscribe_task("t1").await.unwrap();

        bus.report_progress("t1", 100, 1000).await;
        bus.report_terminal(
            "t1",
            1000,
            1000,
            TerminalOutcome::Completed { file_path: "/tmp/t1".into(), checksum: "sha256:abc".into() },
        )
        .await;

        let _progress = rx.recv().await.unwrap();
        let final_progress = rx.recv().await.unwrap();
        assert!(matches!(final_progress, ProgressEvent::Progress { downloaded_bytes: 1000, .. }));
        let complete = rx.recv().await.unwrap();
        assert!(matches!(complete, ProgressEvent::Complete { .. }));
    }

    #[tokio::test]
    async fn global_topic_receives_events_for_any_task() {
        let bus = ProgressBus::new();
        bus.register("t1").await;
        bus.register("t2").await;
        let mut global_rx = bus.subscribe_global();

        bus.report_progress("t1", 50, 100).await;
        bus.report_progress("t2", 75, 100).await;

        let first = global_rx.recv().await.unwrap();
        let second = global_rx.recv().await.unwrap();
        assert_eq!(first.task_id(), "t1");
        assert_eq!(second.task_id(), "t2");
    }

    #[tokio::test]
    async fn unregistered_task_reports_are_ignored() {
        let bus = ProgressBus::new();
        bus.report_progress("ghost", 1, 100).await;
    }

    #[tokio::test]
    async fn report_progress_returns_zero_speed_on_first_sample() {
        let bus = ProgressBus::new();
        bus.register("t1").await;
        let speed = bus.report_progress("t1", 0, 1000).await;
        assert_eq!(speed, 0.0);
    }
}
