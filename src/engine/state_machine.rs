//! Per-task drive loop: resolves the manifest, plans the blob set, and
//! fetches every blob to disk, retrying transient failures with backoff.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::engine::progress::ProgressBus;
use crate::error::{Error, Result};
use crate::registry::client::RegistryClient;
use crate::registry::manifest::{parse_manifest_body, ManifestDocument};
use crate::store::task::{BlobRecord, BlobState, TaskState};
use crate::store::TaskStore;

const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// No bytes read for this long on a blob stream surfaces as a transient
/// `Transport` error (spec section 5: "an implementation may add an
/// inactivity timer, e.g. 60s with no bytes").
const BLOB_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);

/// `5s * 2^attempt`, clamped to 60s.
pub fn backoff_for(attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let candidate = INITIAL_BACKOFF.saturating_mul(factor.min(u32::MAX as u64) as u32);
    candidate.min(MAX_BACKOFF)
}

pub struct DriveContext {
    pub client: Arc<RegistryClient>,
    pub store: Arc<TaskStore>,
    pub progress: Arc<ProgressBus>,
    pub blob_semaphore: Arc<Semaphore>,
    pub cancel: CancellationToken,
    pub max_retries: u32,
}

/// Drive a single task from wherever it currently is through to a terminal
/// state. Returns once the task is `Completed`, `Failed` or `Cancelled`;
/// errors are recorded on the task record rather than propagated, since the
/// caller (the scheduler) has nothing further to do with them.
pub async fn drive_task(task_id: String, ctx: DriveContext) {
    let outcome = run(&task_id, &ctx).await;

    // `Cancelled` covers both `pause` and `cancel`, which resolve to two
    // different task states; `Scheduler::signal_stop` already knows which
    // one applies and writes it itself once this function returns. Setting
    // a state here too would race it and always lose to `Cancelled`,
    // stomping a `pause`'s intended `Paused` result.
    if matches!(outcome, Err(Error::Cancelled)) {
        return;
    }

    let final_state = match &outcome {
        Ok(()) => TaskState::Completed,
        Err(_) => TaskState::Failed,
    };

    let task = ctx
        .store
        .mutate(&task_id, |t| {
            t.state = final_state;
            if let Err(e) = &outcome {
                t.last_error = Some(crate::store::task::LastError {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                });
            }
        })
        .await;

    if let Ok(task) = task {
        let terminal_outcome = match &outcome {
            Ok(()) => crate::engine::progress::TerminalOutcome::Completed {
                file_path: task.target_dir.display().to_string(),
                checksum: task.checksum.clone().unwrap_or_default(),
            },
            Err(e) => crate::engine::progress::TerminalOutcome::Failed(e.to_string()),
        };
        ctx.progress
            .report_terminal(&task_id, task.downloaded_bytes, task.total_bytes, terminal_outcome)
            .await;
    }
}

async fn run(task_id: &str, ctx: &DriveContext) -> Result<()> {
    let task = ctx.store.snapshot(task_id).await?;
    // A task with a blob plan already has been through `resolve` on an
    // earlier attempt (pause/resume or retry re-admits it here). Section
    // 4.3 requires resume to re-enter `Fetching` "using the saved offsets",
    // not to resolve again: re-resolving would refetch the manifest and
    // rebuild fresh `BlobRecord`s, silently zeroing `bytes_written` for
    // blobs that are already `Done` on disk and violating the monotone
    // `downloaded_bytes` invariant. Skip straight to fetching instead.
    let manifest_digest = if task.blobs.is_empty() {
        resolve(task_id, ctx).await?
    } else {
        ctx.store
            .mutate(task_id, |t| t.state = TaskState::Fetching)
            .await?;
        manifest_digest_from_disk(&task).await?
    };
    fetch_all_blobs(task_id, ctx).await?;
    save_config_blob(task_id, ctx).await?;
    ctx.store
        .mutate(task_id, |t| {
            t.state = TaskState::Completed;
            t.checksum = Some(manifest_digest.clone());
        })
        .await?;
    Ok(())
}

/// Recompute the selected manifest's digest from the copy already saved to
/// `manifest.json`, without a network round trip. Used when resuming a
/// task whose blob plan is already known, since the digest is only needed
/// for the final `checksum` field.
async fn manifest_digest_from_disk(task: &crate::store::task::Task) -> Result<String> {
    let bytes = tokio::fs::read(task.manifest_path()).await?;
    Ok(crate::digest::compute(&bytes))
}

/// Copy the already-downloaded config blob's bytes to `config.json`
/// verbatim (spec section 3's on-disk layout keeps it separate from the
/// `blobs/` directory the generic blob loop writes to).
async fn save_config_blob(task_id: &str, ctx: &DriveContext) -> Result<()> {
    let task = ctx.store.snapshot(task_id).await?;
    let Some(config) = task.blobs.first() else { return Ok(()) };
    let bytes = tokio::fs::read(task.blob_path(&config.digest)).await?;
    crate::store::persistence::save_config_bytes(&task, &bytes).await
}

/// Resolve the manifest (following a manifest-list selection if present),
/// populate the task's blob plan, and move it to `Fetching`. Returns the
/// digest of the selected concrete manifest.
async fn resolve(task_id: &str, ctx: &DriveContext) -> Result<String> {
    ctx.store
        .mutate(task_id, |t| t.state = TaskState::Resolving)
        .await?;
    let task = ctx.store.snapshot(task_id).await?;
    let repository = task.coord.repository.clone();

    let response = retrying(ctx, task_id, || {
        let client = ctx.client.clone();
        let repository = repository.clone();
        let reference = task.coord.reference.clone();
        async move { client.get_manifest(&repository, &reference).await }
    })
    .await?;

    let selected_digest = ctx
        .client
        .select_platform(&response.bytes, &response.media_type, &task.platform)?;

    let (manifest_bytes, manifest_media_type, manifest_digest) = if let Some(digest) = selected_digest {
        let inner = retrying(ctx, task_id, || {
            let client = ctx.client.clone();
            let repository = repository.clone();
            let digest = digest.clone();
            async move { client.get_manifest(&repository, &digest).await }
        })
        .await?;
        (inner.bytes, inner.media_type, inner.digest)
    } else {
        (response.bytes, response.media_type, response.digest)
    };

    let concrete = match parse_manifest_body(&manifest_bytes, &manifest_media_type)? {
        ManifestDocument::Concrete(manifest) => manifest,
        ManifestDocument::List(_) => {
            return Err(Error::ProtocolViolation(
                "platform selection yielded another manifest list".into(),
            ))
        }
    };

    let mut blobs: Vec<BlobRecord> = vec![BlobRecord::new(
        concrete.config.digest.clone(),
        "application/vnd.oci.image.config.v1+json".to_string(),
        concrete.config.size,
    )];
    blobs.extend(
        concrete
            .layers
            .iter()
            .map(|l| BlobRecord::new(l.digest.clone(), l.media_type.clone(), l.size)),
    );
    let total_bytes = blobs.iter().map(|b| b.size).sum();

    crate::store::persistence::save_manifest_bytes(&task, &manifest_bytes).await?;

    ctx.store
        .mutate(task_id, |t| {
            t.blobs = blobs;
            t.total_bytes = total_bytes;
            t.state = TaskState::Fetching;
        })
        .await?;
    ctx.progress.register(task_id).await;
    Ok(manifest_digest)
}

/// Fetch every blob not already `Done`, up to `N_blobs` streaming
/// concurrently (spec section 4.4), the per-task `blob_semaphore` gating how
/// many of the spawned futures are actually downloading at once.
async fn fetch_all_blobs(task_id: &str, ctx: &DriveContext) -> Result<()> {
    let task = ctx.store.snapshot(task_id).await?;
    let repository = task.coord.repository.clone();
    let pending: Vec<String> = task
        .blobs
        .iter()
        .filter(|b| !b.is_done())
        .map(|b| b.digest.clone())
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    use futures::stream::StreamExt;
    let fan_out = pending.len();
    let mut results = futures::stream::iter(pending.into_iter().map(|digest| {
        let repository = repository.clone();
        async move {
            if ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let _permit = ctx.blob_semaphore.acquire().await.map_err(|_| Error::Cancelled)?;
            fetch_one_blob(task_id, &repository, &digest, ctx).await?;

            let task = ctx.store.snapshot(task_id).await?;
            let speed_bps = ctx
                .progress
                .report_progress(task_id, task.downloaded_bytes, task.total_bytes)
                .await;
            ctx.store.mutate(task_id, |t| t.speed_bps = speed_bps).await?;
            Ok(())
        }
    }))
    .buffer_unordered(fan_out);

    while let Some(result) = results.next().await {
        result?;
    }
    Ok(())
}

/// Fetch a single blob to `blobs/<safe(digest)>`, resuming from whatever
/// bytes are already on disk, retrying transient failures, and verifying
/// the digest once the stream ends.
async fn fetch_one_blob(task_id: &str, repository: &str, digest: &str, ctx: &DriveContext) -> Result<()> {
    let task = ctx.store.snapshot(task_id).await?;
    let blob_path = task.blob_path(digest);
    if let Some(parent) = blob_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut offset = existing_bytes(&blob_path).await;
    let mut auth_refreshed = false;

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let attempt_result = attempt_fetch(repository, digest, offset, &blob_path, task_id, ctx).await;
        match attempt_result {
            Ok(()) => break,
            Err(e) if e.is_auth() => {
                if auth_refreshed {
                    return Err(e);
                }
                auth_refreshed = true;
                offset = existing_bytes(&blob_path).await;
            }
            Err(e) if e.is_retryable() => {
                let attempt = ctx
                    .store
                    .mutate(task_id, |t| {
                        if let Some(record) = t.blobs.iter_mut().find(|b| b.digest == digest) {
                            record.retries += 1;
                        }
                        t.retries += 1;
                    })
                    .await?
                    .retries;
                if attempt > ctx.max_retries {
                    return Err(e);
                }
                tokio::time::sleep(backoff_for(attempt - 1)).await;
                offset = existing_bytes(&blob_path).await;
            }
            Err(e) => return Err(e),
        }
    }

    crate::digest::require_valid(digest)?;
    let file = tokio::fs::File::open(&blob_path).await?;
    let computed = crate::digest::compute_stream(file).await?;
    if computed != digest {
        // Remove the corrupt file so a later retry restarts this blob from
        // offset 0 instead of resuming from the end of bad content.
        let _ = tokio::fs::remove_file(&blob_path).await;
        ctx.store
            .mutate(task_id, |t| {
                if let Some(record) = t.blobs.iter_mut().find(|b| b.digest == digest) {
                    record.state = BlobState::Missing;
                    record.bytes_written = 0;
                }
                t.recompute_downloaded_bytes();
            })
            .await?;
        return Err(Error::ProtocolViolation(format!(
            "digest mismatch for {digest}: computed {computed}"
        )));
    }
    let written = tokio::fs::metadata(&blob_path).await?.len();

    ctx.store
        .mutate(task_id, |t| {
            if let Some(record) = t.blobs.iter_mut().find(|b| b.digest == digest) {
                record.state = BlobState::Done;
                record.bytes_written = written;
            }
            t.recompute_downloaded_bytes();
        })
        .await?;
    Ok(())
}

async fn attempt_fetch(
    repository: &str,
    digest: &str,
    offset: u64,
    blob_path: &Path,
    task_id: &str,
    ctx: &DriveContext,
) -> Result<()> {
    let blob_stream = ctx.client.stream_blob(repository, digest, offset).await?;
    let mut offset = if blob_stream.resumed { offset } else { 0 };

    let mut file = if blob_stream.resumed {
        tokio::fs::OpenOptions::new().append(true).open(blob_path).await?
    } else {
        tokio::fs::File::create(blob_path).await?
    };

    use futures::StreamExt;
    let mut stream = blob_stream.stream;
    loop {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let next = tokio::time::timeout(BLOB_INACTIVITY_TIMEOUT, stream.next())
            .await
            .map_err(|_| Error::Transport("blob stream stalled: no bytes read in 60s".into()))?;
        let Some(chunk) = next else { break };
        let chunk = chunk.map_err(Error::from)?;
        file.write_all(&chunk).await?;
        offset += chunk.len() as u64;

        let task = ctx
            .store
            .update_progress(task_id, |t| {
                if let Some(record) = t.blobs.iter_mut().find(|b| b.digest == digest) {
                    record.bytes_written = offset;
                    record.state = BlobState::InProgress;
                }
                t.recompute_downloaded_bytes();
            })
            .await?;
        let speed_bps = ctx
            .progress
            .report_progress(task_id, task.downloaded_bytes, task.total_bytes)
            .await;
        ctx.store.update_progress(task_id, |t| t.speed_bps = speed_bps).await?;
    }
    file.flush().await?;
    Ok(())
}

async fn existing_bytes(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

/// Run `f`, retrying transient errors up to `ctx.max_retries` times with
/// exponential backoff. `Auth` gets exactly one immediate retry of its own,
/// outside that budget and backoff schedule, then is fatal.
async fn retrying<T, F, Fut>(ctx: &DriveContext, task_id: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut auth_refreshed = false;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_auth() => {
                if auth_refreshed {
                    return Err(e);
                }
                auth_refreshed = true;
            }
            Err(e) if e.is_retryable() && attempt < ctx.max_retries => {
                tokio::time::sleep(backoff_for(attempt)).await;
                attempt += 1;
                ctx.store
                    .mutate(task_id, |t| t.retries = attempt)
                    .await?;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_clamped() {
        assert_eq!(backoff_for(0), Duration::from_secs(5));
        assert_eq!(backoff_for(1), Duration::from_secs(10));
        assert_eq!(backoff_for(2), Duration::from_secs(20));
        assert_eq!(backoff_for(3), Duration::from_secs(40));
        assert_eq!(backoff_for(4), Duration::from_secs(60));
        assert_eq!(backoff_for(10), Duration::from_secs(60));
    }
}
