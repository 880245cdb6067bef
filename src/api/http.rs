//! The HTTP control surface (spec section 6): health, task CRUD and verbs,
//! and the manifest-based image size probe.

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::Router;
use axum::Json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::dto::{
    human_size, CreateDownloadRequest, Envelope, HealthResponse, ImageSizeQuery, ImageSizeResponse,
    TaskDto,
};
use crate::api::state::AppState;
use crate::api::ws;
use crate::config::parse_platform;
use crate::coord::{ImageCoordinate, Platform, Source};
use crate::error::{Error, Result};
use crate::store::task::TaskState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/downloads", post(create_download).get(list_downloads))
        .route("/api/downloads/{id}", get(inspect_download).delete(delete_download))
        .route("/api/downloads/{id}/pause", post(pause_download))
        .route("/api/downloads/{id}/resume", post(resume_download))
        .route("/api/downloads/{id}/cancel", post(cancel_download))
        .route("/api/downloads/{id}/retry", post(retry_download))
        .route("/api/images/size", get(image_size))
        .route("/ws", get(ws::upgrade))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Envelope<HealthResponse>> {
    Json(Envelope::ok(HealthResponse {
        status: "ok",
        timestamp: chrono::Utc::now(),
        uptime: state.uptime_secs(),
    }))
}

fn resolve_source(name: Option<&str>) -> Source {
    Source::parse(name.unwrap_or("dockerhub"))
}

async fn create_download(
    State(state): State<AppState>,
    Json(body): Json<CreateDownloadRequest>,
) -> Result<Json<Envelope<TaskDto>>> {
    let source = resolve_source(body.source.as_deref());
    let reference = body.tag.as_deref().unwrap_or("latest");
    let coord = ImageCoordinate::new(source, &body.image_name, reference)?;

    let platform = match &body.platform {
        Some(p) => {
            let (os, architecture, variant) = parse_platform(p)?;
            Platform { os, architecture, variant }
        }
        None => Platform::default(),
    };

    if let Some(target_path) = &body.target_path {
        // spec section 6's persisted-state layout fixes every task to
        // `<downloads_root>/tasks/<id>/...` so restart recovery can scan
        // one directory; a caller-chosen path would break that scan.
        tracing::warn!(%target_path, "ignoring targetPath: tasks are always rooted under the downloads root");
    }

    let id = state.scheduler.submit(coord, platform).await?;
    let task = state.scheduler.store().snapshot(&id).await?;
    Ok(Json(Envelope::ok(task.into())))
}

async fn list_downloads(State(state): State<AppState>) -> Json<Envelope<Vec<TaskDto>>> {
    let tasks = state.scheduler.store().list().await;
    Json(Envelope::ok(tasks.into_iter().map(TaskDto::from).collect()))
}

async fn inspect_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<TaskDto>>> {
    let task = state.scheduler.store().snapshot(&id).await?;
    Ok(Json(Envelope::ok(task.into())))
}

async fn pause_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<TaskDto>>> {
    let task = state.scheduler.store().snapshot(&id).await?;
    if task.state != TaskState::Fetching && task.state != TaskState::Resolving {
        return Err(Error::InvalidState(format!("task {id} is not fetching")));
    }
    state.scheduler.pause(&id).await?;
    let task = state.scheduler.store().snapshot(&id).await?;
    Ok(Json(Envelope::ok(task.into())))
}

async fn resume_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<TaskDto>>> {
    let task = state.scheduler.store().snapshot(&id).await?;
    if task.state != TaskState::Paused {
        return Err(Error::InvalidState(format!("task {id} is not paused")));
    }
    state.scheduler.resume(&id).await?;
    let task = state.scheduler.store().snapshot(&id).await?;
    Ok(Json(Envelope::ok(task.into())))
}

async fn cancel_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<TaskDto>>> {
    let task = state.scheduler.store().snapshot(&id).await?;
    if task.state == TaskState::Completed {
        return Err(Error::InvalidState(format!("task {id} is already completed")));
    }
    state.scheduler.cancel(&id).await?;
    let task = state.scheduler.store().snapshot(&id).await?;
    Ok(Json(Envelope::ok(task.into())))
}

async fn retry_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<TaskDto>>> {
    state.scheduler.retry(&id).await?;
    let task = state.scheduler.store().snapshot(&id).await?;
    Ok(Json(Envelope::ok(task.into())))
}

async fn delete_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<()>>> {
    let task = state.scheduler.store().snapshot(&id).await?;
    if task.state == TaskState::Fetching || task.state == TaskState::Resolving {
        return Err(Error::InvalidState(format!("task {id} is still fetching")));
    }
    state.scheduler.remove(&id).await?;
    Ok(Json(Envelope::ok(())))
}

/// `GET /api/images/size`: resolve the manifest for `(source, name, tag)`
/// and sum `config.size + Σ layers[i].size` without downloading anything.
async fn image_size(
    State(state): State<AppState>,
    Query(query): Query<ImageSizeQuery>,
) -> Result<Json<Envelope<ImageSizeResponse>>> {
    let source = resolve_source(query.source.as_deref());
    let reference = query.tag.as_deref().unwrap_or("latest");
    let coord = ImageCoordinate::new(source, &query.name, reference)?;

    let client = state.probe_client(&coord.source)?;
    let response = client.get_manifest(&coord.repository, &coord.reference).await?;
    let document = crate::registry::manifest::parse_manifest_body(&response.bytes, &response.media_type)?;

    let concrete = match document {
        crate::registry::manifest::ManifestDocument::Concrete(m) => m,
        crate::registry::manifest::ManifestDocument::List(entries) => {
            let digest = crate::registry::manifest::select_platform(&entries, &Platform::default())?;
            let inner = client.get_manifest(&coord.repository, &digest).await?;
            match crate::registry::manifest::parse_manifest_body(&inner.bytes, &inner.media_type)? {
                crate::registry::manifest::ManifestDocument::Concrete(m) => m,
                crate::registry::manifest::ManifestDocument::List(_) => {
                    return Err(Error::ProtocolViolation("nested manifest list".into()))
                }
            }
        }
    };

    let size_bytes = concrete.config.size + concrete.layers.iter().map(|l| l.size).sum::<u64>();
    Ok(Json(Envelope::ok(ImageSizeResponse { size_bytes, size: human_size(size_bytes) })))
}
