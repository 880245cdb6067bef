//! End-to-end checks of the HTTP control surface against a router built the
//! same way `main.rs` builds it, minus any real registry traffic.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use fetchd::api::http::build_router;
use fetchd::api::state::AppState;
use fetchd::engine::{ProgressBus, Scheduler};
use fetchd::store::TaskStore;
use fetchd::EngineConfig;

async fn test_state() -> AppState {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::from_env();
    config.downloads_root = tmp.path().to_path_buf();
    std::mem::forget(tmp); // keep the directory alive for the router's lifetime

    let store = Arc::new(TaskStore::new(config.downloads_root.clone()));
    let progress = Arc::new(ProgressBus::new());
    let scheduler = Arc::new(Scheduler::new(store, progress, config.clone()));
    AppState::new(scheduler, Arc::new(config))
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let app = build_router(test_state().await);

    let response = app
        .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["data"]["status"], "ok");
}

#[tokio::test]
async fn create_download_rejects_empty_image_name() {
    let app = build_router(test_state().await);

    let request = Request::builder()
        .method("POST")
        .uri("/api/downloads")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"imageName":""}"#))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn inspect_unknown_task_is_not_found() {
    let app = build_router(test_state().await);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/downloads/does-not-exist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_downloads_starts_empty() {
    let app = build_router(test_state().await);

    let response = app
        .oneshot(Request::builder().uri("/api/downloads").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["data"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn pause_on_unknown_task_is_not_found() {
    let app = build_router(test_state().await);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/downloads/does-not-exist/pause")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
