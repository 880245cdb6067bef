//! The duplex event channel (spec section 6): a WebSocket that replays
//! [`ProgressEvent`]s from the [`crate::engine::ProgressBus`] to subscribers.
//!
//! A connection joins the global topic by default, or a single task's topic
//! `download:<id>` when `?taskId=<id>` is given. Delivery is best-effort: a
//! subscriber that falls behind the broadcast channel's capacity misses the
//! oldest buffered progress events (never a terminal one, since those are
//! always sent immediately after a forced unthrottled update).

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::api::state::AppState;
use crate::engine::progress::ProgressEvent;

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    #[serde(rename = "taskId")]
    task_id: Option<String>,
}

pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<SubscribeQuery>,
) -> Response {
    ws.on_upgrade(move |socket| run(socket, state, query.task_id))
}

async fn run(mut socket: WebSocket, state: AppState, task_id: Option<String>) {
    let mut receiver = match &task_id {
        Some(id) => match state.scheduler.progress().subscribe_task(id).await {
            Some(rx) => rx,
            None => {
                let _ = socket
                    .send(Message::Text(
                        serde_json::json!({"event": "error", "message": format!("unknown task {id}")})
                            .to_string()
                            .into(),
                    ))
                    .await;
                return;
            }
        },
        None => state.scheduler.progress().subscribe_global(),
    };

    loop {
        tokio::select! {
            event = receiver.recv() => {
                match event {
                    Ok(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &ProgressEvent) -> Result<(), axum::Error> {
    let body = serde_json::to_string(event).unwrap_or_default();
    socket.send(Message::Text(body.into())).await
}
