//! Admin endpoint for scheduled maintenance tasks.
//!
//! An external scheduler hits `/api/v1/tasks/{task}` (GET or POST) with the
//! admin bearer secret; a `nonce` query parameter, when present, is consumed
//! through the shared store so a captured invocation cannot be replayed. The
//! lock decides whether this instance runs the task; a skip is a 202 with
//! the holder's remaining TTL so the scheduler can back off.

use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::AppState;
use crate::lock::JobOutcome;
use crate::worker::{Task, WorkerError};

/// How long a consumed admin nonce blocks reuse.
const ADMIN_NONCE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Default, Deserialize)]
pub struct TaskQuery {
    /// Bypass the scheduler lock. Operator override only.
    #[serde(default)]
    pub force: bool,
    /// Return 202 immediately and run the task in the background.
    #[serde(default)]
    pub background: bool,
    /// One-shot request nonce; a reuse within the TTL is rejected.
    #[serde(default)]
    pub nonce: Option<String>,
}

pub async fn task_handler(
    State(state): State<AppState>,
    Path(task): Path<String>,
    Query(query): Query<TaskQuery>,
    headers: HeaderMap,
) -> Response {
    if !super::authorized(&headers, state.admin_secrets()) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response();
    }

    let Some(task) = Task::parse(&task) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("unknown task: {task}")})),
        )
            .into_response();
    };

    if let Some(nonce) = query.nonce.as_deref() {
        let key = format!("admin:nonce:{nonce}");
        match state
            .pipeline()
            .store()
            .set_if_absent(&key, "1", ADMIN_NONCE_TTL)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(task = %task, "admin nonce replayed");
                return (
                    StatusCode::FORBIDDEN,
                    Json(json!({"error": "nonce replayed"})),
                )
                    .into_response();
            }
            Err(err) => {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({"error": err.to_string()})),
                )
                    .into_response();
            }
        }
    }

    let request_id = Uuid::new_v4().to_string();

    if query.background {
        let state = state.clone();
        let background_id = request_id.clone();
        tokio::spawn(async move {
            match state.runner().run(task, query.force).await {
                Ok(JobOutcome::Completed(report)) => {
                    info!(request_id = %background_id, task = %task, ?report, "background task finished");
                }
                Ok(JobOutcome::Skipped { .. }) => {
                    info!(request_id = %background_id, task = %task, "background task skipped");
                }
                Err(err) => {
                    error!(request_id = %background_id, task = %task, error = %err, "background task failed");
                }
            }
        });
        return (
            StatusCode::ACCEPTED,
            Json(json!({
                "requestId": request_id,
                "task": task.as_str(),
                "status": "accepted",
            })),
        )
            .into_response();
    }

    let started = Instant::now();
    let outcome = state.runner().run(task, query.force).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(JobOutcome::Completed(report)) => (
            StatusCode::OK,
            Json(json!({
                "requestId": request_id,
                "task": task.as_str(),
                "durationMs": duration_ms,
                "result": report,
            })),
        )
            .into_response(),
        Ok(JobOutcome::Skipped { remaining }) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "requestId": request_id,
                "task": task.as_str(),
                "durationMs": duration_ms,
                "reason": "lock_held",
                "retryAfterMs": remaining.as_millis() as u64,
            })),
        )
            .into_response(),
        Err(err @ WorkerError::Lock(_)) => {
            warn!(request_id = %request_id, task = %task, error = %err, "lock backend unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "requestId": request_id,
                    "task": task.as_str(),
                    "error": err.to_string(),
                })),
            )
                .into_response()
        }
        Err(err) => {
            error!(request_id = %request_id, task = %task, error = %err, "task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "requestId": request_id,
                    "task": task.as_str(),
                    "error": err.to_string(),
                })),
            )
                .into_response()
        }
    }
}
