//! REST endpoints over the worker pool.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::Message;
use crate::error::PoolError;
use crate::pool::{Job, JobId, JobStatus, WorkerPool};

/// Shared state for the pool routes.
#[derive(Clone)]
pub struct AppState {
    pub pool: WorkerPool,
}

/// Body of `POST /execute`.
#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub messages: Vec<Message>,
}

/// Handle returned by `POST /execute`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Zero-based queue index, `-1` when not queued.
    pub queue_position: i64,
}

/// Job record plus its current queue position.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobView {
    #[serde(flatten)]
    job: Job,
    queue_position: i64,
}

/// Build the router.
pub fn routes(pool: WorkerPool) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/health", get(health))
        .route("/jobs/{id}", get(get_job))
        .layer(CorsLayer::permissive())
        .with_state(AppState { pool })
}

fn position_value(position: Option<usize>) -> i64 {
    position.map(|p| p as i64).unwrap_or(-1)
}

fn error_response(status: StatusCode, reason: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": message.into(),
            "reason": reason,
        })),
    )
        .into_response()
}

fn validate_messages(messages: &[Message]) -> Result<(), String> {
    if messages.is_empty() {
        return Err("messages must not be empty".to_string());
    }
    if let Some(index) = messages.iter().position(|m| m.role.trim().is_empty()) {
        return Err(format!("messages[{index}].role must not be blank"));
    }
    Ok(())
}

// ── Execute ─────────────────────────────────────────────────────────────

/// POST /execute
///
/// Submits a job and returns its handle with 202. A full queue or a
/// terminating pool answers 503 so callers retry later.
async fn execute(
    State(state): State<AppState>,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => {
            debug!(error = %rejection, "Rejecting unreadable execute body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                rejection.body_text(),
            );
        }
    };

    if let Err(message) = validate_messages(&body.messages) {
        debug!(%message, "Rejecting malformed execute request");
        return error_response(StatusCode::BAD_REQUEST, "invalid_request", message);
    }

    match state.pool.submit_with_position(body.messages).await {
        Ok((job, position)) => {
            let queue_position = position_value(position);
            (
                StatusCode::ACCEPTED,
                Json(ExecuteResponse {
                    job_id: job.id,
                    status: job.status,
                    queue_position,
                }),
            )
                .into_response()
        }
        Err(e @ PoolError::QueueFull { .. }) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "queue_full", e.to_string())
        }
        Err(e @ PoolError::ShuttingDown) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "pool_shutdown", e.to_string())
        }
        Err(e) => {
            warn!(error = %e, "Submit failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string())
        }
    }
}

// ── Health ──────────────────────────────────────────────────────────────

/// GET /health
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.pool.stats().await;
    let status = if stats.accepting {
        "ok"
    } else {
        "shutting_down"
    };
    Json(serde_json::json!({
        "status": status,
        "stats": stats,
    }))
}

// ── Jobs ────────────────────────────────────────────────────────────────

/// GET /jobs/{id}
async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid_request", "Invalid job ID");
    };

    match state.pool.get_job_with_position(id).await {
        Ok((job, position)) => {
            let queue_position = position_value(position);
            Json(JobView {
                job,
                queue_position,
            })
            .into_response()
        }
        Err(e) => error_response(StatusCode::NOT_FOUND, "not_found", e.to_string()),
    }
}
