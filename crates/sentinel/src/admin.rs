//! Read-only admin surface.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::scheduler::Scheduler;
use crate::storage::{Store, TaskCounts};

/// State behind the admin routes.
pub struct AdminState {
    pub store: Arc<dyn Store>,
    pub scheduler: Arc<Scheduler>,
}

/// Build the admin router. No mutating routes.
pub fn build_router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/v1/status", get(status_handler))
        .route("/api/v1/reports/{id}", get(report_handler))
        .with_state(state)
}

async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    queue_depth: usize,
    running: usize,
    tasks: TaskCounts,
}

async fn status_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let tasks = state
        .store
        .count_tasks_by_status()
        .await
        .unwrap_or_default();
    Json(StatusResponse {
        status: "ok",
        queue_depth: state.scheduler.queue_depth(),
        running: state.scheduler.running_count(),
        tasks,
    })
}

async fn report_handler(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_report(&id).await {
        Ok(Some(report)) => (StatusCode::OK, Json(serde_json::json!(report))).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "report not found"})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}
