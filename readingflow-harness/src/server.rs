//! HTTP intake and status endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use readingflow::{
    ArtifactRecord, Coordinator, JobId, JobRequest, JobSnapshot, TaskError, TaskStore,
};

/// Shared state for the HTTP server.
pub struct AppState<S: TaskStore> {
    pub coordinator: Arc<Coordinator<S>>,
}

impl<S: TaskStore + 'static> AppState<S> {
    pub fn new(coordinator: Arc<Coordinator<S>>) -> Arc<Self> {
        Arc::new(Self { coordinator })
    }
}

/// Error returned by a handler, rendered as `{ "error": ... }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        let status = match &err {
            TaskError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TaskError::JobNotFound(_) | TaskError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    #[serde(flatten)]
    pub snapshot: JobSnapshot,
    pub artifacts: Vec<ArtifactRecord>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// Create the router for the job API.
pub fn create_router<S: TaskStore + 'static>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", post(submit_job::<S>))
        .route("/jobs/:id", get(job_status::<S>))
        .route("/jobs/:id/cancel", post(cancel_job::<S>))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn submit_job<S: TaskStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(request): Json<JobRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let job_id = state.coordinator.submit(request).await?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { job_id })))
}

async fn job_status<S: TaskStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<i64>,
) -> Result<Json<JobResponse>, ApiError> {
    let job_id = JobId(id);
    let snapshot = state.coordinator.snapshot(job_id).await?;
    let artifacts = state.coordinator.artifacts(job_id).await?;
    Ok(Json(JobResponse {
        snapshot,
        artifacts,
    }))
}

async fn cancel_job<S: TaskStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<i64>,
) -> Result<Json<CancelResponse>, ApiError> {
    let job_id = JobId(id);
    if state.coordinator.store().job(job_id).await?.is_none() {
        return Err(TaskError::JobNotFound(job_id).into());
    }
    let cancelled = state.coordinator.cancel(job_id).await?;
    Ok(Json(CancelResponse { cancelled }))
}

/// Serve the API on `port` until `shutdown` fires.
pub async fn run_server<S: TaskStore + 'static>(
    state: Arc<AppState<S>>,
    port: u16,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!(port, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
