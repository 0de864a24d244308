//! HTTP surface of the always-on server.
//!
//! Producers enqueue and poll jobs here; the web client asks
//! `/jobs-status` whether job-backed features are available.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::control::StatusDebouncer;
use crate::error::OffloadError;
use crate::heartbeat::MachineStatus;
use crate::queue::{Job, JobInput, JobQueue, JobState};

const DEFAULT_LIST_LIMIT: u32 = 100;
const MAX_LIST_LIMIT: u32 = 1_000;

#[derive(Clone)]
pub struct ApiState {
    pub queue: Arc<dyn JobQueue>,
    pub debouncer: StatusDebouncer,
}

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    state: Option<JobState>,
    limit: Option<u32>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Maps crate errors onto HTTP statuses.
struct ApiError(OffloadError);

impl From<OffloadError> for ApiError {
    fn from(e: OffloadError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OffloadError::JobNotFound(_) => StatusCode::NOT_FOUND,
            OffloadError::InvalidState(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs-status", get(jobs_status_handler))
        .route("/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/jobs/{id}", get(get_job_handler))
        .route("/jobs/{id}/resubmit", post(resubmit_job_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "HTTP API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn jobs_status_handler(State(state): State<ApiState>) -> Json<MachineStatus> {
    Json(state.debouncer.check_status().await)
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitJobRequest>,
) -> Result<Json<SubmitJobResponse>, ApiError> {
    let input = JobInput {
        args: payload.args,
        kwargs: payload.kwargs,
    };
    let job_id = state.queue.enqueue(&payload.method, input).await?;
    Ok(Json(SubmitJobResponse { job_id }))
}

async fn list_jobs_handler(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .min(MAX_LIST_LIMIT);
    Ok(Json(state.queue.list(params.state, limit).await?))
}

async fn get_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let job = state
        .queue
        .get(id)
        .await?
        .ok_or(OffloadError::JobNotFound(id))?;
    Ok(Json(job))
}

async fn resubmit_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SubmitJobResponse>, ApiError> {
    let job_id = state.queue.resubmit(id).await?;
    Ok(Json(SubmitJobResponse { job_id }))
}
