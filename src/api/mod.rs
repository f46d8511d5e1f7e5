use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Months, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::RelayError;
use crate::registry::{NewWorker, WorkerRegistry};
use crate::scheduler::{Dispatcher, JobQuery, JobReport, JobStore, SubmitRequest};

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<dyn WorkerRegistry>,
    pub jobs: Arc<dyn JobStore>,
}

#[derive(Serialize)]
struct SubmitJobResponse {
    result: bool,
    job_id: i64,
}

#[derive(Serialize)]
struct ErrorResponse {
    result: bool,
    error: String,
}

#[derive(Deserialize)]
struct WorkerFilter {
    class_id: Option<i64>,
}

#[derive(Deserialize)]
struct RenameWorker {
    host_name: String,
}

/// Maps crate errors onto HTTP statuses
pub struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            e if e.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Rpc(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = %status, error = %self.0, "Request failed");
        } else {
            tracing::debug!(status = %status, error = %self.0, "Request rejected");
        }
        let body = ErrorResponse {
            result: false,
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/api/workers",
            get(list_workers_handler).post(register_worker_handler),
        )
        .route(
            "/api/workers/:id",
            get(get_worker_handler).patch(rename_worker_handler),
        )
        .route("/api/workers/:id/disable", post(disable_worker_handler))
        .route("/api/workers/:id/enable", post(enable_worker_handler))
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/jobs/:id", get(get_job_handler))
        .route("/api/jobs/:id/kill", post(kill_job_handler))
        .route("/api/jobs/:id/report", post(report_job_handler))
        .route("/api/jobs/:id/output", get(job_output_handler))
        .route("/api/stats/daily", get(daily_stats_handler))
        .route("/api/stats/workers", get(worker_stats_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting API server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn list_workers_handler(
    State(state): State<ApiState>,
    Query(filter): Query<WorkerFilter>,
) -> ApiResult<impl IntoResponse> {
    let workers = state.registry.list_workers(filter.class_id).await?;
    Ok(Json(workers))
}

async fn get_worker_handler(
    State(state): State<ApiState>,
    Path(worker_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.registry.get_worker(worker_id).await?))
}

async fn register_worker_handler(
    State(state): State<ApiState>,
    Json(payload): Json<NewWorker>,
) -> ApiResult<impl IntoResponse> {
    if payload.serial.trim().is_empty() {
        return Err(RelayError::InvalidRequest("serial is required".to_string()).into());
    }
    let worker = state.registry.register_worker(payload).await?;
    Ok((StatusCode::CREATED, Json(worker)))
}

async fn rename_worker_handler(
    State(state): State<ApiState>,
    Path(worker_id): Path<i64>,
    Json(payload): Json<RenameWorker>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .registry
            .rename_worker(worker_id, &payload.host_name)
            .await?,
    ))
}

async fn disable_worker_handler(
    State(state): State<ApiState>,
    Path(worker_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.registry.set_disabled(worker_id, true).await?))
}

async fn enable_worker_handler(
    State(state): State<ApiState>,
    Path(worker_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.registry.set_disabled(worker_id, false).await?))
}

async fn list_jobs_handler(
    State(state): State<ApiState>,
    Query(query): Query<JobQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.jobs.list_jobs(&query).await?))
}

async fn get_job_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.jobs.get_job(job_id).await?))
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitRequest>,
) -> ApiResult<impl IntoResponse> {
    let submission = state.dispatcher.submit(payload).await?;
    Ok(Json(SubmitJobResponse {
        result: true,
        job_id: submission.job_id,
    }))
}

async fn kill_job_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.dispatcher.kill(job_id).await?))
}

async fn report_job_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<i64>,
    Json(report): Json<JobReport>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.jobs.apply_report(job_id, report).await?))
}

async fn job_output_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.jobs.job_output(job_id).await?))
}

/// Jobs created per day over the last month, today included.
async fn daily_stats_handler(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let today = Utc::now().date_naive();
    let from = today.checked_sub_months(Months::new(1)).unwrap_or(today);
    Ok(Json(state.jobs.daily_job_counts(from, today).await?))
}

async fn worker_stats_handler(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.jobs.worker_kpis(Utc::now()).await?))
}
