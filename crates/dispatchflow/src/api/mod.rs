use std::sync::Arc;

use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use crate::intake::{Intake, IntakeError, IntakeOutcome, ThreadRequest};
use crate::jobs::{JobStatus, JobsRepo, StoreError};
use crate::scripts::ScriptRegistry;

use self::models::{CommentRequest, ErrorBody, JobView, QueueStatus, ResetResponse};

pub mod models;

#[derive(Clone)]
pub struct ApiState {
    pub jobs: JobsRepo,
    pub intake: Intake,
    pub registry: Arc<ScriptRegistry>,
    pub api_token: Option<String>,
}

pub fn router(state: ApiState) -> Router {
    let protected = Router::new()
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/reset", post(reset_job))
        .route("/queue-status", get(queue_status))
        .route("/scripts", get(list_scripts))
        .route("/threads", post(open_thread))
        .route("/threads/:issue/comments", post(post_comment))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .merge(protected)
        .route("/health", get(health))
        .with_state(state)
}

/// Bearer check, only when `DISPATCH_API_TOKEN` is configured.
async fn require_token(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    let Some(expected) = state.api_token.as_deref() else {
        return next.run(req).await;
    };
    let supplied = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if supplied == Some(expected) {
        next.run(req).await
    } else {
        ApiError::new(StatusCode::UNAUTHORIZED, "missing or invalid bearer token").into_response()
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(job_id: Uuid) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("job {job_id} not found"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "api request failed");
        }
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Conflict(_)
            | StoreError::ResetWhileRunning(_)
            | StoreError::DuplicateThread(_) => StatusCode::CONFLICT,
            StoreError::Contended { .. } => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::RunningViaUpdate => StatusCode::BAD_REQUEST,
            StoreError::Model(_) | StoreError::Encode(_) | StoreError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, e.to_string())
    }
}

impl From<IntakeError> for ApiError {
    fn from(e: IntakeError) -> Self {
        match e {
            IntakeError::Store(inner) => inner.into(),
            IntakeError::NoJob(_) => Self::new(StatusCode::NOT_FOUND, e.to_string()),
            IntakeError::NotAwaitingArgument { .. } => Self::new(StatusCode::CONFLICT, e.to_string()),
            IntakeError::UnknownScript { .. } | IntakeError::Conversation(_) => {
                Self::new(StatusCode::BAD_REQUEST, e.to_string())
            }
        }
    }
}

pub async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    let job = state.jobs.get_job(id).await?.ok_or(ApiError::not_found(id))?;
    Ok(Json(JobView::from(&job)))
}

pub async fn reset_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ResetResponse>, ApiError> {
    let job = state.jobs.get_job(id).await?.ok_or(ApiError::not_found(id))?;
    let job_id = state.jobs.reset(id, job.issue().restarted()).await?;
    tracing::info!(job_id = %job_id, "job reset through api");
    Ok(Json(ResetResponse { job_id }))
}

pub async fn queue_status(State(state): State<ApiState>) -> Result<Json<QueueStatus>, ApiError> {
    let mut view = QueueStatus {
        queue_size: state.jobs.count().await?,
        ..QueueStatus::default()
    };
    for status in JobStatus::ALL {
        let ids = state.jobs.ids_by_status(status).await?;
        match status {
            JobStatus::Pending => view.pending = ids,
            JobStatus::Running => view.running = ids,
            JobStatus::Paused => view.paused = ids,
            JobStatus::Finished => view.finished = ids,
            JobStatus::Failed => view.failed = ids,
        }
    }
    Ok(Json(view))
}

pub async fn list_scripts(State(state): State<ApiState>) -> Json<ScriptRegistry> {
    Json(state.registry.as_ref().clone())
}

pub async fn open_thread(
    State(state): State<ApiState>,
    Json(req): Json<ThreadRequest>,
) -> Result<Json<IntakeOutcome>, ApiError> {
    if state.registry.get(&req.script_name).is_none() {
        // still enqueued: the worker reports the unknown script on the thread
        tracing::warn!(script = %req.script_name, issue = req.issue_number, "thread names an unknown script");
    }
    Ok(Json(state.intake.open_thread(&req).await?))
}

pub async fn post_comment(
    State(state): State<ApiState>,
    Path(issue): Path<i64>,
    Json(req): Json<CommentRequest>,
) -> Result<Json<IntakeOutcome>, ApiError> {
    let outcome = state
        .intake
        .comment(issue, &req.author, &req.body, req.fallback.as_ref())
        .await?;
    Ok(Json(outcome))
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
