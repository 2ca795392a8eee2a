use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use super::models::{BuildStatus, SubmitResponse};
use super::orchestrator::JobOrchestrator;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: JobOrchestrator,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

/// Both fields are optional at the serde level so that a missing or null
/// field is reported as 400 rather than the extractor's 422.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBuildRequest {
    pub project_name: Option<String>,
    pub schema: Option<serde_json::Value>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/build", post(submit_build))
        .route("/api/build/status/{id}", get(get_build_status))
        .route("/api/build/download/{id}", get(download_build))
        .route("/api/builds", get(list_builds))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn parse_build_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("Invalid build id: {}", raw)))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn submit_build(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: SubmitBuildRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {}", e)))?;
    let project_name = req
        .project_name
        .ok_or_else(|| ApiError::BadRequest("projectName is required".to_string()))?;
    let schema = req
        .schema
        .ok_or_else(|| ApiError::BadRequest("schema is required".to_string()))?;

    let id = state.orchestrator.submit(&project_name, schema);
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse::for_job(id))))
}

async fn get_build_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_build_id(&id)?;
    match state.orchestrator.get_status(&id) {
        Some(job) => Ok(Json(job)),
        None => Err(ApiError::NotFound(format!("Build {} not found", id))),
    }
}

async fn list_builds(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.orchestrator.list_jobs())
}

async fn download_build(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_build_id(&id)?;
    let job = state
        .orchestrator
        .get_status(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Build {} not found", id)))?;
    if job.status != BuildStatus::Completed {
        return Err(ApiError::BadRequest(format!(
            "Build {} is not completed (status: {})",
            id, job.status
        )));
    }

    let Some(artifact) = job.artifact_path.as_ref() else {
        tracing::error!(job_id = %id, "completed build has no artifact path");
        return Err(ApiError::NotFound(format!("Artifact for build {} not found", id)));
    };
    let file = match tokio::fs::File::open(artifact).await {
        Ok(file) => file,
        Err(e) => {
            tracing::error!(job_id = %id, artifact = %artifact.display(), error = %e, "artifact missing on disk");
            return Err(ApiError::NotFound(format!("Artifact for build {} not found", id)));
        }
    };

    let disposition = format!("attachment; filename=\"{}\"", job.archive_file_name());
    let body = Body::from_stream(ReaderStream::new(file));
    Response::builder()
        .header(header::CONTENT_TYPE, "application/zip")
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(body)
        .map_err(|e| ApiError::Internal(e.to_string()))
}
