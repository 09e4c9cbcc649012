//! Control API: the HTTP surface of the master. Every endpoint maps onto
//! one [`Master`] call; all non-health routes require the bearer token.

use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::domain::{JobRequest, JobResult, NodeRegistration};
use crate::master::{Master, ResultAck};
use crate::store::StoreError;

#[derive(Clone)]
struct AppState {
    master: Arc<Master>,
    api_key: Option<Arc<str>>,
}

pub fn router(master: Arc<Master>, api_key: Option<String>) -> Router {
    let state = AppState {
        master,
        api_key: api_key.map(Arc::from),
    };

    let protected = Router::new()
        .route("/jobs", post(create_job).get(list_jobs))
        .route("/jobs/next", get(next_job))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/logs", get(job_logs))
        .route("/jobs/{id}/progress", post(report_progress))
        .route("/jobs/{id}/pause", post(pause_job))
        .route("/jobs/{id}/resume", post(resume_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/retry", post(retry_job))
        .route("/nodes/register", post(register_node))
        .route("/nodes", get(list_nodes))
        .route("/nodes/{id}", get(get_node).delete(delete_node))
        .route("/nodes/{id}/heartbeat", post(node_heartbeat))
        .route("/results", post(ingest_result))
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health))
        .merge(protected)
}

/// Exact constant-time token comparison; length differences short-circuit
/// but the byte scan never does.
fn token_matches(provided: &str, expected: &str) -> bool {
    let (a, b) = (provided.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn require_bearer(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(req).await;
    };
    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(token) if token_matches(token, expected) => next.run(req).await,
        _ => ApiError::unauthorized().into_response(),
    }
}

// Error mapping.

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "missing or invalid bearer token".into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::JobNotFound | StoreError::NodeNotFound => StatusCode::NOT_FOUND,
            StoreError::InvalidTransition(_) | StoreError::NodeBusy => StatusCode::BAD_REQUEST,
            // Never reaches the API: `Master::claim_next_job` converts an
            // empty claim to `Ok(None)` before this mapping runs. The arm
            // only exists to keep the match exhaustive.
            StoreError::NoJobAvailable => StatusCode::BAD_REQUEST,
            StoreError::Backend(msg) => {
                warn!(error = %msg, "catalog failure surfaced to the API");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Typed body parsing with a 400 (not a framework rejection) on bad input.
fn parse_body<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| ApiError::bad_request(format!("invalid body: {e}")))
}

// Handlers.

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn create_job(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let req: JobRequest = parse_body(body)?;
    if req.scenario.trim().is_empty() {
        return Err(ApiError::bad_request("scenario is required"));
    }
    let job = state.master.submit_job(req)?;
    Ok((StatusCode::CREATED, Json(job)).into_response())
}

async fn list_jobs(State(state): State<AppState>) -> Result<Response, ApiError> {
    let jobs = state.master.list_jobs()?;
    Ok(Json(json!({ "count": jobs.len(), "jobs": jobs })).into_response())
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    Ok(Json(state.master.resolve_job(&id)?).into_response())
}

async fn job_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let job = state.master.resolve_job(&id)?;
    Ok(job.logs.join("\n").into_response())
}

#[derive(Deserialize)]
struct ProgressBody {
    progress: u8,
}

async fn report_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let body: ProgressBody = parse_body(body)?;
    let job = state.master.report_progress(&id, body.progress)?;
    Ok(Json(job).into_response())
}

async fn pause_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    Ok(Json(state.master.pause_job(&id)?).into_response())
}

async fn resume_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    Ok(Json(state.master.resume_job(&id)?).into_response())
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    Ok(Json(state.master.cancel_job(&id)?).into_response())
}

async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    Ok(Json(state.master.retry_job(&id)?).into_response())
}

#[derive(Deserialize)]
struct NextJobQuery {
    node_id: Option<String>,
}

async fn next_job(
    State(state): State<AppState>,
    Query(query): Query<NextJobQuery>,
) -> Result<Response, ApiError> {
    let node_id = query
        .node_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("node_id query parameter is required"))?;
    let job = state.master.claim_next_job(&node_id)?;
    Ok(Json(json!({ "job": job })).into_response())
}

async fn register_node(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let reg: NodeRegistration = parse_body(body)?;
    if reg.address.trim().is_empty() {
        return Err(ApiError::bad_request("address is required"));
    }
    let registered = state.master.register_node(reg)?;
    let code = if registered.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((code, Json(registered.node)).into_response())
}

async fn list_nodes(State(state): State<AppState>) -> Result<Response, ApiError> {
    let nodes = state.master.list_nodes()?;
    Ok(Json(json!({ "count": nodes.len(), "nodes": nodes })).into_response())
}

async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    Ok(Json(state.master.get_node(&id)?).into_response())
}

async fn delete_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    state.master.remove_node(&id)?;
    Ok(Json(json!({ "status": "removed" })).into_response())
}

async fn node_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    state.master.node_heartbeat(&id)?;
    Ok(Json(json!({ "status": "ok" })).into_response())
}

async fn ingest_result(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let result: JobResult = parse_body(body)?;
    let ack = state.master.ingest_result(result)?;
    let status = match ack {
        ResultAck::Success => "success",
        ResultAck::Retrying => "retrying",
    };
    Ok(Json(json!({ "status": status })).into_response())
}
