//! HTTP adapter: `/run_analysis`, `/call_back`, and `/job_status`.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tracing::warn;

use crate::dispatcher::{CallbackRequest, JobDispatcher, SubmitRequest};
use crate::error::DispatchError;

/// Shared state for dispatcher routes.
#[derive(Clone)]
pub struct DispatcherRouteState {
    pub dispatcher: Arc<JobDispatcher>,
}

/// Build the dispatcher router.
pub fn dispatcher_routes(dispatcher: Arc<JobDispatcher>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/run_analysis", post(run_analysis))
        .route("/call_back", post(call_back))
        .route("/job_status", get(job_status))
        .with_state(DispatcherRouteState { dispatcher })
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// POST /run_analysis
async fn run_analysis(
    State(state): State<DispatcherRouteState>,
    Json(req): Json<SubmitRequest>,
) -> Response {
    match state.dispatcher.submit(req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /call_back
async fn call_back(
    State(state): State<DispatcherRouteState>,
    Json(req): Json<CallbackRequest>,
) -> Response {
    match state.dispatcher.callback(req).await {
        Ok(ack) => Json(ack).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    session_id: String,
    job_id: String,
}

/// GET /job_status?session_id=..&job_id=..
async fn job_status(
    State(state): State<DispatcherRouteState>,
    Query(query): Query<StatusQuery>,
) -> Response {
    match state
        .dispatcher
        .status(&query.session_id, &query.job_id)
        .await
    {
        Ok(record) => Json(record).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(err: DispatchError) -> Response {
    let status = match &err {
        DispatchError::InvalidIdentity { .. } | DispatchError::UnknownAction { .. } => {
            StatusCode::BAD_REQUEST
        }
        DispatchError::RecordNotFound { .. } => StatusCode::NOT_FOUND,
        DispatchError::NotificationDeliveryFailed(_) | DispatchError::StoreIo(_) => {
            warn!(error = %err, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(serde_json::json!({"error": err.to_string()}))).into_response()
}
