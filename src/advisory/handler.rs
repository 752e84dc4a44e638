//! HTTP handlers for the hook API
//!
//! - POST /api/v1/advisory/decide                     run one decision cycle
//! - POST /api/v1/advisory/outcomes                   submit an outcome (async)
//! - POST /api/v1/advisory/prefetch                   queue a prefetch request
//! - POST /api/v1/advisory/invalidate                 purge packets by scope
//! - POST /api/v1/advisory/load                       set the contention flag
//! - GET  /api/v1/advisory/status                     observability snapshot
//! - GET  /api/v1/advisory/sessions/:id/deliveries    delivery history of a session

use crate::advisory::engine::AdvisoryEngine;
use crate::advisory::types::{DecisionContext, OutcomeRecord};
use crate::cache::{EnqueueOutcome, PrefetchRequest};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared state for advisory handlers
#[derive(Clone)]
pub struct AdvisoryState {
    pub engine: Arc<AdvisoryEngine>,
}

/// Create the advisory router
pub fn advisory_router(state: AdvisoryState) -> Router {
    Router::new()
        .route("/api/v1/advisory/decide", post(decide))
        .route("/api/v1/advisory/outcomes", post(submit_outcome))
        .route("/api/v1/advisory/prefetch", post(enqueue_prefetch))
        .route("/api/v1/advisory/invalidate", post(invalidate))
        .route("/api/v1/advisory/load", post(set_load))
        .route("/api/v1/advisory/status", get(status))
        .route(
            "/api/v1/advisory/sessions/:id/deliveries",
            get(session_deliveries),
        )
        .with_state(state)
}

// =============================================================================
// Request / Response types
// =============================================================================

/// API error body
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BAD_REQUEST", message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new("UNAVAILABLE", message)
    }

    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }
}

/// Request body for a decision
#[derive(Debug, Deserialize)]
pub struct DecideRequest {
    pub session_id: String,
    pub tool: String,
    #[serde(flatten)]
    pub context: DecisionContext,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub accepted: bool,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub scope: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateResponse {
    pub scope: String,
    pub removed: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoadRequest {
    pub contended: bool,
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /api/v1/advisory/decide
async fn decide(
    State(state): State<AdvisoryState>,
    Json(request): Json<DecideRequest>,
) -> impl IntoResponse {
    if request.session_id.trim().is_empty() || request.tool.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(
                serde_json::to_value(ApiError::bad_request("session_id and tool are required"))
                    .unwrap_or_default(),
            ),
        );
    }

    let decision = state
        .engine
        .decide(&request.session_id, &request.tool, &request.context)
        .await;
    (
        StatusCode::OK,
        Json(serde_json::to_value(decision).unwrap_or_default()),
    )
}

/// POST /api/v1/advisory/outcomes (queued, never processed inline)
async fn submit_outcome(
    State(state): State<AdvisoryState>,
    Json(record): Json<OutcomeRecord>,
) -> impl IntoResponse {
    if record.trace_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(
                serde_json::to_value(ApiError::bad_request("trace_id is required"))
                    .unwrap_or_default(),
            ),
        );
    }

    match state.engine.record_outcome(record) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(
                serde_json::to_value(AcceptedResponse {
                    accepted: true,
                    status: "queued".to_string(),
                })
                .unwrap_or_default(),
            ),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::to_value(ApiError::unavailable(e.to_string())).unwrap_or_default()),
        ),
    }
}

/// POST /api/v1/advisory/prefetch
async fn enqueue_prefetch(
    State(state): State<AdvisoryState>,
    Json(request): Json<PrefetchRequest>,
) -> impl IntoResponse {
    let status = match state.engine.enqueue_prefetch(request).await {
        EnqueueOutcome::Queued => "queued",
        EnqueueOutcome::Merged => "merged",
        EnqueueOutcome::Dropped(_) => "dropped",
    };
    (
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            accepted: status != "dropped",
            status: status.to_string(),
        }),
    )
}

/// POST /api/v1/advisory/invalidate
async fn invalidate(
    State(state): State<AdvisoryState>,
    Json(request): Json<InvalidateRequest>,
) -> impl IntoResponse {
    let removed = state.engine.invalidate_packets(&request.scope).await;
    Json(InvalidateResponse {
        scope: request.scope,
        removed,
    })
}

/// POST /api/v1/advisory/load
async fn set_load(
    State(state): State<AdvisoryState>,
    Json(request): Json<LoadRequest>,
) -> impl IntoResponse {
    state.engine.set_contended(request.contended);
    Json(request)
}

/// GET /api/v1/advisory/status
async fn status(State(state): State<AdvisoryState>) -> impl IntoResponse {
    Json(state.engine.status().await)
}

/// GET /api/v1/advisory/sessions/:id/deliveries
async fn session_deliveries(
    State(state): State<AdvisoryState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    Json(state.engine.session_deliveries(&id).await)
}
