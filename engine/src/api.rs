//! Engine API endpoints
//!
//! Thin HTTP surface over the orchestrator: create conversations, start
//! runs, and read run status. Run progress itself is driven internally by
//! the orchestrator loop; callers poll status.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use shared_types::{
    ApiResponse, ConversationState, CreateConversationRequest, RunStatusResponse,
    StartRunRequest, StartRunResponse,
};

use crate::orchestrator::{EngineError, Orchestrator, StartOutcome};
use crate::store::{StateStore, StoreError};

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn StateStore>,
}

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/conversations", post(create_conversation))
        .route("/api/research/runs", post(start_run))
        .route("/api/research/runs/{conversation_state_id}", get(run_status))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn create_conversation(
    State(state): State<ApiState>,
    Json(request): Json<CreateConversationRequest>,
) -> impl IntoResponse {
    if request.objective.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::<ConversationState>::err("objective is required")),
        );
    }

    let id = request
        .id
        .unwrap_or_else(|| ulid::Ulid::new().to_string());
    let mut conversation = ConversationState::new(id, request.objective);
    if let Some(mode) = request.research_mode {
        conversation.research_mode = mode;
    }
    conversation.uploaded_files = request.uploaded_files;

    match state.store.put(&conversation).await {
        Ok(()) => (StatusCode::CREATED, Json(ApiResponse::ok(conversation))),
        Err(e) => {
            tracing::error!(error = %e, "Failed to create conversation");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::err(e.to_string())),
            )
        }
    }
}

async fn start_run(
    State(state): State<ApiState>,
    Json(request): Json<StartRunRequest>,
) -> impl IntoResponse {
    let conversation_state_id = request.conversation_state_id.clone();
    match state.orchestrator.start_run(request).await {
        Ok(StartOutcome::Started { run }) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse::ok(StartRunResponse::Started {
                conversation_state_id,
                started_at: run.started_at,
            })),
        ),
        Ok(StartOutcome::AlreadyRunning {
            existing: Some(existing),
        }) => (
            StatusCode::CONFLICT,
            Json(ApiResponse::ok(StartRunResponse::AlreadyRunning {
                conversation_state_id,
                existing,
            })),
        ),
        Ok(StartOutcome::AlreadyRunning { existing: None }) => (
            StatusCode::CONFLICT,
            Json(ApiResponse::err(
                "a research run is already starting for this conversation",
            )),
        ),
        Err(e) => error_response(e),
    }
}

async fn run_status(
    State(state): State<ApiState>,
    Path(conversation_state_id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.status_of(&conversation_state_id).await {
        Ok(status) => (StatusCode::OK, Json(ApiResponse::ok(status))),
        Err(e) => error_response::<RunStatusResponse>(e),
    }
}

fn error_response<T>(error: EngineError) -> (StatusCode, Json<ApiResponse<T>>) {
    let status = match &error {
        EngineError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
        EngineError::Ledger(crate::ledger::LedgerError::Store(StoreError::NotFound(_))) => {
            StatusCode::NOT_FOUND
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %error, "API request failed");
    }
    (status, Json(ApiResponse::err(error.to_string())))
}
