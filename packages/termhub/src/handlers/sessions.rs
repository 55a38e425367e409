use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::AppState;
use crate::handlers::error_response;
use crate::registry::{SessionInfo, SessionMode};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub project_id: String,
    #[serde(default = "default_mode")]
    pub mode: SessionMode,
    pub working_dir: Option<String>,
}

fn default_mode() -> SessionMode {
    SessionMode::Shell
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub project_id: String,
    pub mode: SessionMode,
    pub stream_endpoint: String,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, (StatusCode, String)> {
    match state
        .registry
        .create(&req.project_id, req.mode, req.working_dir)
        .await
    {
        Ok(info) => Ok(Json(CreateSessionResponse {
            stream_endpoint: format!("/api/sessions/{}/stream", info.id),
            session_id: info.id,
            project_id: info.project_id,
            mode: info.mode,
        })),
        Err(e) => {
            error!("failed to create session: {}", e);
            Err(error_response(e))
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSessionsQuery {
    pub project_id: Option<String>,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> Json<Vec<SessionInfo>> {
    Json(state.registry.list(query.project_id.as_deref()).await)
}

pub async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.get(&id).await {
        Some(info) => Json(info).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Idempotent: deleting an unknown session still returns 204.
pub async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    state.registry.close(&id).await;
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetFocusRequest {
    pub project_id: String,
    pub session_id: String,
    /// Desired focus membership.
    pub on: bool,
}

pub async fn set_focus(
    State(state): State<AppState>,
    Json(req): Json<SetFocusRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .registry
        .set_focus(&req.project_id, &req.session_id, req.on)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(error_response)
}

pub async fn suspend_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> StatusCode {
    state.registry.suspend_project(&project_id).await;
    StatusCode::NO_CONTENT
}

pub async fn resume_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> StatusCode {
    state.registry.resume_project(&project_id).await;
    StatusCode::NO_CONTENT
}
