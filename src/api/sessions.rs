use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::coordinator::CreateSession;
use crate::error::ApiError;
use crate::store::AppState;
use crate::types::{Session, SessionResources, SessionState};
use crate::validation;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// The HTTP layer has already authenticated the caller; `user` is the
/// opaque principal it hands down.
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub user: String,
    pub template: String,
    #[serde(default)]
    pub resources: SessionResources,
    #[serde(default)]
    pub persistent_home: bool,
    pub platform: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsParams {
    pub state: Option<SessionState>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: Uuid,
    pub user_id: String,
    pub template_id: String,
    pub agent_id: Option<String>,
    pub platform: Option<String>,
    pub state: SessionState,
    pub resources: SessionResources,
    pub persistent_home: bool,
    pub platform_metadata: Option<serde_json::Value>,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/{id}", get(get_session).delete(terminate_session))
        .route("/sessions/{id}/hibernate", post(hibernate_session))
        .route("/sessions/{id}/wake", post(wake_session))
        .route("/sessions/{id}/activity", post(record_activity))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[tracing::instrument(skip(state, body), err)]
async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validation::check_length("user", &body.user, 1, 255)?;
    validation::check_length("template", &body.template, 1, 255)?;
    if let Some(ref platform) = body.platform {
        validation::check_name("platform", platform)?;
    }

    let session = state
        .coordinator
        .create(CreateSession {
            user_id: body.user,
            template_id: body.template,
            resources: body.resources,
            persistent_home: body.persistent_home,
            platform: body.platform,
        })
        .await
        .map_err(ApiError::from)?;

    Ok((StatusCode::CREATED, Json(session_to_response(&session))))
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(params): Query<ListSessionsParams>,
) -> Result<Json<Vec<SessionResponse>>, ApiError> {
    let sessions = state
        .coordinator
        .list(params.state)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(sessions.iter().map(session_to_response).collect()))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state.coordinator.get(id).await.map_err(ApiError::from)?;
    Ok(Json(session_to_response(&session)))
}

#[tracing::instrument(skip(state), err)]
async fn terminate_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.coordinator.terminate(id).await.map_err(ApiError::from)?;
    Ok(Json(serde_json::json!({"ok": true})))
}

#[tracing::instrument(skip(state), err)]
async fn hibernate_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.coordinator.hibernate(id).await.map_err(ApiError::from)?;
    Ok(Json(serde_json::json!({"ok": true})))
}

#[tracing::instrument(skip(state), err)]
async fn wake_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.coordinator.wake(id).await.map_err(ApiError::from)?;
    Ok(Json(serde_json::json!({"ok": true})))
}

/// Activity ping for callers that interact outside the framebuffer path.
async fn record_activity(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Confirm the session exists so a typo is a 404, not a silent no-op.
    state.coordinator.get(id).await.map_err(ApiError::from)?;
    state.coordinator.record_activity(id).await;
    Ok(Json(serde_json::json!({"ok": true})))
}

fn session_to_response(session: &Session) -> SessionResponse {
    SessionResponse {
        session_id: session.session_id,
        user_id: session.user_id.clone(),
        template_id: session.template_id.clone(),
        agent_id: session.agent_id.clone(),
        platform: session.platform.clone(),
        state: session.state,
        resources: session.resources.clone(),
        persistent_home: session.persistent_home,
        platform_metadata: session.platform_metadata.clone(),
        last_activity_at: session.last_activity_at,
        created_at: session.created_at,
    }
}
