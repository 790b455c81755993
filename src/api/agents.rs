use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::store::AppState;
use crate::types::{AgentCapacity, AgentStatus};
use crate::validation;

/// Credential presented by the agent: its own key, or the bootstrap key for
/// first-time registration.
const KEY_HEADER: &str = "x-holodeck-key";
const AGENT_ID_HEADER: &str = "x-agent-id";

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RegisterAgentRequest {
    pub agent_id: String,
    pub platform: String,
    #[serde(default)]
    pub region: String,
    pub capacity: AgentCapacity,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct RegisterAgentResponse {
    /// Present only on first registration; never recoverable afterwards.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AgentResponse {
    pub agent_id: String,
    pub platform: String,
    pub region: String,
    pub capacity: AgentCapacity,
    pub status: AgentStatus,
    pub connected: bool,
    /// Derived count of non-terminal sessions assigned to the agent.
    pub current_sessions: i64,
    /// Count the agent last reported in a heartbeat, when connected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported_sessions: Option<i64>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/agents", get(list_agents))
        .route("/agents/register", post(register_agent))
        .route("/agents/connect", get(connect_agent))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[tracing::instrument(skip(state, headers, body), fields(agent_id = %body.agent_id), err)]
async fn register_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RegisterAgentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validation::check_name("agent_id", &body.agent_id)?;
    validation::check_length("platform", &body.platform, 1, 64)?;
    validation::check_length("region", &body.region, 0, 128)?;

    let presented = header_str(&headers, KEY_HEADER);
    let verdict = state.tokens.verify(&body.agent_id, presented).await;

    let registration = state
        .registry
        .register(
            &body.agent_id,
            &body.platform,
            &body.region,
            &body.capacity,
            &body.metadata,
            verdict,
        )
        .await
        .map_err(ApiError::from)?;

    let status = if registration.api_key.is_some() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(RegisterAgentResponse {
            api_key: registration.api_key,
        }),
    ))
}

async fn list_agents(
    State(state): State<AppState>,
) -> Result<Json<Vec<AgentResponse>>, ApiError> {
    let agents = state.registry.list().await.map_err(ApiError::from)?;
    let items = agents
        .into_iter()
        .map(|c| AgentResponse {
            connected: state.hub.is_connected(&c.agent.agent_id),
            reported_sessions: state.hub.reported_sessions(&c.agent.agent_id),
            current_sessions: c.current_sessions,
            agent_id: c.agent.agent_id,
            platform: c.agent.platform,
            region: c.agent.region,
            capacity: c.agent.capacity,
            status: c.agent.status,
            last_heartbeat_at: c.agent.last_heartbeat_at,
        })
        .collect();
    Ok(Json(items))
}

/// Persistent-connection upgrade. The credential verdict is computed from
/// the headers before upgrading; admission and binding happen on the
/// upgraded socket so the agent sees a proper close code.
async fn connect_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let Some(agent_id) = header_str(&headers, AGENT_ID_HEADER).map(str::to_owned) else {
        return Err(ApiError::BadRequest(format!("missing {AGENT_ID_HEADER} header")));
    };
    let presented = header_str(&headers, KEY_HEADER);
    let verdict = state.tokens.verify(&agent_id, presented).await;

    let hub = state.hub.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        hub.serve_connection(agent_id, verdict, socket).await;
    }))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
