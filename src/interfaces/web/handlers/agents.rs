use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
};
use serde_json::json;

use super::super::AppState;
use super::{ApiResponse, fail, internal, not_found, ok, optional_body};
use crate::core::forge::types::AgentMode;
use crate::core::store::types::AgentProfileInput;

pub async fn get_agents(State(state): State<AppState>) -> ApiResponse {
    match state.store.list_agents().await {
        Ok(agents) => ok(json!({ "success": true, "agents": agents })),
        Err(e) => internal(e),
    }
}

pub async fn create_agent_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<AgentProfileInput>,
) -> ApiResponse {
    // Store-level validation failures (missing name, malformed sources) are caller errors.
    match state.store.create_agent(&payload).await {
        Ok(agent) => (
            StatusCode::CREATED,
            Json(json!({ "success": true, "agent": agent })),
        ),
        Err(e) => fail(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

pub async fn get_agent_endpoint(
    Path(agent): Path<String>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.store.get_agent(&agent).await {
        Ok(Some(profile)) => ok(json!({ "success": true, "agent": profile })),
        Ok(None) => not_found("agent", &agent),
        Err(e) => internal(e),
    }
}

pub async fn update_agent_endpoint(
    Path(agent): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<AgentProfileInput>,
) -> ApiResponse {
    match state.store.update_agent(&agent, &payload).await {
        Ok(Some(profile)) => ok(json!({ "success": true, "agent": profile })),
        Ok(None) => not_found("agent", &agent),
        Err(e) => fail(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

#[derive(serde::Deserialize, Default)]
pub struct SetModeRequest {
    mode: Option<AgentMode>,
}

/// Sets the operating mode, or flips it when the body names none.
pub async fn set_mode_endpoint(
    Path(agent): Path<String>,
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResponse {
    let requested = match optional_body::<SetModeRequest>(&body) {
        Ok(req) => req.mode,
        Err(resp) => return resp,
    };
    let current = match state.store.get_agent(&agent).await {
        Ok(Some(profile)) => profile.mode,
        Ok(None) => return not_found("agent", &agent),
        Err(e) => return internal(e),
    };
    let mode = requested.unwrap_or(match current {
        AgentMode::HumanOnly => AgentMode::AiLiveReply,
        AgentMode::AiLiveReply => AgentMode::HumanOnly,
    });

    match state.store.set_agent_mode(&agent, mode).await {
        Ok(true) => ok(json!({ "success": true, "mode": mode })),
        Ok(false) => not_found("agent", &agent),
        Err(e) => internal(e),
    }
}
