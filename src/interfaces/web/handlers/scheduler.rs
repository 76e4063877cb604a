use axum::{body::Bytes, extract::State};
use serde::Deserialize;
use serde_json::json;

use super::super::AppState;
use super::{ApiResponse, forge_error, ok, optional_body};

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProcessNowRequest {
    agent_id: Option<String>,
    requested_by: Option<String>,
}

/// Start runs immediately, ignoring cadence and the daily date guard.
pub async fn process_now_endpoint(State(state): State<AppState>, body: Bytes) -> ApiResponse {
    let req = match optional_body::<ProcessNowRequest>(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let actor = req.requested_by.unwrap_or_else(|| "admin".to_string());
    match state
        .scheduler
        .process_now(req.agent_id.as_deref(), &actor)
        .await
    {
        Ok(report) => ok(json!({ "success": true, "report": report })),
        Err(e) => forge_error(e),
    }
}
