use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::json;

use super::super::AppState;
use super::{ApiResponse, fail, internal, not_found, ok};

pub async fn list_run_snapshots(
    Path(run_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.store.get_run(&run_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("run", &run_id),
        Err(e) => return internal(e),
    }
    match state.store.list_snapshots(&run_id).await {
        Ok(snapshots) => ok(json!({ "success": true, "snapshots": snapshots })),
        Err(e) => internal(e),
    }
}

pub async fn get_snapshot_endpoint(
    Path(snapshot_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.store.get_snapshot(&snapshot_id).await {
        Ok(Some(snapshot)) => ok(json!({ "success": true, "snapshot": snapshot })),
        Ok(None) => not_found("snapshot", &snapshot_id),
        Err(e) => internal(e),
    }
}

#[derive(Deserialize)]
pub struct UnmaskRequest {
    actor: String,
    reason: Option<String>,
}

/// Decrypts the full payload; every successful call leaves an audit row.
pub async fn unmask_snapshot_endpoint(
    Path(snapshot_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<UnmaskRequest>,
) -> ApiResponse {
    let actor = payload.actor.trim();
    if actor.is_empty() {
        return fail(StatusCode::BAD_REQUEST, "actor is required");
    }
    match state
        .store
        .unmask_snapshot(&snapshot_id, actor, payload.reason.as_deref())
        .await
    {
        Ok(Some(unmasked)) => ok(json!({ "success": true, "snapshotId": snapshot_id, "payload": unmasked })),
        Ok(None) => not_found("snapshot", &snapshot_id),
        Err(e) => internal(e),
    }
}
