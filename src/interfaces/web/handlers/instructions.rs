use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::json;

use super::super::AppState;
use super::{ApiResponse, fail, internal, not_found, ok};
use crate::core::store::types::InstructionBlock;

#[derive(Deserialize)]
pub struct CreateInstructionRequest {
    name: String,
    #[serde(default)]
    blocks: Vec<InstructionBlock>,
}

pub async fn create_instruction_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<CreateInstructionRequest>,
) -> ApiResponse {
    match state
        .store
        .create_instruction(&payload.name, &payload.blocks)
        .await
    {
        Ok(doc) => (
            StatusCode::CREATED,
            Json(json!({ "success": true, "instruction": doc })),
        ),
        Err(e) => fail(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

pub async fn get_instruction_endpoint(
    Path(instruction_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.store.get_instruction(&instruction_id).await {
        Ok(Some(doc)) => ok(json!({ "success": true, "instruction": doc })),
        Ok(None) => not_found("instruction", &instruction_id),
        Err(e) => internal(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInstructionRequest {
    expected_version: i64,
    blocks: Vec<InstructionBlock>,
}

/// Operator edit with the same optimistic version check the publisher uses.
pub async fn update_instruction_endpoint(
    Path(instruction_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<UpdateInstructionRequest>,
) -> ApiResponse {
    let current = match state.store.get_instruction(&instruction_id).await {
        Ok(Some(doc)) => doc,
        Ok(None) => return not_found("instruction", &instruction_id),
        Err(e) => return internal(e),
    };
    match state
        .store
        .update_instruction(&instruction_id, payload.expected_version, &payload.blocks)
        .await
    {
        Ok(Some(version)) => ok(json!({ "success": true, "version": version })),
        Ok(None) => (
            StatusCode::CONFLICT,
            Json(json!({
                "success": false,
                "error": "instruction version changed",
                "expectedVersion": payload.expected_version,
                "actualVersion": current.version,
            })),
        ),
        Err(e) => internal(e),
    }
}

pub async fn list_versions_endpoint(
    Path(instruction_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.store.get_instruction(&instruction_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("instruction", &instruction_id),
        Err(e) => return internal(e),
    }
    match state.store.list_instruction_versions(&instruction_id).await {
        Ok(versions) => ok(json!({ "success": true, "versions": versions })),
        Err(e) => internal(e),
    }
}
