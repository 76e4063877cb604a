use axum::{Json, extract::State, http::StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::super::AppState;
use super::{ApiResponse, fail, internal, ok};
use crate::core::store::types::ConversationMessage;

const MAX_IMPORT: usize = 5_000;

#[derive(Deserialize)]
pub struct ImportRequest {
    messages: Vec<ConversationMessage>,
}

/// Feed conversation turns into the store the history reader pages over.
/// Message ids already present are skipped.
pub async fn import_messages_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<ImportRequest>,
) -> ApiResponse {
    if payload.messages.len() > MAX_IMPORT {
        return fail(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("at most {} messages per import", MAX_IMPORT),
        );
    }
    if let Some(bad) = payload
        .messages
        .iter()
        .find(|m| m.message_id.trim().is_empty() || !m.source.contains(':'))
    {
        return fail(
            StatusCode::BAD_REQUEST,
            format!("message '{}' needs an id and a platform:id source", bad.message_id),
        );
    }
    match state.store.insert_messages(&payload.messages).await {
        Ok(inserted) => ok(json!({
            "success": true,
            "received": payload.messages.len(),
            "inserted": inserted,
        })),
        Err(e) => internal(e),
    }
}
