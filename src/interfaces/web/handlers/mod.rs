pub mod agents;
pub mod events;
pub mod health;
pub mod history;
pub mod instructions;
pub mod runs;
pub mod scheduler;
pub mod snapshots;

use axum::{Json, body::Bytes, http::StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::error;

use crate::core::forge::ForgeError;

pub type ApiResponse = (StatusCode, Json<Value>);

pub(super) fn ok(body: Value) -> ApiResponse {
    (StatusCode::OK, Json(body))
}

pub(super) fn fail(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (
        status,
        Json(json!({ "success": false, "error": message.into() })),
    )
}

pub(super) fn not_found(what: &str, id: &str) -> ApiResponse {
    fail(StatusCode::NOT_FOUND, format!("{} {} not found", what, id))
}

pub(super) fn internal(err: anyhow::Error) -> ApiResponse {
    error!("Request failed: {:#}", err);
    fail(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

/// Bodies on action endpoints are optional; an empty body means defaults.
pub(super) fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiResponse> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| fail(StatusCode::BAD_REQUEST, e.to_string()))
}

pub(super) fn forge_error(err: ForgeError) -> ApiResponse {
    match err {
        ForgeError::AgentNotFound(_)
        | ForgeError::RunNotFound(_)
        | ForgeError::CheckpointNotFound { .. } => fail(StatusCode::NOT_FOUND, err.to_string()),
        ForgeError::InvalidRequest(msg) => fail(StatusCode::BAD_REQUEST, msg),
        ForgeError::Cancelled(_) => fail(StatusCode::CONFLICT, err.to_string()),
        ForgeError::Other(e) => internal(e),
    }
}
