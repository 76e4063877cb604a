use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};

use super::AppState;

/// Hex SHA-256 of a raw admin token. Only the digest is kept in memory.
pub(crate) fn token_digest(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

fn is_loopback(host: &str) -> bool {
    host == "127.0.0.1" || host == "::1" || host == "localhost"
}

pub async fn require_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    // No admin token configured → allow open access only on loopback
    let Some(expected) = state.admin_token_hash.as_deref() else {
        if is_loopback(&state.api_host) {
            return next.run(req).await;
        }
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": "No admin token configured. Set FORGE_ADMIN_TOKEN before exposing on a non-loopback address."
            })),
        )
            .into_response();
    };

    let raw_token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "));

    let Some(raw_token) = raw_token else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Missing or invalid Authorization header. Use: Bearer <token>" })),
        )
            .into_response();
    };

    if token_digest(raw_token) == expected {
        next.run(req).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Invalid admin token" })),
        )
            .into_response()
    }
}
