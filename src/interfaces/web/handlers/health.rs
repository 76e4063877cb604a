use axum::Json;
use serde_json::json;

pub async fn health_endpoint() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "agent-forge",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
