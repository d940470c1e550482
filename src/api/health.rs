use axum::{response::Json, routing::get, Router};
use serde_json::{json, Value};

use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "mailqueue",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
