//! Health check endpoints, grounded on `buildit-api/src/routes/health.rs`.

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn ready(axum::extract::State(state): axum::extract::State<AppState>) -> Json<Value> {
    match state.storage.list_jobs(Default::default()).await {
        Ok(_) => Json(json!({ "status": "ready" })),
        Err(_) => Json(json!({ "status": "not_ready" })),
    }
}
