//! Health check endpoints.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Ready once the store hands out a transaction.
async fn ready(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let txn = state
        .scheduler
        .store()
        .begin()
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    drop(txn);
    Ok(Json(json!({ "status": "ready" })))
}
