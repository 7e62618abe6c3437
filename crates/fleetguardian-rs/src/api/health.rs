use axum::{extract::State, Json};
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

pub async fn alive() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "fleetguardian-controller",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Ready means the database answers.
pub async fn ready(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.pool)
        .await
        .map_err(|e| ApiError::unavailable(format!("database not reachable: {e}")))?;
    Ok(Json(json!({"status": "ok"})))
}

pub async fn started(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "started_at": state.started_at.to_rfc3339(),
    }))
}
