use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use super::AppJson;
use crate::error::{ApiError, ApiResult};
use crate::models::{CreateScanRequest, CreateScanResponse, ResultsPage, ScanStatusView};
use crate::scans;
use crate::validation::{parse_result_range, ResultRange, RECOGNIZED_SCANNER_PREFERENCES};
use crate::AppState;

pub async fn create_scan(
    State(state): State<AppState>,
    AppJson(req): AppJson<CreateScanRequest>,
) -> ApiResult<(StatusCode, Json<CreateScanResponse>)> {
    let response = scans::create_scan(&state.pool, &req, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

#[derive(Debug, Deserialize)]
pub struct ScanActionRequest {
    pub action: String,
}

/// `start` is idempotent (jobs are queued at creation); `stop` cancels.
pub async fn scan_action(
    State(state): State<AppState>,
    Path(scan_id): Path<String>,
    AppJson(req): AppJson<ScanActionRequest>,
) -> ApiResult<Json<ScanStatusView>> {
    match req.action.as_str() {
        "start" => Ok(Json(scans::status_view(&state.pool, &scan_id).await?)),
        "stop" => Ok(Json(
            scans::cancel_scan(&state.pool, &scan_id, Utc::now()).await?,
        )),
        other => Err(ApiError::invalid_request(format!("unknown action: {other}"))
            .with_field("action", "must be 'start' or 'stop'")),
    }
}

pub async fn scan_status(
    State(state): State<AppState>,
    Path(scan_id): Path<String>,
) -> ApiResult<Json<ScanStatusView>> {
    Ok(Json(scans::status_view(&state.pool, &scan_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    pub range: Option<String>,
}

pub async fn scan_results(
    State(state): State<AppState>,
    Path(scan_id): Path<String>,
    Query(query): Query<ResultsQuery>,
) -> ApiResult<Json<ResultsPage>> {
    let range = match query.range.as_deref() {
        None => ResultRange {
            start: 0,
            limit: 100,
        },
        Some(raw) => parse_result_range(raw).ok_or_else(|| {
            ApiError::invalid_request("invalid range parameter")
                .with_field("range", "must be 'start-end' with start >= 0 and end >= start")
        })?,
    };
    Ok(Json(scans::results_page(&state.pool, &scan_id, range).await?))
}

pub async fn delete_scan(
    State(state): State<AppState>,
    Path(scan_id): Path<String>,
) -> ApiResult<StatusCode> {
    scans::delete_scan(&state.pool, &scan_id, Utc::now()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// The enumerated scanner-preference catalog. Scan requests naming anything
/// outside this list are rejected.
pub async fn preferences() -> Json<serde_json::Value> {
    let catalog: Vec<_> = RECOGNIZED_SCANNER_PREFERENCES
        .iter()
        .map(|id| json!({"id": id}))
        .collect();
    Json(json!({ "preferences": catalog }))
}
