use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use super::AppJson;
use crate::agent_config;
use crate::auth::required_agent_id;
use crate::error::{ApiError, ApiResult};
use crate::ingest;
use crate::jobs;
use crate::models::{FinalizeRequest, HeartbeatRequest, HeartbeatResponse, ResultBatch};
use crate::registry;
use crate::AppState;

pub async fn heartbeat(
    State(state): State<AppState>,
    AppJson(req): AppJson<HeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    Ok(Json(registry::heartbeat(&state.pool, &req, Utc::now()).await?))
}

/// Merged config snapshot for the calling agent. Fetching it records the
/// version as seen, which clears `config_updated` on subsequent heartbeats.
pub async fn get_config(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let agent_id = required_agent_id(&headers)?;
    let agent = registry::get_agent(&state.pool, &agent_id)
        .await?
        .filter(|a| !a.is_tombstoned())
        .ok_or_else(|| ApiError::not_found(format!("agent not found: {agent_id}")))?;

    let (version, config) = agent_config::merged_for_agent(&state.pool, &agent).await?;
    registry::record_config_seen(&state.pool, &agent_id, version).await?;
    Ok(Json(json!({"version": version, "config": config})))
}

#[derive(Debug, Default, Deserialize)]
pub struct JobsQuery {
    pub limit: Option<i64>,
}

/// Job poll: atomically claims up to `limit` queued jobs for the caller.
/// Unauthorized agents always receive an empty list.
pub async fn poll_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<JobsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let agent_id = required_agent_id(&headers)?;
    let agent = registry::get_agent(&state.pool, &agent_id)
        .await?
        .filter(|a| !a.is_tombstoned())
        .ok_or_else(|| {
            ApiError::not_found(format!("agent not found: {agent_id}"))
                .with_field("X-Agent-ID", "agent must send a heartbeat to register first")
        })?;

    let (_, merged) = agent_config::merged_for_agent(&state.pool, &agent).await?;
    let limit = query
        .limit
        .unwrap_or(state.config.claim_batch_limit)
        .clamp(1, 100);
    let claimed = jobs::claim_jobs(
        &state.pool,
        &agent,
        merged.visibility_timeout_secs(),
        limit,
        Utc::now(),
    )
    .await?;
    Ok(Json(json!({ "jobs": claimed })))
}

pub async fn submit_results(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    AppJson(batch): AppJson<ResultBatch>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    // Lease extension length follows the submitting agent's config when the
    // agent still exists; the ingestor re-checks existence either way.
    let visibility = match registry::get_agent(&state.pool, &batch.agent_id).await? {
        Some(agent) if !agent.is_tombstoned() => {
            let (_, merged) = agent_config::merged_for_agent(&state.pool, &agent).await?;
            merged.visibility_timeout_secs()
        }
        _ => agent_config::current(&state.pool).await?.1.visibility_timeout_secs(),
    };

    let received =
        ingest::submit_results(&state.pool, &job_id, &batch, visibility, Utc::now()).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"status": "accepted", "results_received": received})),
    ))
}

pub async fn complete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
    AppJson(req): AppJson<FinalizeRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let agent_id = required_agent_id(&headers)?;
    let final_state = ingest::finalize(&state.pool, &job_id, &agent_id, &req, Utc::now()).await?;
    Ok(Json(json!({"status": final_state.as_str()})))
}

/// Whether the fleet manager has flagged this agent for an update.
pub async fn updates(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let agent_id = required_agent_id(&headers)?;
    let agent = registry::get_agent(&state.pool, &agent_id)
        .await?
        .filter(|a| !a.is_tombstoned())
        .ok_or_else(|| ApiError::not_found(format!("agent not found: {agent_id}")))?;
    Ok(Json(json!({
        "agent_id": agent.agent_id,
        "update_to_latest": agent.update_to_latest,
    })))
}
