use std::collections::BTreeMap;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use super::AppJson;
use crate::agent_config;
use crate::error::{ApiError, ApiResult};
use crate::models::{
    AgentPatch, DeleteAgentsRequest, DeleteAgentsResponse, LivenessState, PatchError, PatchOutcome,
};
use crate::registry::{self, AgentListFilter};
use crate::validation::parse_agent_uuid;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct AgentListQuery {
    pub liveness: Option<String>,
    pub authorized: Option<bool>,
    pub hostname_prefix: Option<String>,
    pub updates: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_agents(
    State(state): State<AppState>,
    Query(query): Query<AgentListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let liveness = query
        .liveness
        .as_deref()
        .map(|raw| {
            raw.parse::<LivenessState>().map_err(|_| {
                ApiError::invalid_request("invalid liveness filter").with_field(
                    "liveness",
                    "must be one of pending, online, offline, inactive, tombstoned",
                )
            })
        })
        .transpose()?;

    let filter = AgentListFilter {
        liveness,
        authorized: query.authorized,
        hostname_prefix: query.hostname_prefix,
        updates_only: query.updates.unwrap_or(false),
        limit: query.limit.unwrap_or(100),
        offset: query.offset.unwrap_or(0),
    };
    let agents = registry::list_agents(&state.pool, &filter).await?;
    Ok(Json(json!({
        "count": agents.len(),
        "agents": agents,
    })))
}

/// Bulk partial update in the upstream manager's wire format: a map from
/// agent ID to the patch for that agent. Applies what it can and reports
/// per-agent failures with a 207.
pub async fn patch_agents(
    State(state): State<AppState>,
    AppJson(patches): AppJson<BTreeMap<String, AgentPatch>>,
) -> ApiResult<Response> {
    if patches.is_empty() {
        return Err(ApiError::invalid_request("empty patch set")
            .with_field("body", "must map at least one agent_id to an update"));
    }

    let now = Utc::now();
    let mut errors = Vec::new();
    for (agent_id, patch) in &patches {
        if parse_agent_uuid(agent_id).is_none() {
            errors.push(PatchError {
                agent_id: agent_id.clone(),
                error: "not a valid UUID".to_string(),
            });
            continue;
        }
        if let Err(e) = registry::apply_patch(&state.pool, agent_id, patch, now).await {
            errors.push(PatchError {
                agent_id: agent_id.clone(),
                error: e.message.clone(),
            });
        }
    }

    let outcome = PatchOutcome {
        success: errors.is_empty(),
        errors,
    };
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    };
    Ok((status, Json(outcome)).into_response())
}

/// Bulk soft delete. Agents keep their row until the next contact so the
/// terminal `deregistered` signal can be delivered.
pub async fn delete_agents(
    State(state): State<AppState>,
    AppJson(req): AppJson<DeleteAgentsRequest>,
) -> ApiResult<Json<DeleteAgentsResponse>> {
    if req.agent_ids.is_empty() {
        return Err(ApiError::invalid_request("missing required field")
            .with_field("agent_ids", "must be a non-empty array"));
    }

    let now = Utc::now();
    let mut deleted = 0i64;
    for agent_id in &req.agent_ids {
        if registry::soft_delete(&state.pool, agent_id, now).await? {
            deleted += 1;
        }
    }
    Ok(Json(DeleteAgentsResponse {
        deleted,
        failed: req.agent_ids.len() as i64 - deleted,
    }))
}

pub async fn get_scan_agent_config(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let (version, config) = agent_config::current(&state.pool).await?;
    Ok(Json(json!({"version": version, "config": config})))
}

pub async fn put_scan_agent_config(
    State(state): State<AppState>,
    AppJson(doc): AppJson<serde_json::Value>,
) -> ApiResult<Json<serde_json::Value>> {
    let version = agent_config::put_global(&state.pool, &doc, Utc::now()).await?;
    Ok(Json(json!({"version": version})))
}
