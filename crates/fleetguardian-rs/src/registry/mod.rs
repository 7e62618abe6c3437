use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::info;

use crate::agent_config;
use crate::error::{ApiError, ApiResult};
use crate::jobs;
use crate::models::{
    AgentPatch, AgentRow, AgentView, HeartbeatRequest, HeartbeatResponse, LivenessState,
};
use crate::validation::parse_agent_uuid;

pub async fn get_agent(pool: &SqlitePool, agent_id: &str) -> ApiResult<Option<AgentRow>> {
    Ok(
        sqlx::query_as::<_, AgentRow>("SELECT * FROM agents WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(pool)
            .await?,
    )
}

/// Heartbeat upsert. Creates unknown agents as unauthorized/pending, refreshes
/// declared attributes for known ones, and answers a tombstoned agent with one
/// terminal `deregistered` signal before purging its row.
///
/// `authorized` is never written here; admin intent cannot be overwritten by
/// a concurrent heartbeat.
pub async fn heartbeat(
    pool: &SqlitePool,
    req: &HeartbeatRequest,
    now: DateTime<Utc>,
) -> ApiResult<HeartbeatResponse> {
    if parse_agent_uuid(&req.agent_id).is_none() {
        return Err(ApiError::validation("invalid agent_id format")
            .with_field("agent_id", "must be a valid UUID"));
    }
    if req.hostname.is_empty() {
        return Err(ApiError::invalid_request("missing required fields")
            .with_field("hostname", "required field is missing"));
    }

    let existing = get_agent(pool, &req.agent_id).await?;

    if let Some(agent) = &existing {
        if agent.is_tombstoned() {
            purge(pool, &req.agent_id).await?;
            info!(agent_id = %req.agent_id, "deregistered agent purged after final signal");
            let (_, config) = agent_config::current(pool).await?;
            return Ok(HeartbeatResponse {
                status: "deregistered",
                config_updated: false,
                next_heartbeat_in_seconds: config.heartbeat.interval_in_seconds,
                authorized: false,
            });
        }
    }

    let mut tx = pool.begin().await?;

    let authorized = match &existing {
        Some(agent) => {
            // Later wall clock wins; a delayed heartbeat can never move the
            // timestamp backwards.
            sqlx::query(
                "UPDATE agents SET
                     hostname = ?,
                     operating_system = COALESCE(?, operating_system),
                     architecture = COALESCE(?, architecture),
                     agent_version = COALESCE(?, agent_version),
                     updater_version = COALESCE(?, updater_version),
                     last_heartbeat = CASE
                         WHEN last_heartbeat IS NULL OR last_heartbeat < ?6 THEN ?6
                         ELSE last_heartbeat
                     END,
                     liveness = CASE WHEN authorized = 1 THEN 'online' ELSE liveness END,
                     config_version_seen = COALESCE(?, config_version_seen)
                 WHERE agent_id = ?",
            )
            .bind(&req.hostname)
            .bind(req.operating_system.as_deref())
            .bind(req.architecture.as_deref())
            .bind(req.agent_version.as_deref())
            .bind(req.updater_version.as_deref())
            .bind(now)
            .bind(req.config_version_seen)
            .bind(&req.agent_id)
            .execute(&mut *tx)
            .await?;
            agent.authorized
        }
        None => {
            sqlx::query(
                "INSERT INTO agents (
                     agent_id, hostname, operating_system, architecture, agent_version,
                     updater_version, authorized, liveness, last_heartbeat, first_seen,
                     config_version_seen
                 ) VALUES (?, ?, ?, ?, ?, ?, 0, 'pending', ?, ?, ?)",
            )
            .bind(&req.agent_id)
            .bind(&req.hostname)
            .bind(req.operating_system.as_deref().unwrap_or(""))
            .bind(req.architecture.as_deref().unwrap_or(""))
            .bind(req.agent_version.as_deref().unwrap_or(""))
            .bind(req.updater_version.as_deref().unwrap_or(""))
            .bind(now)
            .bind(now)
            .bind(req.config_version_seen.unwrap_or(0))
            .execute(&mut *tx)
            .await?;
            info!(agent_id = %req.agent_id, hostname = %req.hostname, "new agent registered, awaiting authorization");
            false
        }
    };

    sqlx::query("DELETE FROM agent_ip_addresses WHERE agent_id = ?")
        .bind(&req.agent_id)
        .execute(&mut *tx)
        .await?;
    for ip in &req.ip_addresses {
        sqlx::query("INSERT INTO agent_ip_addresses (agent_id, ip_address) VALUES (?, ?)")
            .bind(&req.agent_id)
            .bind(ip)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;

    let agent = get_agent(pool, &req.agent_id)
        .await?
        .ok_or_else(|| ApiError::internal("agent row vanished during heartbeat"))?;
    let (version, merged) = agent_config::merged_for_agent(pool, &agent).await?;

    Ok(HeartbeatResponse {
        status: "accepted",
        config_updated: agent.config_version_seen < version,
        next_heartbeat_in_seconds: merged.heartbeat.interval_in_seconds,
        authorized,
    })
}

/// Record that an agent has fetched a config version.
pub async fn record_config_seen(
    pool: &SqlitePool,
    agent_id: &str,
    version: i64,
) -> ApiResult<()> {
    sqlx::query(
        "UPDATE agents SET config_version_seen = MAX(config_version_seen, ?) WHERE agent_id = ?",
    )
    .bind(version)
    .bind(agent_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Apply one admin patch. Authorization changes recompute liveness;
/// overriding config bumps the global config version so the agent learns of
/// it on the next heartbeat.
pub async fn apply_patch(
    pool: &SqlitePool,
    agent_id: &str,
    patch: &AgentPatch,
    now: DateTime<Utc>,
) -> ApiResult<()> {
    let agent = get_agent(pool, agent_id)
        .await?
        .filter(|a| !a.is_tombstoned())
        .ok_or_else(|| ApiError::not_found(format!("agent not found: {agent_id}")))?;

    if let Some(authorized) = patch.authorized {
        if authorized != agent.authorized {
            let liveness = if authorized {
                liveness_on_authorize(pool, &agent, now).await?
            } else {
                LivenessState::Pending
            };
            sqlx::query("UPDATE agents SET authorized = ?, liveness = ? WHERE agent_id = ?")
                .bind(authorized)
                .bind(liveness.as_str())
                .bind(agent_id)
                .execute(pool)
                .await?;
            info!(agent_id, authorized, "agent authorization changed");
        }
    }

    if let Some(update_to_latest) = patch.update_to_latest {
        sqlx::query("UPDATE agents SET update_to_latest = ? WHERE agent_id = ?")
            .bind(update_to_latest)
            .bind(agent_id)
            .execute(pool)
            .await?;
    }

    if let Some(config) = &patch.config {
        let validated = agent_config::parse_strict(config)?;
        let serialized = serde_json::to_string(&validated)
            .map_err(|e| ApiError::internal(format!("serialize override: {e}")))?;
        sqlx::query("UPDATE agents SET config_override = ? WHERE agent_id = ?")
            .bind(serialized)
            .bind(agent_id)
            .execute(pool)
            .await?;
        agent_config::bump_version(pool, now).await?;
        info!(agent_id, "per-agent config override set");
    }

    Ok(())
}

async fn liveness_on_authorize(
    pool: &SqlitePool,
    agent: &AgentRow,
    now: DateTime<Utc>,
) -> ApiResult<LivenessState> {
    let Some(last_heartbeat) = agent.last_heartbeat else {
        return Ok(LivenessState::Pending);
    };
    let (_, merged) = agent_config::merged_for_agent(pool, agent).await?;
    let silence = (now - last_heartbeat).num_seconds();
    if silence <= merged.stale_after_secs() {
        Ok(LivenessState::Online)
    } else {
        Ok(LivenessState::Offline)
    }
}

/// Soft delete: tombstone the row and cancel the agent's outstanding jobs.
/// The record survives until the agent's next contact so it can receive the
/// terminal `deregistered` signal.
pub async fn soft_delete(pool: &SqlitePool, agent_id: &str, now: DateTime<Utc>) -> ApiResult<bool> {
    let updated = sqlx::query(
        "UPDATE agents SET deleted_at = ?, liveness = 'tombstoned', authorized = 0
         WHERE agent_id = ? AND deleted_at IS NULL",
    )
    .bind(now)
    .bind(agent_id)
    .execute(pool)
    .await?;
    if updated.rows_affected() == 0 {
        return Ok(false);
    }
    let canceled = jobs::cancel_jobs_for_agent(pool, agent_id, now).await?;
    info!(agent_id, canceled_jobs = canceled, "agent tombstoned");
    Ok(true)
}

async fn purge(pool: &SqlitePool, agent_id: &str) -> ApiResult<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM agent_ip_addresses WHERE agent_id = ?")
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM agents WHERE agent_id = ?")
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

#[derive(Debug, Default, Clone)]
pub struct AgentListFilter {
    pub liveness: Option<LivenessState>,
    pub authorized: Option<bool>,
    pub hostname_prefix: Option<String>,
    pub updates_only: bool,
    pub limit: i64,
    pub offset: i64,
}

/// Paginated listing ordered by `(last_heartbeat DESC, agent_id)` for stable
/// scrolling. Tombstoned agents are excluded.
pub async fn list_agents(pool: &SqlitePool, filter: &AgentListFilter) -> ApiResult<Vec<AgentView>> {
    let mut query: QueryBuilder<Sqlite> =
        QueryBuilder::new("SELECT * FROM agents WHERE deleted_at IS NULL");
    if let Some(liveness) = filter.liveness {
        query.push(" AND liveness = ").push_bind(liveness.as_str());
    }
    if let Some(authorized) = filter.authorized {
        query.push(" AND authorized = ").push_bind(authorized);
    }
    if let Some(prefix) = &filter.hostname_prefix {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        query
            .push(" AND hostname LIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\'");
    }
    if filter.updates_only {
        query.push(" AND update_to_latest = 1");
    }
    query
        .push(" ORDER BY last_heartbeat DESC, agent_id LIMIT ")
        .push_bind(filter.limit.clamp(1, 1000))
        .push(" OFFSET ")
        .push_bind(filter.offset.max(0));

    let rows: Vec<AgentRow> = query.build_query_as().fetch_all(pool).await?;

    let mut views = Vec::with_capacity(rows.len());
    for row in rows {
        let ips = agent_ips(pool, &row.agent_id).await?;
        views.push(to_view(row, ips));
    }
    Ok(views)
}

pub async fn agent_ips(pool: &SqlitePool, agent_id: &str) -> ApiResult<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT ip_address FROM agent_ip_addresses WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(ip,)| ip).collect())
}

fn to_view(row: AgentRow, ip_addresses: Vec<String>) -> AgentView {
    let liveness = row.liveness();
    AgentView {
        agent_id: row.agent_id,
        hostname: row.hostname,
        authorized: row.authorized,
        liveness,
        ip_addresses,
        last_heartbeat: row.last_heartbeat,
        first_seen: row.first_seen,
        operating_system: row.operating_system,
        architecture: row.architecture,
        agent_version: row.agent_version,
        updater_version: row.updater_version,
        update_to_latest: row.update_to_latest,
        config_version_seen: row.config_version_seen,
    }
}
