use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult, FieldIssue};
use crate::models::{
    AgentRow, CreateScanRequest, CreateScanResponse, ResultView, ResultsPage, ScanRow, ScanStatus,
    ScanStatusView,
};
use crate::validation::{
    is_recognized_preference, is_valid_oid, is_valid_port_spec, parse_agent_uuid, ResultRange,
};

/// Validate a scan request and materialize it: one scan row plus one queued
/// job per declared agent, all inside a single transaction. Any invalid
/// input (malformed OIDs, unrecognized preferences, unknown, unauthorized or
/// tombstoned agents) rejects the whole scan; nothing is persisted.
pub async fn create_scan(
    pool: &SqlitePool,
    req: &CreateScanRequest,
    now: DateTime<Utc>,
) -> ApiResult<CreateScanResponse> {
    let mut issues = Vec::new();

    if req.vts.is_empty() {
        issues.push(FieldIssue::new("vts", "must be a non-empty array"));
    }
    for (i, vt) in req.vts.iter().enumerate() {
        if !is_valid_oid(&vt.vt_id) {
            issues.push(FieldIssue::new(
                format!("vts[{i}].vt_id"),
                "must be a dotted-decimal OID",
            ));
        }
    }

    if req.agents.is_empty() {
        issues.push(FieldIssue::new("agents", "at least one agent is required"));
    }
    let mut seen_agents = std::collections::HashSet::new();
    for (i, agent) in req.agents.iter().enumerate() {
        if parse_agent_uuid(&agent.agent_id).is_none() {
            issues.push(FieldIssue::new(
                format!("agents[{i}].agent_id"),
                "must be a valid UUID",
            ));
        } else if !seen_agents.insert(agent.agent_id.as_str()) {
            issues.push(FieldIssue::new(
                format!("agents[{i}].agent_id"),
                "duplicate agent in scan",
            ));
        }
    }

    if req.targets.is_empty() {
        issues.push(FieldIssue::new("targets", "must be a non-empty array"));
    }
    for (i, target) in req.targets.iter().enumerate() {
        if target.hosts.trim().is_empty() {
            issues.push(FieldIssue::new(
                format!("targets[{i}].hosts"),
                "must not be empty",
            ));
        }
        if let Some(ports) = &target.ports {
            if !is_valid_port_spec(ports) {
                issues.push(FieldIssue::new(
                    format!("targets[{i}].ports"),
                    "invalid port specification",
                ));
            }
        }
    }

    if let Some(prefs) = &req.scanner_preferences {
        for key in prefs.keys() {
            if !is_recognized_preference(key) {
                issues.push(FieldIssue::new(
                    format!("scanner_preferences.{key}"),
                    "unrecognized scanner preference",
                ));
            }
        }
    }

    if !issues.is_empty() {
        return Err(ApiError::validation("invalid scan specification").with_details(issues));
    }

    let mut tx = pool.begin().await?;

    // Every declared agent must be deliverable; one bad agent rejects the
    // whole scan atomically.
    let mut snapshots = Vec::with_capacity(req.agents.len());
    for (i, agent_ref) in req.agents.iter().enumerate() {
        let row = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents WHERE agent_id = ?")
            .bind(&agent_ref.agent_id)
            .fetch_optional(&mut *tx)
            .await?;
        let field = format!("agents[{i}].agent_id");
        match row {
            None => {
                return Err(ApiError::validation("unknown agent in scan")
                    .with_field(field, "agent has never registered"));
            }
            Some(agent) if agent.is_tombstoned() => {
                return Err(ApiError::validation("deregistered agent in scan")
                    .with_field(field, "agent has been deleted"));
            }
            Some(agent) if !agent.authorized => {
                return Err(ApiError::validation("unauthorized agent in scan")
                    .with_field(field, "agent is not authorized"));
            }
            Some(agent) => snapshots.push(agent),
        }
    }

    let scan_id = Uuid::new_v4().to_string();
    let vts_json = serde_json::to_string(
        &req.vts
            .iter()
            .map(|vt| {
                serde_json::json!({"vt_id": vt.vt_id, "preferences": vt.preferences})
            })
            .collect::<Vec<_>>(),
    )
    .map_err(|e| ApiError::internal(format!("serialize vts: {e}")))?;
    let agents_json = serde_json::to_string(
        &req.agents
            .iter()
            .map(|a| serde_json::json!({"agent_id": a.agent_id, "hostname": a.hostname}))
            .collect::<Vec<_>>(),
    )
    .map_err(|e| ApiError::internal(format!("serialize agents: {e}")))?;
    let targets_json = serde_json::to_string(
        &req.targets
            .iter()
            .map(|t| {
                serde_json::json!({"hosts": t.hosts, "ports": t.ports, "credentials": t.credentials})
            })
            .collect::<Vec<_>>(),
    )
    .map_err(|e| ApiError::internal(format!("serialize targets: {e}")))?;
    let prefs_json = serde_json::to_string(&req.scanner_preferences)
        .map_err(|e| ApiError::internal(format!("serialize preferences: {e}")))?;

    sqlx::query(
        "INSERT INTO scans (
             scan_id, status, progress, agents_total, created_at,
             vts, agents, targets, scanner_preferences
         ) VALUES (?, 'queued', 0, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&scan_id)
    .bind(req.agents.len() as i64)
    .bind(now)
    .bind(&vts_json)
    .bind(&agents_json)
    .bind(&targets_json)
    .bind(&prefs_json)
    .execute(&mut *tx)
    .await?;

    let job_config = serde_json::json!({
        "vts": serde_json::from_str::<serde_json::Value>(&vts_json).unwrap_or_default(),
        "targets": serde_json::from_str::<serde_json::Value>(&targets_json).unwrap_or_default(),
        "scanner_preferences": serde_json::from_str::<serde_json::Value>(&prefs_json).unwrap_or_default(),
    })
    .to_string();

    for agent in &snapshots {
        sqlx::query(
            "INSERT INTO jobs (
                 job_id, scan_id, agent_id, status, priority, attempts,
                 created_at, updated_at, available_at, config, hostname_snapshot
             ) VALUES (?, ?, ?, 'queued', 0, 0, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&scan_id)
        .bind(&agent.agent_id)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(&job_config)
        .bind(&agent.hostname)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    info!(
        scan_id = %scan_id,
        agents = req.agents.len(),
        vts = req.vts.len(),
        "scan created and jobs queued"
    );

    Ok(CreateScanResponse {
        scan_id,
        status: ScanStatus::Queued,
        agents_assigned: req.agents.len() as i64,
    })
}

pub async fn get_scan(pool: &SqlitePool, scan_id: &str) -> ApiResult<ScanRow> {
    sqlx::query_as::<_, ScanRow>("SELECT * FROM scans WHERE scan_id = ?")
        .bind(scan_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("scan not found: {scan_id}")))
}

pub async fn status_view(pool: &SqlitePool, scan_id: &str) -> ApiResult<ScanStatusView> {
    let scan = get_scan(pool, scan_id).await?;
    Ok(to_status_view(scan))
}

fn to_status_view(scan: ScanRow) -> ScanStatusView {
    let vts = declared_field(&scan.vts, "vt_id");
    let agents = declared_field(&scan.agents, "agent_id");
    ScanStatusView {
        scan_id: scan.scan_id.clone(),
        status: scan.status(),
        progress: scan.progress,
        agents_total: scan.agents_total,
        agents_running: scan.agents_running,
        agents_completed: scan.agents_completed,
        agents_failed: scan.agents_failed,
        created_at: scan.created_at,
        started_at: scan.started_at,
        completed_at: scan.completed_at,
        vts,
        agents,
        failure_reason: scan.failure_reason,
    }
}

fn declared_field(raw: &str, key: &str) -> Vec<String> {
    serde_json::from_str::<Vec<serde_json::Value>>(raw)
        .unwrap_or_default()
        .iter()
        .filter_map(|entry| entry.get(key).and_then(|v| v.as_str()).map(String::from))
        .collect()
}

#[derive(sqlx::FromRow)]
struct ResultWithHost {
    result_id: String,
    agent_id: String,
    hostname_snapshot: String,
    nvt_oid: String,
    nvt_name: String,
    nvt_severity: f64,
    nvt_cvss_base_vector: String,
    host: String,
    port: String,
    threat: String,
    description: String,
    qod: i64,
}

/// Paginated results in global submission order `(created_at, seq)`. Each
/// result carries the hostname snapshot taken when its job was created.
pub async fn results_page(
    pool: &SqlitePool,
    scan_id: &str,
    range: ResultRange,
) -> ApiResult<ResultsPage> {
    get_scan(pool, scan_id).await?;

    let (total_results,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM results WHERE scan_id = ?")
            .bind(scan_id)
            .fetch_one(pool)
            .await?;

    let rows = sqlx::query_as::<_, ResultWithHost>(
        "SELECT r.result_id, r.agent_id, j.hostname_snapshot,
                r.nvt_oid, r.nvt_name, r.nvt_severity, r.nvt_cvss_base_vector,
                r.host, r.port, r.threat, r.description, r.qod
         FROM results r
         JOIN jobs j ON j.job_id = r.job_id
         WHERE r.scan_id = ?
         ORDER BY r.created_at ASC, r.seq ASC
         LIMIT ? OFFSET ?",
    )
    .bind(scan_id)
    .bind(range.limit)
    .bind(range.start)
    .fetch_all(pool)
    .await?;

    let results: Vec<ResultView> = rows
        .into_iter()
        .map(|row| ResultView {
            result_id: row.result_id,
            agent_id: row.agent_id,
            agent_hostname: row.hostname_snapshot,
            nvt: crate::models::NvtView {
                oid: row.nvt_oid,
                name: row.nvt_name,
                severity: row.nvt_severity,
                cvss_base_vector: row.nvt_cvss_base_vector,
            },
            host: row.host,
            port: row.port,
            threat: row.threat,
            description: row.description,
            qod: row.qod,
        })
        .collect();

    Ok(ResultsPage {
        returned_results: results.len() as i64,
        results,
        total_results,
    })
}

/// Cancel a scan: every non-terminal job becomes `canceled` and the scan is
/// terminal. Leases on already-delivered jobs are left in place so results
/// still in flight are accepted until they lapse.
pub async fn cancel_scan(
    pool: &SqlitePool,
    scan_id: &str,
    now: DateTime<Utc>,
) -> ApiResult<ScanStatusView> {
    let scan = get_scan(pool, scan_id).await?;
    match scan.status() {
        ScanStatus::Canceled => return Ok(to_status_view(scan)),
        status if status.is_terminal() => {
            return Err(ApiError::conflict(format!(
                "scan is already terminal ({status:?})",
            )));
        }
        _ => {}
    }

    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE jobs SET status = 'canceled', failure_reason = 'scan canceled', updated_at = ?
         WHERE scan_id = ? AND status IN ('queued', 'assigned', 'running')",
    )
    .bind(now)
    .bind(scan_id)
    .execute(&mut *tx)
    .await?;

    let tally = job_tally(&mut tx, scan_id).await?;
    sqlx::query(
        "UPDATE scans SET status = 'canceled', completed_at = ?, progress = ?,
                agents_running = ?, agents_completed = ?, agents_failed = ?
         WHERE scan_id = ? AND status IN ('queued', 'running')",
    )
    .bind(now)
    .bind(tally.progress())
    .bind(tally.running)
    .bind(tally.completed)
    .bind(tally.failed)
    .bind(scan_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    info!(scan_id, "scan canceled");
    status_view(pool, scan_id).await
}

/// Cancel (if needed) and remove a scan together with its jobs and results.
pub async fn delete_scan(pool: &SqlitePool, scan_id: &str, now: DateTime<Utc>) -> ApiResult<()> {
    let scan = get_scan(pool, scan_id).await?;
    if !scan.status().is_terminal() {
        cancel_scan(pool, scan_id, now).await?;
    }

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM results WHERE scan_id = ?")
        .bind(scan_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM jobs WHERE scan_id = ?")
        .bind(scan_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM scans WHERE scan_id = ?")
        .bind(scan_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    info!(scan_id, "scan deleted");
    Ok(())
}

#[derive(Debug, Clone, Copy, sqlx::FromRow)]
struct JobTally {
    total: i64,
    terminal: i64,
    completed: i64,
    running: i64,
    failed: i64,
}

impl JobTally {
    fn progress(&self) -> i64 {
        if self.total == 0 {
            0
        } else {
            100 * self.terminal / self.total
        }
    }
}

async fn job_tally(tx: &mut Transaction<'_, Sqlite>, scan_id: &str) -> ApiResult<JobTally> {
    Ok(sqlx::query_as::<_, JobTally>(
        "SELECT
             COUNT(*) AS total,
             COALESCE(SUM(CASE WHEN status IN ('completed','failed','expired','canceled') THEN 1 ELSE 0 END), 0) AS terminal,
             COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
             COALESCE(SUM(CASE WHEN status IN ('assigned','running') THEN 1 ELSE 0 END), 0) AS running,
             COALESCE(SUM(CASE WHEN status IN ('failed','expired','canceled') THEN 1 ELSE 0 END), 0) AS failed
         FROM jobs WHERE scan_id = ?",
    )
    .bind(scan_id)
    .fetch_one(&mut **tx)
    .await?)
}

/// Recompute a scan's rollup after one of its jobs changed state, applying
/// the terminal rule: all jobs terminal and at least one completed means the
/// scan completed (partial reports are still useful); all terminal with none
/// completed means failed. Already-terminal scans are left untouched.
pub async fn sync_scan_after_job_change(
    tx: &mut Transaction<'_, Sqlite>,
    scan_id: &str,
    now: DateTime<Utc>,
) -> ApiResult<()> {
    let tally = job_tally(tx, scan_id).await?;

    sqlx::query(
        "UPDATE scans SET progress = ?, agents_running = ?, agents_completed = ?, agents_failed = ?
         WHERE scan_id = ? AND status IN ('queued', 'running')",
    )
    .bind(tally.progress())
    .bind(tally.running)
    .bind(tally.completed)
    .bind(tally.failed)
    .bind(scan_id)
    .execute(&mut **tx)
    .await?;

    if tally.total > 0 && tally.terminal == tally.total {
        let final_status = if tally.completed > 0 {
            ScanStatus::Completed
        } else {
            ScanStatus::Failed
        };
        let updated = sqlx::query(
            "UPDATE scans SET status = ?, completed_at = ?, failure_reason = ?
             WHERE scan_id = ? AND status IN ('queued', 'running')",
        )
        .bind(final_status.as_str())
        .bind(now)
        .bind((final_status == ScanStatus::Failed).then_some("no agent produced results"))
        .bind(scan_id)
        .execute(&mut **tx)
        .await?;
        if updated.rows_affected() == 1 {
            info!(scan_id, status = final_status.as_str(), "scan reached terminal state");
        }
    }

    Ok(())
}

/// Startup recovery: the coordinator keeps no state across restarts, so
/// rollups and terminal rules are re-derived from job rows for every scan
/// that was live when the process stopped.
pub async fn recover(pool: &SqlitePool, now: DateTime<Utc>) -> ApiResult<()> {
    let live: Vec<(String,)> = sqlx::query_as(
        "SELECT scan_id FROM scans WHERE status IN ('queued', 'running')",
    )
    .fetch_all(pool)
    .await?;

    for (scan_id,) in live {
        let mut tx = pool.begin().await?;
        let tally = job_tally(&mut tx, &scan_id).await?;
        if tally.total == 0 {
            // All targeted agents vanished between validation and
            // materialization, or the row was half-written: nothing can ever
            // run, so the scan fails explicitly rather than hanging.
            sqlx::query(
                "UPDATE scans SET status = 'failed', completed_at = ?,
                        failure_reason = 'no jobs materialized'
                 WHERE scan_id = ? AND status IN ('queued', 'running')",
            )
            .bind(now)
            .bind(&scan_id)
            .execute(&mut *tx)
            .await?;
            warn!(scan_id = %scan_id, "scan without jobs marked failed during recovery");
        } else {
            sync_scan_after_job_change(&mut tx, &scan_id, now).await?;
        }
        tx.commit().await?;
    }

    Ok(())
}
