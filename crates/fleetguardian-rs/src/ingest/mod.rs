use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult, FieldIssue};
use crate::jobs::state::{apply, JobEvent, JobState};
use crate::models::{FinalizeOutcome, FinalizeRequest, JobRow, ResultBatch, ThreatLevel};
use crate::registry;
use crate::scans;
use crate::validation::{is_valid_oid, is_valid_qod, is_valid_result_port, is_valid_severity};

fn validate_batch(batch: &ResultBatch) -> Result<(), Vec<FieldIssue>> {
    let mut issues = Vec::new();

    if batch.batch_sequence < 0 {
        issues.push(FieldIssue::new("batch_sequence", "must be zero or greater"));
    }
    if batch.results.is_empty() {
        issues.push(FieldIssue::new("results", "must be a non-empty array"));
    }

    for (i, result) in batch.results.iter().enumerate() {
        if !is_valid_oid(&result.nvt.oid) {
            issues.push(FieldIssue::new(
                format!("results[{i}].nvt.oid"),
                "must be a dotted-decimal OID",
            ));
        }
        if !is_valid_severity(result.nvt.severity) {
            issues.push(FieldIssue::new(
                format!("results[{i}].nvt.severity"),
                "must be within [0.0, 10.0]",
            ));
        }
        if result.host.trim().is_empty() {
            issues.push(FieldIssue::new(
                format!("results[{i}].host"),
                "must not be empty",
            ));
        }
        if result.threat.parse::<ThreatLevel>().is_err() {
            issues.push(FieldIssue::new(
                format!("results[{i}].threat"),
                "must be one of Log, Low, Medium, High, Critical",
            ));
        }
        if let Some(port) = &result.port {
            if !is_valid_result_port(port) {
                issues.push(FieldIssue::new(
                    format!("results[{i}].port"),
                    "invalid port descriptor",
                ));
            }
        }
        if let Some(qod) = result.qod {
            if !is_valid_qod(qod) {
                issues.push(FieldIssue::new(
                    format!("results[{i}].qod"),
                    "must be within [0, 100]",
                ));
            }
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

async fn owned_job(
    pool: &SqlitePool,
    job_id: &str,
    agent_id: &str,
) -> ApiResult<JobRow> {
    // A deleted (or already purged) agent gets NOT_FOUND before any job
    // detail is revealed.
    match registry::get_agent(pool, agent_id).await? {
        Some(agent) if !agent.is_tombstoned() => {}
        _ => return Err(ApiError::not_found(format!("agent not found: {agent_id}"))),
    }

    let job = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE job_id = ?")
        .bind(job_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job not found: {job_id}")))?;

    if job.agent_id != agent_id {
        return Err(ApiError::forbidden("job belongs to a different agent"));
    }
    Ok(job)
}

/// Accept one result batch. The whole batch is validated before anything is
/// persisted; a malformed entry rejects it entirely. Re-submitting a batch
/// with the same `(job_id, batch_sequence)` is idempotent. The first
/// accepted batch moves the job to `running`; every accepted batch extends
/// the visibility lease.
///
/// Results for a canceled job are still accepted while its lease is live so
/// work already done is not lost; afterwards the submission is rejected
/// explicitly, never dropped.
pub async fn submit_results(
    pool: &SqlitePool,
    job_id: &str,
    batch: &ResultBatch,
    visibility_secs: i64,
    now: DateTime<Utc>,
) -> ApiResult<i64> {
    if batch.job_id != job_id {
        return Err(ApiError::invalid_request("job ID mismatch").with_field(
            "job_id",
            format!("URL names {job_id} but body names {}", batch.job_id),
        ));
    }
    validate_batch(batch)
        .map_err(|issues| ApiError::validation("invalid result batch").with_details(issues))?;

    let job = owned_job(pool, job_id, &batch.agent_id).await?;
    if job.scan_id != batch.scan_id {
        return Err(ApiError::invalid_request("scan ID mismatch")
            .with_field("scan_id", "does not match the job's scan"));
    }

    let state: JobState = job
        .status
        .parse()
        .map_err(|e: String| ApiError::internal(e))?;

    let extend_lease = match state {
        JobState::Assigned | JobState::Running => true,
        JobState::Canceled if job.deadline_at.is_some_and(|d| d > now) => false,
        JobState::Queued => {
            return Err(ApiError::conflict(
                "job has not been delivered; results are not acceptable yet",
            ));
        }
        _ => {
            return Err(ApiError::conflict(
                "already_finalized: job is terminal and no longer accepts results",
            ));
        }
    };

    let mut tx = pool.begin().await?;

    if state == JobState::Assigned {
        let next = apply(state, JobEvent::FirstBatch)?;
        sqlx::query("UPDATE jobs SET status = ?, updated_at = ? WHERE job_id = ? AND status = ?")
            .bind(next.as_str())
            .bind(now)
            .bind(job_id)
            .bind(state.as_str())
            .execute(&mut *tx)
            .await?;
    }

    for (index, result) in batch.results.iter().enumerate() {
        sqlx::query(
            "INSERT OR IGNORE INTO results (
                 result_id, scan_id, agent_id, job_id, batch_sequence, batch_index,
                 nvt_oid, nvt_name, nvt_severity, nvt_cvss_base_vector,
                 host, port, threat, description, qod, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&job.scan_id)
        .bind(&batch.agent_id)
        .bind(job_id)
        .bind(batch.batch_sequence)
        .bind(index as i64)
        .bind(&result.nvt.oid)
        .bind(result.nvt.name.as_deref().unwrap_or(""))
        .bind(result.nvt.severity)
        .bind(result.nvt.cvss_base_vector.as_deref().unwrap_or(""))
        .bind(&result.host)
        .bind(result.port.as_deref().unwrap_or(""))
        .bind(&result.threat)
        .bind(result.description.as_deref().unwrap_or(""))
        .bind(result.qod.unwrap_or(0))
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    if extend_lease {
        sqlx::query(
            "UPDATE jobs SET deadline_at = ?, updated_at = ?
             WHERE job_id = ? AND status IN ('assigned', 'running')",
        )
        .bind(now + Duration::seconds(visibility_secs))
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    info!(
        job_id,
        agent_id = %batch.agent_id,
        batch_sequence = batch.batch_sequence,
        results = batch.results.len(),
        "result batch accepted"
    );
    Ok(batch.results.len() as i64)
}

/// Finalize a job. `completed` is only reachable from `running` (at least one
/// batch in the current delivery); `failed` is accepted without submissions.
/// The first terminal acknowledgement wins; repeats get
/// `CONFLICT/already_finalized` with no side effects.
pub async fn finalize(
    pool: &SqlitePool,
    job_id: &str,
    agent_id: &str,
    req: &FinalizeRequest,
    now: DateTime<Utc>,
) -> ApiResult<JobState> {
    let job = owned_job(pool, job_id, agent_id).await?;
    let state: JobState = job
        .status
        .parse()
        .map_err(|e: String| ApiError::internal(e))?;

    if state.is_terminal() {
        return Err(ApiError::conflict(
            "already_finalized: job already reached a terminal state",
        ));
    }

    let next = match req.outcome {
        FinalizeOutcome::Completed => {
            if state != JobState::Running {
                return Err(ApiError::validation(
                    "completed finalize requires at least one submitted result batch",
                ));
            }
            apply(state, JobEvent::FinalizeCompleted)?
        }
        FinalizeOutcome::Failed => apply(state, JobEvent::FinalizeFailed)?,
    };

    let mut tx = pool.begin().await?;
    let updated = sqlx::query(
        "UPDATE jobs SET status = ?, failure_reason = ?, updated_at = ?
         WHERE job_id = ? AND status = ?",
    )
    .bind(next.as_str())
    .bind(match req.outcome {
        FinalizeOutcome::Failed => Some(req.summary.as_deref().unwrap_or("agent reported failure")),
        FinalizeOutcome::Completed => None,
    })
    .bind(now)
    .bind(job_id)
    .bind(state.as_str())
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() != 1 {
        // Lost the race against a concurrent finalize or the reclaimer.
        return Err(ApiError::conflict(
            "already_finalized: job state changed concurrently",
        ));
    }

    scans::sync_scan_after_job_change(&mut tx, &job.scan_id, now).await?;
    tx.commit().await?;

    info!(job_id, agent_id, outcome = ?req.outcome, "job finalized");
    Ok(next)
}
