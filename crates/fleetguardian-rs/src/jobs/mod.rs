pub mod state;

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::{ApiError, ApiResult};
use crate::models::{AgentRow, JobEnvelope, JobRow};
use crate::scans;

use state::{apply, JobEvent, JobState};

impl From<state::IllegalTransition> for ApiError {
    fn from(err: state::IllegalTransition) -> Self {
        ApiError::conflict(err.to_string())
    }
}

/// Atomically move up to `limit` ready jobs for `agent` from `queued` to
/// `assigned`, stamping a visibility lease. Concurrent polls can never
/// receive the same job twice: each move is guarded on the previous state
/// inside one transaction.
///
/// An unauthorized agent always gets an empty list; queued work is never
/// revealed to it.
pub async fn claim_jobs(
    pool: &SqlitePool,
    agent: &AgentRow,
    visibility_secs: i64,
    limit: i64,
    now: DateTime<Utc>,
) -> ApiResult<Vec<JobEnvelope>> {
    if !agent.authorized {
        return Ok(Vec::new());
    }

    let deadline = now + Duration::seconds(visibility_secs);
    let mut tx = pool.begin().await?;

    let candidates = sqlx::query_as::<_, JobRow>(
        "SELECT * FROM jobs
         WHERE agent_id = ? AND status = 'queued' AND available_at <= ?
         ORDER BY priority DESC, created_at ASC
         LIMIT ?",
    )
    .bind(&agent.agent_id)
    .bind(now)
    .bind(limit)
    .fetch_all(&mut *tx)
    .await?;

    let mut claimed = Vec::with_capacity(candidates.len());
    for job in candidates {
        let next = apply(JobState::Queued, JobEvent::Claim)?;
        let updated = sqlx::query(
            "UPDATE jobs
             SET status = ?, attempts = attempts + 1, assigned_at = ?, deadline_at = ?, updated_at = ?
             WHERE job_id = ? AND status = 'queued'",
        )
        .bind(next.as_str())
        .bind(now)
        .bind(deadline)
        .bind(now)
        .bind(&job.job_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            // Raced with another claim or a cancel; the guard kept it safe.
            continue;
        }

        sqlx::query(
            "UPDATE scans SET status = 'running', started_at = COALESCE(started_at, ?)
             WHERE scan_id = ? AND status = 'queued'",
        )
        .bind(now)
        .bind(&job.scan_id)
        .execute(&mut *tx)
        .await?;
        scans::sync_scan_after_job_change(&mut tx, &job.scan_id, now).await?;

        let config = serde_json::from_str(&job.config)
            .map_err(|e| ApiError::internal(format!("corrupt job config for {}: {e}", job.job_id)))?;
        claimed.push(JobEnvelope {
            job_id: job.job_id,
            scan_id: job.scan_id,
            job_type: "vulnerability_scan",
            priority: job.priority,
            attempts: job.attempts + 1,
            created_at: job.created_at,
            deadline_at: Some(deadline),
            config,
        });
    }

    tx.commit().await?;

    if !claimed.is_empty() {
        info!(
            agent_id = %agent.agent_id,
            jobs = claimed.len(),
            "delivered jobs with visibility lease"
        );
    }
    Ok(claimed)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReclaimStats {
    pub requeued: u64,
    pub expired: u64,
}

#[derive(Debug, sqlx::FromRow)]
struct LapsedJob {
    job_id: String,
    scan_id: String,
    status: String,
    attempts: i64,
}

/// One reclaimer pass. Lapsed leases go back to `queued` with exponential
/// backoff until `max_attempts` deliveries, then the job is `expired`.
/// Jobs unclaimed past the expiry horizon are also `expired` so agents
/// returning from a long absence receive no stale work.
///
/// Each job is handled in its own short transaction; the pass holds no
/// global lock and is idempotent.
pub async fn reclaim_expired(
    pool: &SqlitePool,
    max_attempts: i64,
    backoff_base_secs: i64,
    unclaimed_expiry_secs: i64,
    now: DateTime<Utc>,
) -> ApiResult<ReclaimStats> {
    let mut stats = ReclaimStats::default();

    let lapsed = sqlx::query_as::<_, LapsedJob>(
        "SELECT job_id, scan_id, status, attempts FROM jobs
         WHERE status IN ('assigned', 'running') AND deadline_at < ?",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;

    for job in lapsed {
        let current: JobState = job
            .status
            .parse()
            .map_err(|e: String| ApiError::internal(e))?;

        if job.attempts >= max_attempts {
            let Ok(next) = apply(current, JobEvent::AttemptsExhausted) else {
                continue;
            };
            let mut tx = pool.begin().await?;
            let updated = sqlx::query(
                "UPDATE jobs
                 SET status = ?, failure_reason = 'visibility lease expired after max attempts',
                     updated_at = ?
                 WHERE job_id = ? AND status = ?",
            )
            .bind(next.as_str())
            .bind(now)
            .bind(&job.job_id)
            .bind(current.as_str())
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 1 {
                scans::sync_scan_after_job_change(&mut tx, &job.scan_id, now).await?;
                stats.expired += 1;
                warn!(job_id = %job.job_id, attempts = job.attempts, "job expired, attempts exhausted");
            }
            tx.commit().await?;
        } else {
            let Ok(next) = apply(current, JobEvent::LeaseLapsed) else {
                continue;
            };
            // Delivery count doubles the delay each time, capped to keep the
            // shift well-defined.
            let exponent = (job.attempts - 1).clamp(0, 6) as u32;
            let backoff = Duration::seconds(backoff_base_secs * i64::from(2u32.pow(exponent)));
            let mut tx = pool.begin().await?;
            let updated = sqlx::query(
                "UPDATE jobs
                 SET status = ?, assigned_at = NULL, deadline_at = NULL,
                     available_at = ?, updated_at = ?
                 WHERE job_id = ? AND status = ?",
            )
            .bind(next.as_str())
            .bind(now + backoff)
            .bind(now)
            .bind(&job.job_id)
            .bind(current.as_str())
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 1 {
                scans::sync_scan_after_job_change(&mut tx, &job.scan_id, now).await?;
                stats.requeued += 1;
                debug!(job_id = %job.job_id, attempts = job.attempts, "lease lapsed, job requeued");
            }
            tx.commit().await?;
        }
    }

    let stale_cutoff = now - Duration::seconds(unclaimed_expiry_secs);
    let stale = sqlx::query_as::<_, LapsedJob>(
        "SELECT job_id, scan_id, status, attempts FROM jobs
         WHERE status = 'queued' AND created_at < ?",
    )
    .bind(stale_cutoff)
    .fetch_all(pool)
    .await?;

    for job in stale {
        let next = apply(JobState::Queued, JobEvent::UnclaimedExpired)?;
        let mut tx = pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE jobs
             SET status = ?, failure_reason = 'unclaimed past expiry horizon', updated_at = ?
             WHERE job_id = ? AND status = 'queued'",
        )
        .bind(next.as_str())
        .bind(now)
        .bind(&job.job_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 1 {
            scans::sync_scan_after_job_change(&mut tx, &job.scan_id, now).await?;
            stats.expired += 1;
            warn!(job_id = %job.job_id, "unclaimed job expired");
        }
        tx.commit().await?;
    }

    Ok(stats)
}

/// Cancel every non-terminal job pinned to an agent (admin deletion path).
/// Leases on already-delivered jobs are kept so in-flight submissions can
/// still be matched against the canceled row until they lapse.
pub async fn cancel_jobs_for_agent(
    pool: &SqlitePool,
    agent_id: &str,
    now: DateTime<Utc>,
) -> ApiResult<u64> {
    let live = sqlx::query_as::<_, LapsedJob>(
        "SELECT job_id, scan_id, status, attempts FROM jobs
         WHERE agent_id = ? AND status IN ('queued', 'assigned', 'running')",
    )
    .bind(agent_id)
    .fetch_all(pool)
    .await?;

    let mut canceled = 0u64;
    for job in live {
        let current: JobState = job
            .status
            .parse()
            .map_err(|e: String| ApiError::internal(e))?;
        let Ok(next) = apply(current, JobEvent::Cancel) else {
            continue;
        };
        let mut tx = pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE jobs SET status = ?, failure_reason = 'agent deregistered', updated_at = ?
             WHERE job_id = ? AND status = ?",
        )
        .bind(next.as_str())
        .bind(now)
        .bind(&job.job_id)
        .bind(current.as_str())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 1 {
            scans::sync_scan_after_job_change(&mut tx, &job.scan_id, now).await?;
            canceled += 1;
        }
        tx.commit().await?;
    }

    Ok(canceled)
}

/// Background reclaimer worker. Sweeps on a fixed interval until shutdown.
pub async fn reclaimer_loop(
    pool: SqlitePool,
    config: std::sync::Arc<ControllerConfig>,
    shutdown: CancellationToken,
) {
    let mut ticker =
        tokio::time::interval(std::time::Duration::from_secs(config.reclaim_interval_secs));
    info!(
        interval_secs = config.reclaim_interval_secs,
        "dispatcher reclaimer started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => {
                info!("dispatcher reclaimer stopping");
                return;
            }
        }

        match reclaim_expired(
            &pool,
            config.dispatcher_max_attempts,
            config.retry_backoff_base_secs,
            config.job_unclaimed_expiry_secs,
            Utc::now(),
        )
        .await
        {
            Ok(stats) if stats.requeued > 0 || stats.expired > 0 => {
                info!(requeued = stats.requeued, expired = stats.expired, "reclaimer pass");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "reclaimer pass failed"),
        }
    }
}
