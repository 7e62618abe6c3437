use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent_config;
use crate::config::ControllerConfig;
use crate::error::ApiResult;
use crate::models::{AgentRow, LivenessState};

/// Demotion-only liveness computation applied by the sweep. Promotions back
/// to `online` happen eagerly on the heartbeat path; heartbeats are the only
/// liveness signal, so the sweep can only ever observe silence.
pub fn demote(
    current: LivenessState,
    last_heartbeat: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    stale_after_secs: i64,
    inactive_after_secs: i64,
) -> LivenessState {
    let Some(last_heartbeat) = last_heartbeat else {
        return current;
    };
    let silence = (now - last_heartbeat).num_seconds();
    match current {
        LivenessState::Online if silence > stale_after_secs => {
            if silence > inactive_after_secs {
                LivenessState::Inactive
            } else {
                LivenessState::Offline
            }
        }
        LivenessState::Offline if silence > inactive_after_secs => LivenessState::Inactive,
        other => other,
    }
}

/// One monitor pass. Writes only actual transitions; running the sweep twice
/// with no elapsed time changes nothing. Each agent is a single guarded
/// UPDATE, so the pass never holds a lock across agents.
pub async fn sweep(
    pool: &SqlitePool,
    inactive_after_secs: i64,
    now: DateTime<Utc>,
) -> ApiResult<u64> {
    let candidates = sqlx::query_as::<_, AgentRow>(
        "SELECT * FROM agents
         WHERE deleted_at IS NULL AND liveness IN ('online', 'offline')",
    )
    .fetch_all(pool)
    .await?;

    let mut transitions = 0u64;
    for agent in candidates {
        let (_, merged) = agent_config::merged_for_agent(pool, &agent).await?;
        let current = agent.liveness();
        let next = demote(
            current,
            agent.last_heartbeat,
            now,
            merged.stale_after_secs(),
            inactive_after_secs,
        );
        if next == current {
            continue;
        }

        let updated = sqlx::query(
            "UPDATE agents SET liveness = ? WHERE agent_id = ? AND liveness = ?",
        )
        .bind(next.as_str())
        .bind(&agent.agent_id)
        .bind(current.as_str())
        .execute(pool)
        .await?;
        if updated.rows_affected() == 1 {
            transitions += 1;
            debug!(
                agent_id = %agent.agent_id,
                from = %current,
                to = %next,
                "liveness transition"
            );
        }
    }

    Ok(transitions)
}

/// Background monitor worker.
pub async fn monitor_loop(
    pool: SqlitePool,
    config: std::sync::Arc<ControllerConfig>,
    shutdown: CancellationToken,
) {
    let mut ticker =
        tokio::time::interval(std::time::Duration::from_secs(config.liveness_interval_secs));
    info!(
        interval_secs = config.liveness_interval_secs,
        "liveness monitor started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => {
                info!("liveness monitor stopping");
                return;
            }
        }

        match sweep(&pool, config.offline_to_inactive_secs, Utc::now()).await {
            Ok(0) => {}
            Ok(n) => info!(transitions = n, "liveness sweep"),
            Err(e) => warn!(error = %e, "liveness sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const STALE: i64 = 1200; // interval 600, one missed window
    const INACTIVE: i64 = 86_400;

    fn at(now: DateTime<Utc>, secs_ago: i64) -> Option<DateTime<Utc>> {
        Some(now - Duration::seconds(secs_ago))
    }

    #[test]
    fn online_survives_within_window() {
        let now = Utc::now();
        assert_eq!(
            demote(LivenessState::Online, at(now, STALE), now, STALE, INACTIVE),
            LivenessState::Online
        );
    }

    #[test]
    fn online_demotes_to_offline_after_missed_window() {
        let now = Utc::now();
        assert_eq!(
            demote(LivenessState::Online, at(now, STALE + 1), now, STALE, INACTIVE),
            LivenessState::Offline
        );
    }

    #[test]
    fn offline_demotes_to_inactive_after_a_day() {
        let now = Utc::now();
        assert_eq!(
            demote(
                LivenessState::Offline,
                at(now, INACTIVE + 1),
                now,
                STALE,
                INACTIVE
            ),
            LivenessState::Inactive
        );
        assert_eq!(
            demote(
                LivenessState::Offline,
                at(now, INACTIVE - 1),
                now,
                STALE,
                INACTIVE
            ),
            LivenessState::Offline
        );
    }

    #[test]
    fn online_jumps_straight_to_inactive_after_long_outage() {
        let now = Utc::now();
        assert_eq!(
            demote(
                LivenessState::Online,
                at(now, INACTIVE + 1),
                now,
                STALE,
                INACTIVE
            ),
            LivenessState::Inactive
        );
    }

    #[test]
    fn pending_and_inactive_are_left_alone() {
        let now = Utc::now();
        assert_eq!(
            demote(
                LivenessState::Pending,
                at(now, INACTIVE * 2),
                now,
                STALE,
                INACTIVE
            ),
            LivenessState::Pending
        );
        assert_eq!(
            demote(
                LivenessState::Inactive,
                at(now, INACTIVE * 2),
                now,
                STALE,
                INACTIVE
            ),
            LivenessState::Inactive
        );
    }

    #[test]
    fn no_heartbeat_means_no_change() {
        let now = Utc::now();
        assert_eq!(
            demote(LivenessState::Online, None, now, STALE, INACTIVE),
            LivenessState::Online
        );
    }
}
