use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::{ApiError, ApiResult, FieldIssue};
use crate::models::AgentRow;

/// The scan agent configuration document. The schema is strict: unknown keys
/// anywhere in the document are a validation error, never silently accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScanAgentConfig {
    pub heartbeat: HeartbeatSettings,
    pub retry: RetrySettings,
    pub executor: ExecutorSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatSettings {
    pub interval_in_seconds: i64,
    pub miss_until_inactive: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    pub attempts: i64,
    pub delay_in_seconds: i64,
    pub max_jitter_in_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorSettings {
    pub bulk_size: i64,
    pub bulk_throttle_time_in_ms: i64,
    pub scheduler_cron: Vec<String>,
}

impl Default for ScanAgentConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatSettings {
                interval_in_seconds: 600,
                miss_until_inactive: 1,
            },
            retry: RetrySettings {
                attempts: 5,
                delay_in_seconds: 60,
                max_jitter_in_seconds: 30,
            },
            executor: ExecutorSettings {
                bulk_size: 10,
                bulk_throttle_time_in_ms: 1000,
                scheduler_cron: vec!["0 23 * * *".to_string()],
            },
        }
    }
}

impl ScanAgentConfig {
    /// Seconds of heartbeat silence after which an online agent is
    /// considered offline.
    pub fn stale_after_secs(&self) -> i64 {
        self.heartbeat.interval_in_seconds * (1 + self.heartbeat.miss_until_inactive)
    }

    /// Visibility lease for delivered jobs: twice the heartbeat interval.
    pub fn visibility_timeout_secs(&self) -> i64 {
        self.heartbeat.interval_in_seconds * 2
    }

    pub fn validate(&self) -> Result<(), Vec<FieldIssue>> {
        let mut issues = Vec::new();
        if self.heartbeat.interval_in_seconds < 60 {
            issues.push(FieldIssue::new(
                "heartbeat.interval_in_seconds",
                "must be at least 60",
            ));
        }
        if self.heartbeat.miss_until_inactive < 0 {
            issues.push(FieldIssue::new(
                "heartbeat.miss_until_inactive",
                "must be zero or greater",
            ));
        }
        if self.retry.attempts < 1 {
            issues.push(FieldIssue::new("retry.attempts", "must be at least 1"));
        }
        if self.retry.delay_in_seconds < 1 {
            issues.push(FieldIssue::new(
                "retry.delay_in_seconds",
                "must be at least 1",
            ));
        }
        if self.retry.max_jitter_in_seconds < 0 {
            issues.push(FieldIssue::new(
                "retry.max_jitter_in_seconds",
                "must be zero or greater",
            ));
        }
        if self.executor.bulk_size < 1 {
            issues.push(FieldIssue::new("executor.bulk_size", "must be at least 1"));
        }
        if self.executor.bulk_throttle_time_in_ms < 0 {
            issues.push(FieldIssue::new(
                "executor.bulk_throttle_time_in_ms",
                "must be zero or greater",
            ));
        }
        for (i, expr) in self.executor.scheduler_cron.iter().enumerate() {
            if expr.split_whitespace().count() != 5 {
                issues.push(FieldIssue::new(
                    format!("executor.scheduler_cron[{i}]"),
                    "must be a five-field cron expression",
                ));
            }
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

/// Parse an arbitrary JSON document into a validated config.
pub fn parse_strict(value: &serde_json::Value) -> ApiResult<ScanAgentConfig> {
    let config: ScanAgentConfig = serde_json::from_value(value.clone())
        .map_err(|e| ApiError::validation(format!("invalid scan agent config: {e}")))?;
    config.validate().map_err(|issues| {
        ApiError::validation("scan agent config failed validation").with_details(issues)
    })?;
    Ok(config)
}

#[derive(sqlx::FromRow)]
struct ConfigRow {
    version: i64,
    config: String,
}

/// Current global configuration and its version.
pub async fn current(pool: &SqlitePool) -> ApiResult<(i64, ScanAgentConfig)> {
    let row = sqlx::query_as::<_, ConfigRow>(
        "SELECT version, config FROM agent_config ORDER BY version DESC LIMIT 1",
    )
    .fetch_one(pool)
    .await?;
    let config = serde_json::from_str(&row.config)
        .map_err(|e| ApiError::internal(format!("corrupt stored agent config: {e}")))?;
    Ok((row.version, config))
}

/// Validate and append a new global version. Versions only move forward.
pub async fn put_global(
    pool: &SqlitePool,
    value: &serde_json::Value,
    now: DateTime<Utc>,
) -> ApiResult<i64> {
    let config = parse_strict(value)?;
    let serialized = serde_json::to_string(&config)
        .map_err(|e| ApiError::internal(format!("serialize agent config: {e}")))?;
    let inserted = sqlx::query("INSERT INTO agent_config (config, created_at) VALUES (?, ?)")
        .bind(serialized)
        .bind(now)
        .execute(pool)
        .await?;
    let version = inserted.last_insert_rowid();
    info!(version, "scan agent config updated");
    Ok(version)
}

/// Re-append the current global document, bumping the version. Used when a
/// per-agent override changes so the affected agent observes
/// `config_updated` on its next heartbeat.
pub async fn bump_version(pool: &SqlitePool, now: DateTime<Utc>) -> ApiResult<i64> {
    let (_, config) = current(pool).await?;
    let serialized = serde_json::to_string(&config)
        .map_err(|e| ApiError::internal(format!("serialize agent config: {e}")))?;
    let inserted = sqlx::query("INSERT INTO agent_config (config, created_at) VALUES (?, ?)")
        .bind(serialized)
        .bind(now)
        .execute(pool)
        .await?;
    Ok(inserted.last_insert_rowid())
}

/// Effective configuration for one agent: its validated override when
/// present, otherwise the global document. The version is always the global
/// version.
pub async fn merged_for_agent(
    pool: &SqlitePool,
    agent: &AgentRow,
) -> ApiResult<(i64, ScanAgentConfig)> {
    let (version, global) = current(pool).await?;
    match agent.config_override.as_deref() {
        Some(raw) => {
            let config = serde_json::from_str(raw).map_err(|e| {
                ApiError::internal(format!(
                    "corrupt config override for agent {}: {e}",
                    agent.agent_id
                ))
            })?;
            Ok((version, config))
        }
        None => Ok((version, global)),
    }
}
