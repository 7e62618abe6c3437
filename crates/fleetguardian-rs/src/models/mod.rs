use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Agent liveness as driven by heartbeats and the monitor sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessState {
    Pending,
    Online,
    Offline,
    Inactive,
    Tombstoned,
}

impl LivenessState {
    pub fn as_str(self) -> &'static str {
        match self {
            LivenessState::Pending => "pending",
            LivenessState::Online => "online",
            LivenessState::Offline => "offline",
            LivenessState::Inactive => "inactive",
            LivenessState::Tombstoned => "tombstoned",
        }
    }
}

impl FromStr for LivenessState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(LivenessState::Pending),
            "online" => Ok(LivenessState::Online),
            "offline" => Ok(LivenessState::Offline),
            "inactive" => Ok(LivenessState::Inactive),
            "tombstoned" => Ok(LivenessState::Tombstoned),
            other => Err(format!("unknown liveness state: {other}")),
        }
    }
}

impl fmt::Display for LivenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl ScanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Queued => "queued",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Canceled
        )
    }
}

impl FromStr for ScanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ScanStatus::Queued),
            "running" => Ok(ScanStatus::Running),
            "completed" => Ok(ScanStatus::Completed),
            "failed" => Ok(ScanStatus::Failed),
            "canceled" => Ok(ScanStatus::Canceled),
            other => Err(format!("unknown scan status: {other}")),
        }
    }
}

/// Threat labels accepted on submitted results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreatLevel {
    Log,
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreatLevel::Log => "Log",
            ThreatLevel::Low => "Low",
            ThreatLevel::Medium => "Medium",
            ThreatLevel::High => "High",
            ThreatLevel::Critical => "Critical",
        }
    }
}

impl FromStr for ThreatLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Log" => Ok(ThreatLevel::Log),
            "Low" => Ok(ThreatLevel::Low),
            "Medium" => Ok(ThreatLevel::Medium),
            "High" => Ok(ThreatLevel::High),
            "Critical" => Ok(ThreatLevel::Critical),
            other => Err(format!("unknown threat label: {other}")),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct AgentRow {
    pub agent_id: String,
    pub hostname: String,
    pub operating_system: String,
    pub architecture: String,
    pub agent_version: String,
    pub updater_version: String,
    pub authorized: bool,
    pub liveness: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
    pub update_to_latest: bool,
    pub config_version_seen: i64,
    pub config_override: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl AgentRow {
    pub fn liveness(&self) -> LivenessState {
        self.liveness.parse().unwrap_or(LivenessState::Pending)
    }

    pub fn is_tombstoned(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScanRow {
    pub scan_id: String,
    pub status: String,
    pub progress: i64,
    pub agents_total: i64,
    pub agents_running: i64,
    pub agents_completed: i64,
    pub agents_failed: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub vts: String,
    pub agents: String,
    pub targets: String,
    pub scanner_preferences: String,
    pub failure_reason: Option<String>,
}

impl ScanRow {
    pub fn status(&self) -> ScanStatus {
        self.status.parse().unwrap_or(ScanStatus::Queued)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub job_id: String,
    pub scan_id: String,
    pub agent_id: String,
    pub status: String,
    pub priority: i64,
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub config: String,
    pub hostname_snapshot: String,
    pub failure_reason: Option<String>,
}

// --- Agent surface wire types ---

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: String,
    pub hostname: String,
    #[serde(default)]
    pub operating_system: Option<String>,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub updater_version: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub config_version_seen: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatResponse {
    pub status: &'static str,
    pub config_updated: bool,
    pub next_heartbeat_in_seconds: i64,
    pub authorized: bool,
}

/// One job as handed to a polling agent.
#[derive(Debug, Clone, Serialize)]
pub struct JobEnvelope {
    pub job_id: String,
    pub scan_id: String,
    pub job_type: &'static str,
    pub priority: i64,
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NvtPayload {
    pub oid: String,
    #[serde(default)]
    pub name: Option<String>,
    pub severity: f64,
    #[serde(default)]
    pub cvss_base_vector: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultPayload {
    pub nvt: NvtPayload,
    pub host: String,
    #[serde(default)]
    pub port: Option<String>,
    pub threat: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub qod: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultBatch {
    pub job_id: String,
    pub scan_id: String,
    pub agent_id: String,
    pub batch_sequence: i64,
    pub results: Vec<ResultPayload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalizeOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FinalizeRequest {
    pub outcome: FinalizeOutcome,
    #[serde(default)]
    pub summary: Option<String>,
}

// --- Scanner surface wire types ---

#[derive(Debug, Clone, Deserialize)]
pub struct VtSelection {
    pub vt_id: String,
    #[serde(default)]
    pub preferences: Option<BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanAgentRef {
    pub agent_id: String,
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetSpec {
    pub hosts: String,
    #[serde(default)]
    pub ports: Option<String>,
    #[serde(default)]
    pub credentials: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateScanRequest {
    pub vts: Vec<VtSelection>,
    pub agents: Vec<ScanAgentRef>,
    pub targets: Vec<TargetSpec>,
    #[serde(default)]
    pub scanner_preferences: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateScanResponse {
    pub scan_id: String,
    pub status: ScanStatus,
    pub agents_assigned: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanStatusView {
    pub scan_id: String,
    pub status: ScanStatus,
    pub progress: i64,
    pub agents_total: i64,
    pub agents_running: i64,
    pub agents_completed: i64,
    pub agents_failed: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Declared VT OIDs, echoed back exactly as submitted.
    pub vts: Vec<String>,
    /// Declared target agent IDs, echoed back exactly as submitted.
    pub agents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NvtView {
    pub oid: String,
    pub name: String,
    pub severity: f64,
    pub cvss_base_vector: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultView {
    pub result_id: String,
    pub agent_id: String,
    pub agent_hostname: String,
    pub nvt: NvtView,
    pub host: String,
    pub port: String,
    pub threat: String,
    pub description: String,
    pub qod: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultsPage {
    pub results: Vec<ResultView>,
    pub total_results: i64,
    pub returned_results: i64,
}

// --- Admin surface wire types ---

#[derive(Debug, Clone, Serialize)]
pub struct AgentView {
    pub agent_id: String,
    pub hostname: String,
    pub authorized: bool,
    pub liveness: LivenessState,
    pub ip_addresses: Vec<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
    pub operating_system: String,
    pub architecture: String,
    pub agent_version: String,
    pub updater_version: String,
    pub update_to_latest: bool,
    pub config_version_seen: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentPatch {
    #[serde(default)]
    pub authorized: Option<bool>,
    #[serde(default)]
    pub update_to_latest: Option<bool>,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatchError {
    pub agent_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatchOutcome {
    pub success: bool,
    pub errors: Vec<PatchError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteAgentsRequest {
    pub agent_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteAgentsResponse {
    pub deleted: i64,
    pub failed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_round_trips_through_strings() {
        for state in [
            LivenessState::Pending,
            LivenessState::Online,
            LivenessState::Offline,
            LivenessState::Inactive,
            LivenessState::Tombstoned,
        ] {
            assert_eq!(state.as_str().parse::<LivenessState>().unwrap(), state);
        }
        assert!("gone".parse::<LivenessState>().is_err());
    }

    #[test]
    fn threat_labels_are_case_sensitive() {
        assert_eq!("Medium".parse::<ThreatLevel>().unwrap(), ThreatLevel::Medium);
        assert!("medium".parse::<ThreatLevel>().is_err());
    }

    #[test]
    fn scan_terminal_states() {
        assert!(ScanStatus::Completed.is_terminal());
        assert!(ScanStatus::Canceled.is_terminal());
        assert!(!ScanStatus::Running.is_terminal());
    }
}
