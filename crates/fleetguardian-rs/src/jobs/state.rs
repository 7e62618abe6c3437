use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Job lifecycle states. A job is pinned to one agent at creation and walks
/// `queued -> assigned -> running -> terminal`; terminal rows are frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Expired,
    Canceled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Assigned => "assigned",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Expired => "expired",
            JobState::Canceled => "canceled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Expired | JobState::Canceled
        )
    }

    /// States in which a visibility lease is held.
    pub fn is_leased(self) -> bool {
        matches!(self, JobState::Assigned | JobState::Running)
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "assigned" => Ok(JobState::Assigned),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "expired" => Ok(JobState::Expired),
            "canceled" => Ok(JobState::Canceled),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive job transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    /// Delivered to the agent with a fresh visibility lease.
    Claim,
    /// First result batch accepted.
    FirstBatch,
    /// Agent finalized with a successful outcome.
    FinalizeCompleted,
    /// Agent finalized with a failure outcome.
    FinalizeFailed,
    /// Visibility lease lapsed, attempts remain: back to the queue.
    LeaseLapsed,
    /// Visibility lease lapsed with attempts exhausted.
    AttemptsExhausted,
    /// Sat unclaimed past the expiry horizon.
    UnclaimedExpired,
    /// Scan canceled or agent deleted.
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal job transition: {state} on {event:?}")]
pub struct IllegalTransition {
    pub state: JobState,
    pub event: JobEvent,
}

/// Pure transition function. Every persisted state change goes through this
/// so that illegal paths (e.g. `queued` straight to `completed`) cannot be
/// expressed.
pub fn apply(state: JobState, event: JobEvent) -> Result<JobState, IllegalTransition> {
    use JobEvent::*;
    use JobState::*;

    let next = match (state, event) {
        (Queued, Claim) => Assigned,
        (Queued, UnclaimedExpired) => Expired,
        (Queued, Cancel) => Canceled,

        (Assigned, FirstBatch) => Running,
        (Assigned, FinalizeFailed) => Failed,
        (Assigned, LeaseLapsed) => Queued,
        (Assigned, AttemptsExhausted) => Expired,
        (Assigned, Cancel) => Canceled,

        (Running, FinalizeCompleted) => Completed,
        (Running, FinalizeFailed) => Failed,
        (Running, LeaseLapsed) => Queued,
        (Running, AttemptsExhausted) => Expired,
        (Running, Cancel) => Canceled,

        (state, event) => return Err(IllegalTransition { state, event }),
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_walks_every_state() {
        let s = apply(JobState::Queued, JobEvent::Claim).unwrap();
        let s = apply(s, JobEvent::FirstBatch).unwrap();
        let s = apply(s, JobEvent::FinalizeCompleted).unwrap();
        assert_eq!(s, JobState::Completed);
        assert!(s.is_terminal());
    }

    #[test]
    fn queued_cannot_complete_directly() {
        assert!(apply(JobState::Queued, JobEvent::FinalizeCompleted).is_err());
        assert!(apply(JobState::Queued, JobEvent::FirstBatch).is_err());
    }

    #[test]
    fn assigned_cannot_complete_without_results() {
        assert!(apply(JobState::Assigned, JobEvent::FinalizeCompleted).is_err());
        assert_eq!(
            apply(JobState::Assigned, JobEvent::FinalizeFailed).unwrap(),
            JobState::Failed
        );
    }

    #[test]
    fn lease_lapse_requeues_then_expires() {
        let s = apply(JobState::Assigned, JobEvent::LeaseLapsed).unwrap();
        assert_eq!(s, JobState::Queued);
        let s = apply(s, JobEvent::Claim).unwrap();
        let s = apply(s, JobEvent::AttemptsExhausted).unwrap();
        assert_eq!(s, JobState::Expired);
    }

    #[test]
    fn terminal_states_are_frozen() {
        for state in [
            JobState::Completed,
            JobState::Failed,
            JobState::Expired,
            JobState::Canceled,
        ] {
            for event in [
                JobEvent::Claim,
                JobEvent::FirstBatch,
                JobEvent::FinalizeCompleted,
                JobEvent::FinalizeFailed,
                JobEvent::LeaseLapsed,
                JobEvent::AttemptsExhausted,
                JobEvent::UnclaimedExpired,
                JobEvent::Cancel,
            ] {
                assert!(apply(state, event).is_err());
            }
        }
    }

    #[test]
    fn cancel_reaches_terminal_from_any_live_state() {
        for state in [JobState::Queued, JobState::Assigned, JobState::Running] {
            assert_eq!(apply(state, JobEvent::Cancel).unwrap(), JobState::Canceled);
        }
    }
}
