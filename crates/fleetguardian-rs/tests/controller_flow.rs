use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use fleetguardian_rs::agent_config;
use fleetguardian_rs::db;
use fleetguardian_rs::error::ErrorCode;
use fleetguardian_rs::ingest;
use fleetguardian_rs::jobs::{self, state::JobState};
use fleetguardian_rs::liveness;
use fleetguardian_rs::models::{
    AgentPatch, AgentRow, CreateScanRequest, FinalizeOutcome, FinalizeRequest, HeartbeatRequest,
    LivenessState, NvtPayload, ResultBatch, ResultPayload, ScanAgentRef, ScanStatus, TargetSpec,
    VtSelection,
};
use fleetguardian_rs::registry;
use fleetguardian_rs::scans;
use fleetguardian_rs::validation::ResultRange;

const AGENT_A: &str = "11111111-1111-4111-8111-111111111111";
const AGENT_B: &str = "22222222-2222-4222-8222-222222222222";
const SSH_OID: &str = "1.3.6.1.4.1.25623.1.0.10662";

// Matches the default config: interval 600, one missed window.
const VISIBILITY_SECS: i64 = 1200;
const MAX_ATTEMPTS: i64 = 3;
const BACKOFF_BASE: i64 = 60;
const UNCLAIMED_EXPIRY: i64 = 86_400;
const INACTIVE_AFTER: i64 = 86_400;

async fn setup() -> SqlitePool {
    db::create_test_pool().await.expect("in-memory pool")
}

fn heartbeat_request(agent_id: &str, hostname: &str) -> HeartbeatRequest {
    HeartbeatRequest {
        agent_id: agent_id.to_string(),
        hostname: hostname.to_string(),
        operating_system: Some("Ubuntu 22.04 LTS".to_string()),
        architecture: Some("amd64".to_string()),
        agent_version: Some("1.0.0".to_string()),
        updater_version: None,
        ip_addresses: vec!["192.168.1.100".to_string()],
        config_version_seen: None,
    }
}

fn authorize_patch() -> AgentPatch {
    AgentPatch {
        authorized: Some(true),
        update_to_latest: None,
        config: None,
    }
}

async fn register_and_authorize(
    pool: &SqlitePool,
    agent_id: &str,
    hostname: &str,
    now: DateTime<Utc>,
) -> AgentRow {
    registry::heartbeat(pool, &heartbeat_request(agent_id, hostname), now)
        .await
        .expect("heartbeat");
    registry::apply_patch(pool, agent_id, &authorize_patch(), now)
        .await
        .expect("authorize");
    registry::get_agent(pool, agent_id)
        .await
        .expect("lookup")
        .expect("agent exists")
}

fn scan_request(agent_ids: &[&str]) -> CreateScanRequest {
    CreateScanRequest {
        vts: vec![VtSelection {
            vt_id: SSH_OID.to_string(),
            preferences: None,
        }],
        agents: agent_ids
            .iter()
            .map(|id| ScanAgentRef {
                agent_id: id.to_string(),
                hostname: None,
            })
            .collect(),
        targets: vec![TargetSpec {
            hosts: "localhost".to_string(),
            ports: Some("1-65535".to_string()),
            credentials: None,
        }],
        scanner_preferences: None,
    }
}

fn ssh_batch(job_id: &str, scan_id: &str, agent_id: &str, batch_sequence: i64) -> ResultBatch {
    ResultBatch {
        job_id: job_id.to_string(),
        scan_id: scan_id.to_string(),
        agent_id: agent_id.to_string(),
        batch_sequence,
        results: vec![ResultPayload {
            nvt: NvtPayload {
                oid: SSH_OID.to_string(),
                name: Some("OpenSSH Obsolete Version Detection".to_string()),
                severity: 5.0,
                cvss_base_vector: None,
            },
            host: "localhost".to_string(),
            port: Some("22/tcp".to_string()),
            threat: "Medium".to_string(),
            description: Some("The remote SSH server is obsolete.".to_string()),
            qod: Some(80),
        }],
    }
}

fn full_range() -> ResultRange {
    ResultRange {
        start: 0,
        limit: 100,
    }
}

#[tokio::test]
async fn happy_path_single_agent_scan() {
    let pool = setup().await;
    let now = Utc::now();

    // First heartbeat registers unauthorized.
    let hb = registry::heartbeat(&pool, &heartbeat_request(AGENT_A, "server1"), now)
        .await
        .unwrap();
    assert!(!hb.authorized);
    assert_eq!(hb.status, "accepted");

    let agent = register_and_authorize(&pool, AGENT_A, "server1", now).await;
    assert!(agent.authorized);
    assert_eq!(agent.liveness(), LivenessState::Online);

    let created = scans::create_scan(&pool, &scan_request(&[AGENT_A]), now)
        .await
        .unwrap();
    assert_eq!(created.status, ScanStatus::Queued);
    assert_eq!(created.agents_assigned, 1);

    let claimed = jobs::claim_jobs(&pool, &agent, VISIBILITY_SECS, 5, now)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    let job = &claimed[0];
    assert_eq!(job.attempts, 1);
    assert_eq!(job.scan_id, created.scan_id);

    let received = ingest::submit_results(
        &pool,
        &job.job_id,
        &ssh_batch(&job.job_id, &created.scan_id, AGENT_A, 0),
        VISIBILITY_SECS,
        now,
    )
    .await
    .unwrap();
    assert_eq!(received, 1);

    let finalized = ingest::finalize(
        &pool,
        &job.job_id,
        AGENT_A,
        &FinalizeRequest {
            outcome: FinalizeOutcome::Completed,
            summary: None,
        },
        now,
    )
    .await
    .unwrap();
    assert_eq!(finalized, JobState::Completed);

    let status = scans::status_view(&pool, &created.scan_id).await.unwrap();
    assert_eq!(status.status, ScanStatus::Completed);
    assert_eq!(status.progress, 100);
    assert_eq!(status.agents_total, 1);
    assert_eq!(status.agents_completed, 1);
    assert_eq!(status.agents_failed, 0);
    // Declared OIDs and agents come back exactly as submitted.
    assert_eq!(status.vts, vec![SSH_OID.to_string()]);
    assert_eq!(status.agents, vec![AGENT_A.to_string()]);

    let page = scans::results_page(&pool, &created.scan_id, full_range())
        .await
        .unwrap();
    assert_eq!(page.total_results, 1);
    assert_eq!(page.returned_results, 1);
    let result = &page.results[0];
    assert_eq!(result.agent_id, AGENT_A);
    assert_eq!(result.agent_hostname, "server1");
    assert_eq!(result.nvt.oid, SSH_OID);
    assert_eq!(result.threat, "Medium");
    assert_eq!(result.port, "22/tcp");
}

#[tokio::test]
async fn unauthorized_agent_never_sees_queued_work() {
    let pool = setup().await;
    let now = Utc::now();

    // Fresh agent with nothing queued.
    registry::heartbeat(&pool, &heartbeat_request(AGENT_A, "server1"), now)
        .await
        .unwrap();
    let fresh = registry::get_agent(&pool, AGENT_A).await.unwrap().unwrap();
    let claimed = jobs::claim_jobs(&pool, &fresh, VISIBILITY_SECS, 5, now)
        .await
        .unwrap();
    assert!(claimed.is_empty());

    // Authorized agent accumulates a job, then authorization is revoked:
    // the queued job must stay invisible.
    register_and_authorize(&pool, AGENT_A, "server1", now).await;
    scans::create_scan(&pool, &scan_request(&[AGENT_A]), now)
        .await
        .unwrap();
    registry::apply_patch(
        &pool,
        AGENT_A,
        &AgentPatch {
            authorized: Some(false),
            update_to_latest: None,
            config: None,
        },
        now,
    )
    .await
    .unwrap();

    let revoked = registry::get_agent(&pool, AGENT_A).await.unwrap().unwrap();
    assert_eq!(revoked.liveness(), LivenessState::Pending);
    let claimed = jobs::claim_jobs(&pool, &revoked, VISIBILITY_SECS, 5, now)
        .await
        .unwrap();
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn lease_expiry_redelivers_same_job() {
    let pool = setup().await;
    let now = Utc::now();

    let agent = register_and_authorize(&pool, AGENT_A, "server1", now).await;
    let created = scans::create_scan(&pool, &scan_request(&[AGENT_A]), now)
        .await
        .unwrap();

    let first = jobs::claim_jobs(&pool, &agent, VISIBILITY_SECS, 5, now)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].attempts, 1);

    // Agent goes silent past the lease.
    let after_lease = now + Duration::seconds(2 * VISIBILITY_SECS);
    let stats = jobs::reclaim_expired(&pool, MAX_ATTEMPTS, BACKOFF_BASE, UNCLAIMED_EXPIRY, after_lease)
        .await
        .unwrap();
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.expired, 0);

    // Next poll (after the backoff window) re-delivers the same job_id.
    let after_backoff = after_lease + Duration::seconds(BACKOFF_BASE + 1);
    let second = jobs::claim_jobs(&pool, &agent, VISIBILITY_SECS, 5, after_backoff)
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].job_id, first[0].job_id);
    assert_eq!(second[0].attempts, 2);

    let status = scans::status_view(&pool, &created.scan_id).await.unwrap();
    assert_eq!(status.status, ScanStatus::Running);
}

#[tokio::test]
async fn lease_expiry_exhausts_into_expired() {
    let pool = setup().await;
    let mut now = Utc::now();

    let agent = register_and_authorize(&pool, AGENT_A, "server1", now).await;
    let created = scans::create_scan(&pool, &scan_request(&[AGENT_A]), now)
        .await
        .unwrap();

    for attempt in 0..MAX_ATTEMPTS {
        // Step past any requeue backoff from the previous round.
        now = now + Duration::seconds(BACKOFF_BASE * 128);
        let claimed = jobs::claim_jobs(&pool, &agent, VISIBILITY_SECS, 5, now)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts, attempt + 1);

        now = now + Duration::seconds(2 * VISIBILITY_SECS);
        jobs::reclaim_expired(&pool, MAX_ATTEMPTS, BACKOFF_BASE, UNCLAIMED_EXPIRY, now)
            .await
            .unwrap();
    }

    let status = scans::status_view(&pool, &created.scan_id).await.unwrap();
    assert_eq!(status.status, ScanStatus::Failed);
    assert_eq!(status.agents_failed, 1);
    assert_eq!(status.progress, 100);
}

#[tokio::test]
async fn partial_failure_still_completes_scan() {
    let pool = setup().await;
    let now = Utc::now();

    let agent_a = register_and_authorize(&pool, AGENT_A, "server1", now).await;
    register_and_authorize(&pool, AGENT_B, "server2", now).await;

    let created = scans::create_scan(&pool, &scan_request(&[AGENT_A, AGENT_B]), now)
        .await
        .unwrap();
    assert_eq!(created.agents_assigned, 2);

    let claimed = jobs::claim_jobs(&pool, &agent_a, VISIBILITY_SECS, 5, now)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    let job = &claimed[0];

    ingest::submit_results(
        &pool,
        &job.job_id,
        &ssh_batch(&job.job_id, &created.scan_id, AGENT_A, 0),
        VISIBILITY_SECS,
        now,
    )
    .await
    .unwrap();
    ingest::finalize(
        &pool,
        &job.job_id,
        AGENT_A,
        &FinalizeRequest {
            outcome: FinalizeOutcome::Completed,
            summary: None,
        },
        now,
    )
    .await
    .unwrap();

    // B never polls; its job ages out after 24h.
    let after_day = now + Duration::seconds(UNCLAIMED_EXPIRY + 1);
    let stats = jobs::reclaim_expired(&pool, MAX_ATTEMPTS, BACKOFF_BASE, UNCLAIMED_EXPIRY, after_day)
        .await
        .unwrap();
    assert_eq!(stats.expired, 1);

    let status = scans::status_view(&pool, &created.scan_id).await.unwrap();
    assert_eq!(status.status, ScanStatus::Completed);
    assert_eq!(status.progress, 100);
    assert_eq!(status.agents_completed, 1);
    assert_eq!(status.agents_failed, 1);

    let page = scans::results_page(&pool, &created.scan_id, full_range())
        .await
        .unwrap();
    assert_eq!(page.total_results, 1);
    assert!(page.results.iter().all(|r| r.agent_id == AGENT_A));
}

#[tokio::test]
async fn liveness_demotion_and_recovery() {
    let pool = setup().await;
    let t0 = Utc::now();

    register_and_authorize(&pool, AGENT_A, "server1", t0).await;
    let agent = registry::get_agent(&pool, AGENT_A).await.unwrap().unwrap();
    assert_eq!(agent.liveness(), LivenessState::Online);

    // interval 600 * (1 + miss 1) = 1200s of allowed silence.
    let transitions = liveness::sweep(&pool, INACTIVE_AFTER, t0 + Duration::seconds(1200))
        .await
        .unwrap();
    assert_eq!(transitions, 0, "within the window nothing changes");

    let transitions = liveness::sweep(&pool, INACTIVE_AFTER, t0 + Duration::seconds(1201))
        .await
        .unwrap();
    assert_eq!(transitions, 1);
    let agent = registry::get_agent(&pool, AGENT_A).await.unwrap().unwrap();
    assert_eq!(agent.liveness(), LivenessState::Offline);

    // Idempotent: same instant, no writes.
    let transitions = liveness::sweep(&pool, INACTIVE_AFTER, t0 + Duration::seconds(1201))
        .await
        .unwrap();
    assert_eq!(transitions, 0);

    let transitions = liveness::sweep(&pool, INACTIVE_AFTER, t0 + Duration::seconds(INACTIVE_AFTER + 1))
        .await
        .unwrap();
    assert_eq!(transitions, 1);
    let agent = registry::get_agent(&pool, AGENT_A).await.unwrap().unwrap();
    assert_eq!(agent.liveness(), LivenessState::Inactive);

    // Any heartbeat restores online.
    let later = t0 + Duration::seconds(INACTIVE_AFTER + 100);
    registry::heartbeat(&pool, &heartbeat_request(AGENT_A, "server1"), later)
        .await
        .unwrap();
    let agent = registry::get_agent(&pool, AGENT_A).await.unwrap().unwrap();
    assert_eq!(agent.liveness(), LivenessState::Online);
}

#[tokio::test]
async fn heartbeat_timestamps_are_monotonic() {
    let pool = setup().await;
    let now = Utc::now();

    registry::heartbeat(&pool, &heartbeat_request(AGENT_A, "server1"), now)
        .await
        .unwrap();
    let first = registry::get_agent(&pool, AGENT_A).await.unwrap().unwrap();

    // A delayed heartbeat with an older wall clock must not move time back.
    registry::heartbeat(
        &pool,
        &heartbeat_request(AGENT_A, "server1"),
        now - Duration::seconds(300),
    )
    .await
    .unwrap();
    let second = registry::get_agent(&pool, AGENT_A).await.unwrap().unwrap();
    assert_eq!(second.last_heartbeat, first.last_heartbeat);

    registry::heartbeat(
        &pool,
        &heartbeat_request(AGENT_A, "server1"),
        now + Duration::seconds(300),
    )
    .await
    .unwrap();
    let third = registry::get_agent(&pool, AGENT_A).await.unwrap().unwrap();
    assert!(third.last_heartbeat > second.last_heartbeat);
}

#[tokio::test]
async fn config_propagation_round_trip() {
    let pool = setup().await;
    let now = Utc::now();

    register_and_authorize(&pool, AGENT_A, "server1", now).await;

    // Heartbeat reports the seeded version; nothing new.
    let mut req = heartbeat_request(AGENT_A, "server1");
    req.config_version_seen = Some(1);
    let hb = registry::heartbeat(&pool, &req, now).await.unwrap();
    assert!(!hb.config_updated);
    assert_eq!(hb.next_heartbeat_in_seconds, 600);

    // Admin shortens the interval.
    let mut doc = serde_json::to_value(agent_config::ScanAgentConfig::default()).unwrap();
    doc["heartbeat"]["interval_in_seconds"] = serde_json::json!(300);
    let version = agent_config::put_global(&pool, &doc, now).await.unwrap();
    assert_eq!(version, 2);

    let hb = registry::heartbeat(&pool, &req, now + Duration::seconds(1))
        .await
        .unwrap();
    assert!(hb.config_updated);
    assert_eq!(hb.next_heartbeat_in_seconds, 300);

    // The agent fetches the config and acknowledges the version.
    let agent = registry::get_agent(&pool, AGENT_A).await.unwrap().unwrap();
    let (fetched_version, merged) = agent_config::merged_for_agent(&pool, &agent).await.unwrap();
    assert_eq!(fetched_version, 2);
    assert_eq!(merged.heartbeat.interval_in_seconds, 300);
    registry::record_config_seen(&pool, AGENT_A, fetched_version)
        .await
        .unwrap();

    let mut req = heartbeat_request(AGENT_A, "server1");
    req.config_version_seen = Some(2);
    let hb = registry::heartbeat(&pool, &req, now + Duration::seconds(2))
        .await
        .unwrap();
    assert!(!hb.config_updated);
}

#[tokio::test]
async fn duplicate_batches_are_idempotent() {
    let pool = setup().await;
    let now = Utc::now();

    let agent = register_and_authorize(&pool, AGENT_A, "server1", now).await;
    let created = scans::create_scan(&pool, &scan_request(&[AGENT_A]), now)
        .await
        .unwrap();
    let claimed = jobs::claim_jobs(&pool, &agent, VISIBILITY_SECS, 5, now)
        .await
        .unwrap();
    let job = &claimed[0];

    let batch = ssh_batch(&job.job_id, &created.scan_id, AGENT_A, 0);
    ingest::submit_results(&pool, &job.job_id, &batch, VISIBILITY_SECS, now)
        .await
        .unwrap();
    ingest::submit_results(&pool, &job.job_id, &batch, VISIBILITY_SECS, now)
        .await
        .unwrap();

    let page = scans::results_page(&pool, &created.scan_id, full_range())
        .await
        .unwrap();
    assert_eq!(page.total_results, 1, "re-sent batch persists nothing new");
}

#[tokio::test]
async fn double_finalize_returns_conflict() {
    let pool = setup().await;
    let now = Utc::now();

    let agent = register_and_authorize(&pool, AGENT_A, "server1", now).await;
    let created = scans::create_scan(&pool, &scan_request(&[AGENT_A]), now)
        .await
        .unwrap();
    let claimed = jobs::claim_jobs(&pool, &agent, VISIBILITY_SECS, 5, now)
        .await
        .unwrap();
    let job = &claimed[0];
    ingest::submit_results(
        &pool,
        &job.job_id,
        &ssh_batch(&job.job_id, &created.scan_id, AGENT_A, 0),
        VISIBILITY_SECS,
        now,
    )
    .await
    .unwrap();

    let finalize = FinalizeRequest {
        outcome: FinalizeOutcome::Completed,
        summary: None,
    };
    ingest::finalize(&pool, &job.job_id, AGENT_A, &finalize, now)
        .await
        .unwrap();
    let err = ingest::finalize(&pool, &job.job_id, AGENT_A, &finalize, now)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Conflict);
    assert!(err.message.contains("already_finalized"));

    let status = scans::status_view(&pool, &created.scan_id).await.unwrap();
    assert_eq!(status.agents_completed, 1);
}

#[tokio::test]
async fn completed_finalize_requires_results() {
    let pool = setup().await;
    let now = Utc::now();

    let agent = register_and_authorize(&pool, AGENT_A, "server1", now).await;
    scans::create_scan(&pool, &scan_request(&[AGENT_A]), now)
        .await
        .unwrap();
    let claimed = jobs::claim_jobs(&pool, &agent, VISIBILITY_SECS, 5, now)
        .await
        .unwrap();
    let job = &claimed[0];

    let err = ingest::finalize(
        &pool,
        &job.job_id,
        AGENT_A,
        &FinalizeRequest {
            outcome: FinalizeOutcome::Completed,
            summary: None,
        },
        now,
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationError);

    // A bare failure report is fine.
    let state = ingest::finalize(
        &pool,
        &job.job_id,
        AGENT_A,
        &FinalizeRequest {
            outcome: FinalizeOutcome::Failed,
            summary: Some("executor crashed".to_string()),
        },
        now,
    )
    .await
    .unwrap();
    assert_eq!(state, JobState::Failed);
}

#[tokio::test]
async fn malformed_batches_are_rejected_whole() {
    let pool = setup().await;
    let now = Utc::now();

    let agent = register_and_authorize(&pool, AGENT_A, "server1", now).await;
    let created = scans::create_scan(&pool, &scan_request(&[AGENT_A]), now)
        .await
        .unwrap();
    let claimed = jobs::claim_jobs(&pool, &agent, VISIBILITY_SECS, 5, now)
        .await
        .unwrap();
    let job = &claimed[0];

    let mut batch = ssh_batch(&job.job_id, &created.scan_id, AGENT_A, 0);
    batch.results.push(ResultPayload {
        nvt: NvtPayload {
            oid: "1.2.3.bad".to_string(),
            name: None,
            severity: 10.1,
            cvss_base_vector: None,
        },
        host: "localhost".to_string(),
        port: None,
        threat: "Severe".to_string(),
        description: None,
        qod: Some(101),
    });

    let err = ingest::submit_results(&pool, &job.job_id, &batch, VISIBILITY_SECS, now)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationError);
    assert!(err.details.len() >= 4);

    // The valid first entry was not persisted either.
    let page = scans::results_page(&pool, &created.scan_id, full_range())
        .await
        .unwrap();
    assert_eq!(page.total_results, 0);
}

#[tokio::test]
async fn scan_creation_rejects_bad_agents_atomically() {
    let pool = setup().await;
    let now = Utc::now();

    register_and_authorize(&pool, AGENT_A, "server1", now).await;

    // Unknown agent.
    let err = scans::create_scan(&pool, &scan_request(&[AGENT_A, AGENT_B]), now)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationError);

    // Registered but unauthorized agent.
    registry::heartbeat(&pool, &heartbeat_request(AGENT_B, "server2"), now)
        .await
        .unwrap();
    let err = scans::create_scan(&pool, &scan_request(&[AGENT_A, AGENT_B]), now)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationError);

    // Nothing was half-created for the good agent.
    let agent = registry::get_agent(&pool, AGENT_A).await.unwrap().unwrap();
    let claimed = jobs::claim_jobs(&pool, &agent, VISIBILITY_SECS, 5, now)
        .await
        .unwrap();
    assert!(claimed.is_empty());

    // Malformed OID rejects too.
    let mut bad_oid = scan_request(&[AGENT_A]);
    bad_oid.vts[0].vt_id = "1.2.3.bad".to_string();
    let err = scans::create_scan(&pool, &bad_oid, now).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationError);

    // Unrecognized scanner preference rejects.
    let mut bad_pref = scan_request(&[AGENT_A]);
    bad_pref.scanner_preferences = Some(
        [("warp_speed".to_string(), "11".to_string())]
            .into_iter()
            .collect(),
    );
    let err = scans::create_scan(&pool, &bad_pref, now).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationError);
}

#[tokio::test]
async fn deleted_agent_gets_deregistered_then_forgotten() {
    let pool = setup().await;
    let now = Utc::now();

    let agent = register_and_authorize(&pool, AGENT_A, "server1", now).await;
    let created = scans::create_scan(&pool, &scan_request(&[AGENT_A]), now)
        .await
        .unwrap();
    let claimed = jobs::claim_jobs(&pool, &agent, VISIBILITY_SECS, 5, now)
        .await
        .unwrap();
    let job = &claimed[0];

    assert!(registry::soft_delete(&pool, AGENT_A, now).await.unwrap());

    // Submission for the held job now fails with NOT_FOUND.
    let err = ingest::submit_results(
        &pool,
        &job.job_id,
        &ssh_batch(&job.job_id, &created.scan_id, AGENT_A, 0),
        VISIBILITY_SECS,
        now,
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);

    // Deletion canceled the outstanding job, which resolves the scan.
    let status = scans::status_view(&pool, &created.scan_id).await.unwrap();
    assert_eq!(status.status, ScanStatus::Failed);
    assert_eq!(status.agents_failed, 1);

    // Next heartbeat receives the one terminal signal, then the row is gone.
    let hb = registry::heartbeat(&pool, &heartbeat_request(AGENT_A, "server1"), now)
        .await
        .unwrap();
    assert_eq!(hb.status, "deregistered");
    assert!(!hb.authorized);
    assert!(registry::get_agent(&pool, AGENT_A).await.unwrap().is_none());

    // Heartbeating again starts a fresh, unauthorized registration.
    let hb = registry::heartbeat(&pool, &heartbeat_request(AGENT_A, "server1"), now)
        .await
        .unwrap();
    assert_eq!(hb.status, "accepted");
    assert!(!hb.authorized);
    let reborn = registry::get_agent(&pool, AGENT_A).await.unwrap().unwrap();
    assert_eq!(reborn.liveness(), LivenessState::Pending);
}

#[tokio::test]
async fn canceled_scan_accepts_results_until_lease_lapses() {
    let pool = setup().await;
    let now = Utc::now();

    let agent = register_and_authorize(&pool, AGENT_A, "server1", now).await;
    let created = scans::create_scan(&pool, &scan_request(&[AGENT_A]), now)
        .await
        .unwrap();
    let claimed = jobs::claim_jobs(&pool, &agent, VISIBILITY_SECS, 5, now)
        .await
        .unwrap();
    let job = &claimed[0];

    let view = scans::cancel_scan(&pool, &created.scan_id, now).await.unwrap();
    assert_eq!(view.status, ScanStatus::Canceled);

    // Work already done still lands while the lease is live.
    let received = ingest::submit_results(
        &pool,
        &job.job_id,
        &ssh_batch(&job.job_id, &created.scan_id, AGENT_A, 0),
        VISIBILITY_SECS,
        now + Duration::seconds(10),
    )
    .await
    .unwrap();
    assert_eq!(received, 1);

    // After the lease lapses, the same submission is rejected explicitly.
    let late = now + Duration::seconds(VISIBILITY_SECS + 1);
    let err = ingest::submit_results(
        &pool,
        &job.job_id,
        &ssh_batch(&job.job_id, &created.scan_id, AGENT_A, 1),
        VISIBILITY_SECS,
        late,
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::Conflict);

    // Canceling again is success-equivalent.
    let view = scans::cancel_scan(&pool, &created.scan_id, late).await.unwrap();
    assert_eq!(view.status, ScanStatus::Canceled);
}

#[tokio::test]
async fn concurrent_claims_never_duplicate_jobs() {
    let pool = setup().await;
    let now = Utc::now();

    let agent = register_and_authorize(&pool, AGENT_A, "server1", now).await;
    for _ in 0..3 {
        scans::create_scan(&pool, &scan_request(&[AGENT_A]), now)
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        let agent = agent.clone();
        handles.push(tokio::spawn(async move {
            jobs::claim_jobs(&pool, &agent, VISIBILITY_SECS, 5, Utc::now())
                .await
                .unwrap()
        }));
    }

    let mut seen = std::collections::HashSet::new();
    let mut total = 0usize;
    for handle in handles {
        for job in handle.await.unwrap() {
            total += 1;
            assert!(seen.insert(job.job_id.clone()), "job delivered twice");
        }
    }
    assert_eq!(total, 3);
    assert_eq!(seen.len(), 3);
}

#[tokio::test]
async fn startup_recovery_rederives_scan_state() {
    let pool = setup().await;
    let now = Utc::now();

    let agent = register_and_authorize(&pool, AGENT_A, "server1", now).await;
    let created = scans::create_scan(&pool, &scan_request(&[AGENT_A]), now)
        .await
        .unwrap();
    let claimed = jobs::claim_jobs(&pool, &agent, VISIBILITY_SECS, 5, now)
        .await
        .unwrap();
    let job = &claimed[0];
    ingest::submit_results(
        &pool,
        &job.job_id,
        &ssh_batch(&job.job_id, &created.scan_id, AGENT_A, 0),
        VISIBILITY_SECS,
        now,
    )
    .await
    .unwrap();
    ingest::finalize(
        &pool,
        &job.job_id,
        AGENT_A,
        &FinalizeRequest {
            outcome: FinalizeOutcome::Completed,
            summary: None,
        },
        now,
    )
    .await
    .unwrap();

    // Wipe the rollup as if the process had crashed mid-update.
    sqlx::query(
        "UPDATE scans SET status = 'running', progress = 0, agents_completed = 0 WHERE scan_id = ?",
    )
    .bind(&created.scan_id)
    .execute(&pool)
    .await
    .unwrap();

    scans::recover(&pool, now).await.unwrap();

    let status = scans::status_view(&pool, &created.scan_id).await.unwrap();
    assert_eq!(status.status, ScanStatus::Completed);
    assert_eq!(status.progress, 100);
    assert_eq!(status.agents_completed, 1);
}

#[tokio::test]
async fn per_agent_override_changes_merged_config() {
    let pool = setup().await;
    let now = Utc::now();

    register_and_authorize(&pool, AGENT_A, "server1", now).await;

    let mut override_doc = serde_json::to_value(agent_config::ScanAgentConfig::default()).unwrap();
    override_doc["heartbeat"]["interval_in_seconds"] = serde_json::json!(900);
    registry::apply_patch(
        &pool,
        AGENT_A,
        &AgentPatch {
            authorized: None,
            update_to_latest: None,
            config: Some(override_doc),
        },
        now,
    )
    .await
    .unwrap();

    let agent = registry::get_agent(&pool, AGENT_A).await.unwrap().unwrap();
    let (version, merged) = agent_config::merged_for_agent(&pool, &agent).await.unwrap();
    assert_eq!(merged.heartbeat.interval_in_seconds, 900);
    // Override writes move the global version forward so the agent hears
    // about it on the next heartbeat.
    assert_eq!(version, 2);

    // An invalid override is rejected outright.
    let err = registry::apply_patch(
        &pool,
        AGENT_A,
        &AgentPatch {
            authorized: None,
            update_to_latest: None,
            config: Some(serde_json::json!({"heartbeat": {"interval_in_seconds": 30}})),
        },
        now,
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationError);
}

#[tokio::test]
async fn admin_listing_filters_and_orders() {
    let pool = setup().await;
    let now = Utc::now();

    register_and_authorize(&pool, AGENT_A, "web-01", now).await;
    registry::heartbeat(
        &pool,
        &heartbeat_request(AGENT_B, "db-01"),
        now + Duration::seconds(10),
    )
    .await
    .unwrap();

    let all = registry::list_agents(
        &pool,
        &registry::AgentListFilter {
            limit: 100,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(all.len(), 2);
    // Most recent heartbeat first.
    assert_eq!(all[0].agent_id, AGENT_B);

    let authorized = registry::list_agents(
        &pool,
        &registry::AgentListFilter {
            authorized: Some(true),
            limit: 100,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(authorized.len(), 1);
    assert_eq!(authorized[0].agent_id, AGENT_A);

    let by_prefix = registry::list_agents(
        &pool,
        &registry::AgentListFilter {
            hostname_prefix: Some("db-".to_string()),
            limit: 100,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(by_prefix.len(), 1);
    assert_eq!(by_prefix[0].hostname, "db-01");

    let pending = registry::list_agents(
        &pool,
        &registry::AgentListFilter {
            liveness: Some(LivenessState::Pending),
            limit: 100,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].agent_id, AGENT_B);
}
