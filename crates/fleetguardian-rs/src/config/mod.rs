use std::{env, fs};

use anyhow::{bail, Context};
use serde::Deserialize;

/// Controller process configuration. Loaded from an optional JSON file
/// (`FLEETGUARDIAN_CONFIG`, default `config.json`), then overridden by
/// environment variables. The credentials have no defaults: a controller
/// without explicit keys refuses to start.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub admin_api_key: String,
    pub agent_auth_token: String,
    /// When unset the Scanner surface is served unauthenticated.
    pub scanner_api_key: Option<String>,
    pub claim_batch_limit: i64,
    pub dispatcher_max_attempts: i64,
    pub retry_backoff_base_secs: i64,
    pub job_unclaimed_expiry_secs: i64,
    pub offline_to_inactive_secs: i64,
    pub reclaim_interval_secs: u64,
    pub liveness_interval_secs: u64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    database_url: Option<String>,
    admin_api_key: Option<String>,
    agent_auth_token: Option<String>,
    scanner_api_key: Option<String>,
    claim_batch_limit: Option<i64>,
    dispatcher_max_attempts: Option<i64>,
    retry_backoff_base_secs: Option<i64>,
    job_unclaimed_expiry_secs: Option<i64>,
    offline_to_inactive_secs: Option<i64>,
    reclaim_interval_secs: Option<u64>,
    liveness_interval_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
}

impl ControllerConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path =
            env::var("FLEETGUARDIAN_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let mut file_cfg: FileConfig = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse config file {path}"))?,
            Err(_) => FileConfig::default(),
        };

        if let Ok(v) = env::var("FG_HOST") {
            file_cfg.host = Some(v);
        }
        if let Ok(v) = env::var("FG_PORT") {
            file_cfg.port = Some(v.parse().context("FG_PORT must be a port number")?);
        }
        if let Ok(v) = env::var("FG_DATABASE_URL") {
            file_cfg.database_url = Some(v);
        }
        if let Ok(v) = env::var("FG_ADMIN_API_KEY") {
            file_cfg.admin_api_key = Some(v);
        }
        if let Ok(v) = env::var("FG_AGENT_AUTH_TOKEN") {
            file_cfg.agent_auth_token = Some(v);
        }
        if let Ok(v) = env::var("FG_SCANNER_API_KEY") {
            file_cfg.scanner_api_key = Some(v);
        }

        let Some(admin_api_key) = file_cfg.admin_api_key else {
            bail!("missing required config: admin_api_key (FG_ADMIN_API_KEY)");
        };
        let Some(agent_auth_token) = file_cfg.agent_auth_token else {
            bail!("missing required config: agent_auth_token (FG_AGENT_AUTH_TOKEN)");
        };
        if admin_api_key.is_empty() || agent_auth_token.is_empty() {
            bail!("credentials must not be empty");
        }

        Ok(Self {
            host: file_cfg.host.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: file_cfg.port.unwrap_or(3001),
            database_url: file_cfg
                .database_url
                .unwrap_or_else(|| "sqlite://fleetguardian.db".to_string()),
            admin_api_key,
            agent_auth_token,
            scanner_api_key: file_cfg.scanner_api_key,
            claim_batch_limit: file_cfg.claim_batch_limit.unwrap_or(5),
            dispatcher_max_attempts: file_cfg.dispatcher_max_attempts.unwrap_or(3),
            retry_backoff_base_secs: file_cfg.retry_backoff_base_secs.unwrap_or(60),
            job_unclaimed_expiry_secs: file_cfg.job_unclaimed_expiry_secs.unwrap_or(86_400),
            offline_to_inactive_secs: file_cfg.offline_to_inactive_secs.unwrap_or(86_400),
            reclaim_interval_secs: file_cfg.reclaim_interval_secs.unwrap_or(60),
            liveness_interval_secs: file_cfg.liveness_interval_secs.unwrap_or(60),
            request_timeout_secs: file_cfg.request_timeout_secs.unwrap_or(30),
        })
    }
}
