pub mod agent_config;
pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod liveness;
pub mod models;
pub mod registry;
pub mod scans;
pub mod validation;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::ControllerConfig;

#[derive(Clone)]
pub struct AppState {
    pub pool: sqlx::SqlitePool,
    pub config: Arc<ControllerConfig>,
    pub started_at: DateTime<Utc>,
}
