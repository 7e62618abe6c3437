use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use fleetguardian_rs::{api, config::ControllerConfig, db, jobs, liveness, scans, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Arc::new(ControllerConfig::load()?);

    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;

    // The coordinator is stateless across restarts; rollups come back from
    // job rows before any traffic is served.
    scans::recover(&pool, Utc::now())
        .await
        .map_err(|e| anyhow::anyhow!("scan recovery failed: {e}"))?;

    let shutdown = CancellationToken::new();
    let reclaimer = tokio::spawn(jobs::reclaimer_loop(
        pool.clone(),
        config.clone(),
        shutdown.clone(),
    ));
    let monitor = tokio::spawn(liveness::monitor_loop(
        pool.clone(),
        config.clone(),
        shutdown.clone(),
    ));

    let state = AppState {
        pool,
        config: config.clone(),
        started_at: Utc::now(),
    };
    let app = api::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "FleetGuardian-RS controller listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    let _ = reclaimer.await;
    let _ = monitor.await;
    info!("controller stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    shutdown.cancel();
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();
}
