pub mod admin;
pub mod agent;
pub mod health;
pub mod scanner;

use std::time::Duration;

use axum::{
    error_handling::HandleErrorLayer,
    extract::{DefaultBodyLimit, FromRequest, Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    BoxError, Router,
};
use tower::{timeout::TimeoutLayer, ServiceBuilder};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::auth;
use crate::error::ApiError;
use crate::AppState;

/// Request bodies above this size are rejected before JSON parsing.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// `Json` wrapper whose rejection is the standard error envelope instead of
/// axum's plain-text default.
pub struct AppJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for AppJson<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(AppJson(value)),
            Err(rejection) => Err(ApiError::invalid_request(format!(
                "invalid request body: {rejection}"
            ))),
        }
    }
}

async fn admin_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Err(e) = auth::verify_api_key(req.headers(), &state.config.admin_api_key) {
        return e.into_response();
    }
    next.run(req).await
}

async fn agent_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Err(e) = auth::verify_agent_token(req.headers(), &state.config.agent_auth_token) {
        return e.into_response();
    }
    next.run(req).await
}

/// The Scanner surface is only guarded when a key is configured.
async fn scanner_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Some(expected) = &state.config.scanner_api_key {
        if let Err(e) = auth::verify_api_key(req.headers(), expected) {
            return e.into_response();
        }
    }
    next.run(req).await
}

async fn unknown_route() -> ApiError {
    ApiError::not_found("endpoint does not exist")
}

pub fn build_router(state: AppState) -> Router {
    let scanner = Router::new()
        .route("/scans", post(scanner::create_scan))
        .route("/scans/preferences", get(scanner::preferences))
        .route(
            "/scans/:scan_id",
            post(scanner::scan_action).delete(scanner::delete_scan),
        )
        .route("/scans/:scan_id/status", get(scanner::scan_status))
        .route("/scans/:scan_id/results", get(scanner::scan_results))
        .route_layer(middleware::from_fn_with_state(state.clone(), scanner_auth));

    let admin = Router::new()
        .route(
            "/api/v1/admin/agents",
            get(admin::list_agents).patch(admin::patch_agents),
        )
        .route("/api/v1/admin/agents/delete", post(admin::delete_agents))
        .route(
            "/api/v1/admin/scan-agent-config",
            get(admin::get_scan_agent_config).put(admin::put_scan_agent_config),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_auth));

    let agents = Router::new()
        .route("/api/v1/agents/heartbeat", post(agent::heartbeat))
        .route("/api/v1/agents/config", get(agent::get_config))
        .route("/api/v1/agents/jobs", get(agent::poll_jobs))
        .route(
            "/api/v1/agents/jobs/:job_id/results",
            post(agent::submit_results),
        )
        .route(
            "/api/v1/agents/jobs/:job_id/complete",
            post(agent::complete_job),
        )
        .route("/api/v1/agents/updates", get(agent::updates))
        .route_layer(middleware::from_fn_with_state(state.clone(), agent_auth));

    let health = Router::new()
        .route("/health/alive", get(health::alive))
        .route("/health/ready", get(health::ready))
        .route("/health/started", get(health::started));

    let timeout = state.config.request_timeout_secs;

    Router::new()
        .merge(scanner)
        .merge(admin)
        .merge(agents)
        .merge(health)
        .fallback(unknown_route)
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_middleware_error))
                .layer(TimeoutLayer::new(Duration::from_secs(timeout))),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

async fn handle_middleware_error(err: BoxError) -> ApiError {
    if err.is::<tower::timeout::error::Elapsed>() {
        ApiError::unavailable("request deadline exceeded")
    } else {
        ApiError::internal(format!("unhandled middleware failure: {err}"))
    }
}
