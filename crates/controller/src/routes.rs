use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;
use crate::http;

/// Maximum multipart form size accepted by the artifact upload endpoint.
pub const MAX_UPLOAD_BYTES: usize = 200 * 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    let artifact_route = format!("{}/{{name}}", state.cfg.artifact_route());

    Router::new()
        .route("/api/agent/v1/upgrade/plan", get(http::fetch_plan))
        .route("/api/agent/v1/upgrade/report", post(http::submit_report))
        .route("/api/admin/v1/upgrade/plan", post(http::admin_upsert_plan))
        .route(
            "/api/admin/v1/upgrade/history/{agent_id}",
            get(http::admin_history),
        )
        .route(
            "/api/admin/v1/settings/notifications",
            get(http::get_notification_settings).post(http::update_notification_settings),
        )
        .route(
            "/api/admin/v1/artifacts",
            post(http::upload_artifact).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route(&artifact_route, get(http::download_artifact))
        .route("/healthz", get(http::healthz))
        .route("/metrics", get(http::metrics))
        .with_state(state)
}
