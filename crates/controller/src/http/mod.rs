use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::error;

use crate::app_state::AppState;
use crate::error::AppError;
use crate::persistence::StoreError;

mod artifacts;
mod plans;

pub(crate) use artifacts::{download_artifact, upload_artifact};
pub(crate) use plans::{
    admin_history, admin_upsert_plan, fetch_plan, get_notification_settings, submit_report,
    update_notification_settings,
};

pub(crate) fn map_store_error(err: StoreError) -> AppError {
    match err {
        StoreError::PlanNotFound => AppError::not_found("plan not found"),
        StoreError::InvalidInput(msg) => AppError::bad_request(msg),
        StoreError::Other(err) => {
            crate::telemetry::record_internal_error_metrics(&err);
            error!(?err, "plan store error");
            AppError::internal("internal server error")
        }
    }
}

pub(crate) async fn healthz() -> StatusCode {
    StatusCode::OK
}

pub(crate) async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics_handle.render()
}
