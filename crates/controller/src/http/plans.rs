use axum::extract::{Path, Query, State};
use axum::http::header::{ETAG, IF_NONE_MATCH};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::info;

use common::api::{PlanArtifact, PlanSchedule, UpgradePlan, UpgradeReport};

use crate::app_state::AppState;
use crate::auth;
use crate::error::{ApiResult, AppError};
use crate::http::map_store_error;
use crate::persistence::PlanInput;

#[derive(Debug, Deserialize)]
pub(crate) struct PlanQuery {
    #[serde(default)]
    channel: String,
}

/// `GET /api/agent/v1/upgrade/plan`: conditional plan delivery.
pub(crate) async fn fetch_plan(
    State(state): State<AppState>,
    Query(query): Query<PlanQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let agent_id = auth::require_agent_identity(&headers, state.cfg.agent_auth_mode)?;

    let (plan, etag) = state
        .store
        .fetch_upgrade_plan(&agent_id, &query.channel)
        .await
        .map_err(map_store_error)?;

    if let Some(candidate) = headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        if candidate == etag {
            counter!("controller_plan_fetches_total", "result" => "not_modified").increment(1);
            return Ok(StatusCode::NOT_MODIFIED.into_response());
        }
    }

    counter!("controller_plan_fetches_total", "result" => "fresh").increment(1);
    Ok(plan_response(&plan, &etag))
}

/// `POST /api/agent/v1/upgrade/report`.
pub(crate) async fn submit_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut report): Json<UpgradeReport>,
) -> ApiResult<StatusCode> {
    // The authenticated identity wins over whatever the body claims.
    report.agent_id = auth::require_agent_identity(&headers, state.cfg.agent_auth_mode)?;

    state
        .store
        .record_upgrade_report(report)
        .await
        .map_err(map_store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpsertPlanRequest {
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    channel: String,
    artifact: PlanArtifact,
    #[serde(default)]
    schedule: PlanSchedule,
    #[serde(default)]
    paused: bool,
    #[serde(default)]
    notes: String,
}

/// `POST /api/admin/v1/upgrade/plan`.
pub(crate) async fn admin_upsert_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UpsertPlanRequest>,
) -> ApiResult<Response> {
    auth::require_admin(&headers, &state.cfg.admin_bearer_token)?;

    let input = PlanInput {
        agent_id: req.agent_id,
        channel: req.channel,
        version: req.artifact.version,
        artifact_url: req.artifact.url,
        artifact_sha256: req.artifact.sha256,
        signature_url: req.artifact.signature_url,
        force_apply: req.artifact.force_apply,
        schedule_earliest: req.schedule.earliest,
        schedule_latest: req.schedule.latest,
        paused: req.paused,
        notes: req.notes,
    };

    let (plan, etag) = state
        .store
        .upsert_upgrade_plan(input)
        .await
        .map_err(map_store_error)?;

    info!(
        agent_key = %plan.agent_id,
        channel = %plan.channel,
        version = %plan.artifact.version,
        paused = plan.paused,
        "upgrade plan upserted"
    );
    counter!("controller_plan_upserts_total").increment(1);
    Ok(plan_response(&plan, &etag))
}

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryQuery {
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct HistoryResponse {
    agent_id: String,
    items: Vec<UpgradeReport>,
}

/// `GET /api/admin/v1/upgrade/history/{agent_id}`.
pub(crate) async fn admin_history(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<HistoryResponse>> {
    auth::require_admin(&headers, &state.cfg.admin_bearer_token)?;
    if agent_id.trim().is_empty() {
        return Err(AppError::bad_request("agent_id required"));
    }

    let items = state
        .store
        .list_upgrade_history(&agent_id, query.limit.unwrap_or(0))
        .await
        .map_err(map_store_error)?;
    Ok(Json(HistoryResponse { agent_id, items }))
}

/// `GET /api/admin/v1/settings/notifications`.
pub(crate) async fn get_notification_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<common::api::NotificationSettings>> {
    auth::require_admin(&headers, &state.cfg.admin_bearer_token)?;
    let settings = state
        .store
        .get_notification_settings()
        .await
        .map_err(map_store_error)?;
    Ok(Json(settings))
}

#[derive(Debug, Deserialize)]
pub(crate) struct NotificationUpdateRequest {
    notify_on_publish: Option<bool>,
}

/// `POST /api/admin/v1/settings/notifications`.
pub(crate) async fn update_notification_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<NotificationUpdateRequest>,
) -> ApiResult<Json<common::api::NotificationSettings>> {
    auth::require_admin(&headers, &state.cfg.admin_bearer_token)?;
    let notify = req
        .notify_on_publish
        .ok_or_else(|| AppError::bad_request("notify_on_publish is required"))?;
    let settings = state
        .store
        .update_notification_settings(notify)
        .await
        .map_err(map_store_error)?;
    Ok(Json(settings))
}

fn plan_response(plan: &UpgradePlan, etag: &str) -> Response {
    let mut response = Json(plan).into_response();
    if let Ok(value) = HeaderValue::from_str(etag) {
        response.headers_mut().insert(ETAG, value);
    }
    response
}
