use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::{DateTime, Duration, Utc};
use flow_common::{DenialReason, WorkItemId, WorkItemType};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::aggregator::AggregatorHandle;
use super::aggregator::exposition::ExternalCounters;
use super::engine::ApplyOutcome;
use super::ingress::ColumnAliases;
use super::ingress::direct::DirectApi;
use super::ingress::sync::SyncHandle;
use super::ingress::webhook::{IngressCounters, WebhookAdapter, WebhookPayload};
use super::query::QueryFacade;
use super::registry::StageRegistry;
use super::runtime::FlowRuntime;
use crate::errors::FlowError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub query: QueryFacade,
    pub direct: DirectApi,
    pub webhook: Arc<WebhookAdapter>,
    pub registry: Arc<StageRegistry>,
    pub aggregator: AggregatorHandle,
    pub aliases: Arc<ColumnAliases>,
    pub counters: Arc<IngressCounters>,
    pub sync: Option<SyncHandle>,
}

impl AppState {
    pub fn from_runtime(runtime: &FlowRuntime) -> Self {
        Self {
            query: runtime.query.clone(),
            direct: runtime.direct.clone(),
            webhook: runtime.webhook.clone(),
            registry: runtime.registry.clone(),
            aggregator: runtime.engine.aggregator().clone(),
            aliases: runtime.aliases.clone(),
            counters: runtime.counters.clone(),
            sync: runtime.sync.clone(),
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateWorkItemRequest {
    pub title: String,
    #[serde(rename = "type", default)]
    pub item_type: Option<WorkItemType>,
}

#[derive(Deserialize)]
pub struct TransitionBody {
    pub to_stage: String,
    pub expected_stage: Option<String>,
}

#[derive(Deserialize)]
pub struct MetricsParams {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub days: Option<u32>,
    pub stage: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct SyncRequest {
    /// All configured boards when absent.
    pub board_id: Option<String>,
}

#[derive(serde::Serialize)]
pub struct SyncResponse {
    pub status: &'static str,
    pub checked: usize,
    pub synced_count: usize,
    pub failed_count: usize,
    pub details: Vec<String>,
}

const DEFAULT_METRICS_DAYS: u32 = 7;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Flow(FlowError),
    Denied(DenialReason),
    Malformed(String),
}

impl From<FlowError> for ApiError {
    fn from(err: FlowError) -> Self {
        Self::Flow(err)
    }
}

fn status_of(err: &FlowError) -> StatusCode {
    match err {
        FlowError::WorkItemNotFound { .. } | FlowError::StageNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        FlowError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        FlowError::Conflict(_) => StatusCode::CONFLICT,
        FlowError::TransientStorage(_) | FlowError::DeadlineExceeded(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        FlowError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        FlowError::Upstream(_) => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Flow(err) => {
                let status = status_of(&err);
                if status.is_server_error() {
                    tracing::error!(error = %err, kind = err.kind().as_str(), "Request failed");
                }
                let body = serde_json::json!({
                    "error_kind": err.kind().as_str(),
                    "error": err.to_string(),
                });
                (status, Json(body)).into_response()
            }
            ApiError::Denied(reason) => {
                let status = match reason {
                    DenialReason::UnknownTarget => StatusCode::NOT_FOUND,
                    _ => StatusCode::CONFLICT,
                };
                let body = serde_json::json!({
                    "error_kind": "policy_denial",
                    "error": format!("Transition denied: {}", reason),
                    "reason": reason,
                });
                (status, Json(body)).into_response()
            }
            ApiError::Malformed(msg) => {
                let body = serde_json::json!({
                    "error_kind": "validation",
                    "error": msg,
                });
                (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response()
            }
        }
    }
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::Malformed(format!("Invalid JSON body: {}", e)))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .route("/metrics", get(scrape_metrics))
        .route("/api/v1/stages", get(list_stages))
        .route("/api/v1/stages/reload", post(reload_stages))
        .route("/api/v1/stages/{name}/items", get(items_in_stage))
        .route("/api/v1/policy", get(get_policy))
        .route("/api/v1/work-items", post(create_work_item))
        .route("/api/v1/work-items/{id}", get(get_work_item))
        .route("/api/v1/work-items/{id}/transition", put(transition_work_item))
        .route("/api/v1/work-items/{id}/history", get(work_item_history))
        .route("/api/v1/metrics", get(flow_metrics))
        .route("/api/v1/focalboard/webhook", post(focalboard_webhook))
        .route("/api/v1/focalboard/sync", post(focalboard_sync))
        .route("/api/v1/focalboard/stages/mapping", get(stage_mapping))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn ready_check(State(state): State<SharedState>) -> Response {
    match state.query.ready().await {
        Ok(()) => Json(serde_json::json!({"status": "ready"})).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"status": "unavailable", "error": err.to_string()})),
            )
                .into_response()
        }
    }
}

async fn scrape_metrics(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let counters = ExternalCounters {
        dropped_notifications: 0,
        webhook_events: state.counters.snapshot(),
    };
    let text = state
        .aggregator
        .render(counters)
        .await
        .map_err(FlowError::Storage)?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        text,
    ))
}

async fn list_stages(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.query.stages())
}

async fn reload_stages(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let count = state
        .registry
        .reload()
        .await
        .map_err(FlowError::from_storage)?;
    Ok(Json(serde_json::json!({"stages": count})))
}

async fn items_in_stage(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.query.items_in(&name).await?))
}

async fn get_policy(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.query.policy())
}

async fn create_work_item(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: CreateWorkItemRequest = parse_json(&body)?;
    let item = state
        .direct
        .create_work_item(&req.title, req.item_type.unwrap_or(WorkItemType::Task))
        .await?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn get_work_item(
    State(state): State<SharedState>,
    Path(id): Path<WorkItemId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.query.work_item(id).await?))
}

async fn transition_work_item(
    State(state): State<SharedState>,
    Path(id): Path<WorkItemId>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: TransitionBody = parse_json(&body)?;
    let outcome = state
        .direct
        .transition(id, &req.to_stage, req.expected_stage.as_deref())
        .await?;
    match outcome {
        ApplyOutcome::Denied { reason } => Err(ApiError::Denied(reason)),
        outcome => Ok(Json(outcome)),
    }
}

async fn work_item_history(
    State(state): State<SharedState>,
    Path(id): Path<WorkItemId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.query.history(id).await?))
}

async fn flow_metrics(
    State(state): State<SharedState>,
    Query(params): Query<MetricsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let end = params.end.unwrap_or_else(Utc::now);
    let start = match params.start {
        Some(start) => start,
        None => {
            let days = params.days.unwrap_or(DEFAULT_METRICS_DAYS);
            end.checked_sub_signed(Duration::days(i64::from(days)))
                .ok_or_else(|| {
                    FlowError::Validation(format!(
                        "days={} reaches before the earliest representable time",
                        days
                    ))
                })?
        }
    };
    let metrics = state
        .query
        .metrics(start, end, params.stage.as_deref())
        .await?;
    Ok(Json(metrics))
}

async fn focalboard_webhook(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let payload: WebhookPayload = parse_json(&body)?;
    let card_id = payload.card.id.clone();
    let action = payload.action.clone();
    match state.webhook.handle(payload).await {
        Ok(outcome) => Ok(Json(serde_json::json!({
            "status": "success",
            "message": format!("Webhook processed: {}", action),
            "card_id": card_id,
            "result": outcome,
        }))),
        // Redelivery cannot fix a failing upstream; acknowledge it.
        Err(FlowError::Upstream(msg)) => Ok(Json(serde_json::json!({
            "status": "ignored",
            "message": msg,
            "card_id": card_id,
        }))),
        Err(err) => Err(err.into()),
    }
}

async fn focalboard_sync(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: SyncRequest = if body.is_empty() {
        SyncRequest::default()
    } else {
        parse_json(&body)?
    };
    let Some(sync) = &state.sync else {
        return Err(FlowError::Upstream("board sync is not configured".into()).into());
    };
    let report = sync.trigger(req.board_id).await?;
    Ok(Json(SyncResponse {
        status: "completed",
        checked: report.checked,
        synced_count: report.synced,
        failed_count: report.failed,
        details: report.details,
    }))
}

async fn stage_mapping(State(state): State<SharedState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "column_to_stage": state.aliases.entries(),
        "description": "Map of Focalboard column names (lowercase) to stage names",
    }))
}
