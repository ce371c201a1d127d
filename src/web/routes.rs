//! Control API handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use super::AppState;
use crate::db::{EndpointRecord, RunBlock, RunRecord};
use crate::scheduler::{ControlSource, SchedulerError, SchedulerStatus};

const MAX_LIST_LIMIT: i64 = 500;
const SHOW_ENDPOINT_LIMIT: i64 = 1000;

pub enum ApiError {
    Scheduler(SchedulerError),
    Store(sqlx::Error),
    NotFound,
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        ApiError::Scheduler(e)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Scheduler(e @ SchedulerError::InvalidDelay(_)) => {
                (StatusCode::BAD_REQUEST, e.to_string())
            }
            ApiError::Scheduler(e @ SchedulerError::AlreadyRunning) => {
                (StatusCode::CONFLICT, e.to_string())
            }
            ApiError::Scheduler(SchedulerError::Store(e)) | ApiError::Store(e) => {
                warn!("Control API store error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "storage error".to_string())
            }
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArmRequest {
    pub delay_seconds: i64,
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

#[derive(Debug, Serialize)]
pub struct RunDetail {
    pub run: RunRecord,
    pub blocks: Vec<RunBlock>,
    pub endpoints: Vec<EndpointRecord>,
}

pub async fn scheduler_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SchedulerStatus>, ApiError> {
    Ok(Json(state.scheduler.status().await?))
}

pub async fn scheduler_arm(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ArmRequest>,
) -> Result<Json<SchedulerStatus>, ApiError> {
    let status = state
        .scheduler
        .arm(request.delay_seconds, ControlSource::Dashboard)
        .await?;
    Ok(Json(status))
}

pub async fn scheduler_cancel(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SchedulerStatus>, ApiError> {
    Ok(Json(state.scheduler.cancel(ControlSource::Dashboard).await?))
}

pub async fn scheduler_run_now(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SchedulerStatus>, ApiError> {
    Ok(Json(state.scheduler.run_now(ControlSource::Dashboard).await?))
}

pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<RunRecord>>, ApiError> {
    let limit = query.limit.clamp(1, MAX_LIST_LIMIT);
    Ok(Json(state.db.list_runs(limit).await?))
}

pub async fn show_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<RunDetail>, ApiError> {
    let run = state.db.get_run(&run_id).await?.ok_or(ApiError::NotFound)?;
    let (blocks, endpoints) = tokio::join!(
        state.db.run_blocks(&run_id),
        state.db.run_endpoints(&run_id, SHOW_ENDPOINT_LIMIT)
    );
    Ok(Json(RunDetail {
        run,
        blocks: blocks?,
        endpoints: endpoints?,
    }))
}
