//! Worker callback endpoints: result batch ingestion and pushed health
//! reports. Both require the shared worker token.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::errors::{ApiResponse, AppError};
use crate::middleware::worker_token::WorkerToken;
use crate::models::worker::HealthReport;
use crate::services::{health_monitor, ingestion};
use crate::AppState;

/// Query parameters on the results webhook. `job_id` and `worker` are
/// required; deserialized as options so their absence maps to the standard
/// validation envelope rather than an opaque 400.
#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    pub job_id: Option<Uuid>,
    pub worker: Option<String>,
    #[serde(rename = "final", default)]
    pub is_final: bool,
}

/// POST /api/v1/webhooks/results — ingest one result batch from a worker.
///
/// Body is a JSON object, array, or NDJSON; the token check happens before
/// the body is read.
pub async fn results(
    State(state): State<AppState>,
    _auth: WorkerToken,
    Query(query): Query<ResultsQuery>,
    body: String,
) -> Result<Json<ApiResponse<ingestion::IngestResult>>, AppError> {
    let job_id = query
        .job_id
        .ok_or_else(|| AppError::Validation("job_id query parameter is required".to_string()))?;
    let worker = query
        .worker
        .filter(|w| !w.is_empty())
        .ok_or_else(|| AppError::Validation("worker query parameter is required".to_string()))?;

    let result =
        ingestion::ingest_batch(&state.db, job_id, &worker, query.is_final, &body).await?;
    Ok(ApiResponse::success(result))
}

/// POST /api/v1/webhooks/health — record a pushed worker health report.
pub async fn health_report(
    State(state): State<AppState>,
    _auth: WorkerToken,
    Json(report): Json<HealthReport>,
) -> Result<Json<ApiResponse<&'static str>>, AppError> {
    if report.worker.is_empty() {
        return Err(AppError::Validation("worker name is required".to_string()));
    }
    health_monitor::record_report(&state.db, &report).await?;
    Ok(ApiResponse::success("recorded"))
}
