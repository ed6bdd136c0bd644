//! Scan routes: admission, job reads, findings with derived signals, and
//! finding overlay updates.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{ApiResponse, AppError};
use crate::models::finding::{FindingWithOverlay, UpdateOverlayRequest};
use crate::models::pagination::{PagedResult, Pagination};
use crate::models::scan_job::{AdmitResponse, CreateScanRequest, JobStatus, ScanJob};
use crate::services::{admission, signals};
use crate::AppState;

const JOB_COLUMNS: &str = "id, tenant_id, subject_type, subject_value, status, error,
    providers_completed, created_at, last_progress_at, finished_at";

/// POST /api/v1/scans — admit a scan request and dispatch workers.
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateScanRequest>,
) -> Result<Json<ApiResponse<AdmitResponse>>, AppError> {
    let response = admission::admit_scan(&state, &body).await?;
    Ok(ApiResponse::success(response))
}

/// Optional list filters.
#[derive(Debug, Deserialize)]
pub struct ScanFilters {
    pub tenant_id: Option<Uuid>,
    pub status: Option<JobStatus>,
}

/// GET /api/v1/scans — list jobs, newest first.
pub async fn list(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
    Query(filters): Query<ScanFilters>,
) -> Result<Json<ApiResponse<PagedResult<ScanJob>>>, AppError> {
    let jobs: Vec<ScanJob> = sqlx::query_as(&format!(
        "SELECT {JOB_COLUMNS} FROM scan_jobs
         WHERE ($1::uuid IS NULL OR tenant_id = $1)
           AND ($2::job_status IS NULL OR status = $2)
         ORDER BY created_at DESC
         LIMIT $3 OFFSET $4"
    ))
    .bind(filters.tenant_id)
    .bind(filters.status)
    .bind(pagination.limit())
    .bind(pagination.offset())
    .fetch_all(&state.db)
    .await?;

    let (total,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM scan_jobs
         WHERE ($1::uuid IS NULL OR tenant_id = $1)
           AND ($2::job_status IS NULL OR status = $2)",
    )
    .bind(filters.tenant_id)
    .bind(filters.status)
    .fetch_one(&state.db)
    .await?;

    Ok(ApiResponse::success(PagedResult::new(jobs, total, &pagination)))
}

/// GET /api/v1/scans/:id — get one job.
pub async fn get_by_id(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<ScanJob>>, AppError> {
    let job: ScanJob =
        sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM scan_jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&state.db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {id} not found")))?;
    Ok(ApiResponse::success(job))
}

/// Findings read model: joined overlays plus the derived signals block.
#[derive(Debug, Serialize)]
pub struct FindingsView {
    pub findings: Vec<FindingWithOverlay>,
    pub signals: signals::ExposureSignals,
}

/// GET /api/v1/scans/:id/findings — findings for a job with signals.
pub async fn list_findings(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<FindingsView>>, AppError> {
    let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM scan_jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.db)
        .await?;
    if exists.is_none() {
        return Err(AppError::NotFound(format!("Job {id} not found")));
    }

    let findings: Vec<FindingWithOverlay> = sqlx::query_as(
        "SELECT f.id, f.job_id, f.provider, f.kind, f.severity, f.confidence,
                f.evidence, f.meta, f.created_at, o.status AS overlay_status
         FROM findings f
         LEFT JOIN finding_overlays o ON o.finding_id = f.id
         WHERE f.job_id = $1
         ORDER BY f.created_at, f.id",
    )
    .bind(id)
    .fetch_all(&state.db)
    .await?;

    let signals = signals::compute(&findings, Utc::now());
    Ok(ApiResponse::success(FindingsView { findings, signals }))
}

/// PATCH /api/v1/findings/:id/overlay — set the user-facing status overlay.
///
/// The finding row itself is never mutated.
pub async fn update_overlay(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateOverlayRequest>,
) -> Result<Json<ApiResponse<FindingWithOverlay>>, AppError> {
    let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM findings WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.db)
        .await?;
    if exists.is_none() {
        return Err(AppError::NotFound(format!("Finding {id} not found")));
    }

    sqlx::query(
        "INSERT INTO finding_overlays (finding_id, status)
         VALUES ($1, $2)
         ON CONFLICT (finding_id) DO UPDATE
             SET status = EXCLUDED.status, updated_at = NOW()",
    )
    .bind(id)
    .bind(body.status)
    .execute(&state.db)
    .await?;

    let finding: FindingWithOverlay = sqlx::query_as(
        "SELECT f.id, f.job_id, f.provider, f.kind, f.severity, f.confidence,
                f.evidence, f.meta, f.created_at, o.status AS overlay_status
         FROM findings f
         LEFT JOIN finding_overlays o ON o.finding_id = f.id
         WHERE f.id = $1",
    )
    .bind(id)
    .fetch_one(&state.db)
    .await?;

    Ok(ApiResponse::success(finding))
}
