//! Incident listing for external alerting collaborators.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::errors::{ApiResponse, AppError};
use crate::models::incident::Incident;
use crate::models::pagination::{PagedResult, Pagination};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct IncidentFilters {
    pub job_id: Option<Uuid>,
    pub incident_type: Option<String>,
}

/// GET /api/v1/incidents — list incidents, newest first.
pub async fn list(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
    Query(filters): Query<IncidentFilters>,
) -> Result<Json<ApiResponse<PagedResult<Incident>>>, AppError> {
    let incidents: Vec<Incident> = sqlx::query_as(
        "SELECT id, job_id, incident_type, message, context, created_at
         FROM incidents
         WHERE ($1::uuid IS NULL OR job_id = $1)
           AND ($2::text IS NULL OR incident_type = $2)
         ORDER BY created_at DESC
         LIMIT $3 OFFSET $4",
    )
    .bind(filters.job_id)
    .bind(&filters.incident_type)
    .bind(pagination.limit())
    .bind(pagination.offset())
    .fetch_all(&state.db)
    .await?;

    let (total,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM incidents
         WHERE ($1::uuid IS NULL OR job_id = $1)
           AND ($2::text IS NULL OR incident_type = $2)",
    )
    .bind(filters.job_id)
    .bind(&filters.incident_type)
    .fetch_one(&state.db)
    .await?;

    Ok(ApiResponse::success(PagedResult::new(
        incidents,
        total,
        &pagination,
    )))
}
