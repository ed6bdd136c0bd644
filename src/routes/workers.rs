//! Worker administration routes: combined health/breaker/policy overview,
//! policy updates, and manual breaker resets.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;

use crate::errors::{ApiResponse, AppError};
use crate::middleware::worker_token::WorkerToken;
use crate::models::worker::{
    CircuitBreakerState, UpdatePolicyRequest, WorkerHealthRecord, WorkerOverview, WorkerPolicy,
    WorkerStatus,
};
use crate::services::circuit_breaker;
use crate::AppState;

/// GET /api/v1/workers — overview of every configured worker.
pub async fn list(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<WorkerOverview>>>, AppError> {
    let now = Utc::now();
    let mut overviews = Vec::with_capacity(state.config.workers.len());

    for worker in &state.config.workers {
        let health: Option<WorkerHealthRecord> = sqlx::query_as(
            "SELECT worker_name, status, last_check_at, last_success_at,
                    response_time_ms, error_message
             FROM worker_health WHERE worker_name = $1",
        )
        .bind(&worker.name)
        .fetch_optional(&state.db)
        .await?;

        let circuit: Option<CircuitBreakerState> = sqlx::query_as(
            "SELECT worker_name, state, failure_count, success_count,
                    failure_threshold, success_threshold, cooldown_ms, opened_at,
                    next_attempt_at, total_trips, updated_at
             FROM circuit_breaker_states WHERE worker_name = $1",
        )
        .bind(&worker.name)
        .fetch_optional(&state.db)
        .await?;

        let policy: Option<WorkerPolicy> = sqlx::query_as(
            "SELECT worker_name, enabled, reason, updated_at
             FROM worker_policies WHERE worker_name = $1",
        )
        .bind(&worker.name)
        .fetch_optional(&state.db)
        .await?;

        let effective_status = health
            .as_ref()
            .map(|h| h.effective_status(now, state.config.health_stale_after_secs))
            .unwrap_or(WorkerStatus::Unknown);

        overviews.push(WorkerOverview {
            worker_name: worker.name.clone(),
            health,
            effective_status,
            circuit,
            policy_enabled: policy.as_ref().map(|p| p.enabled).unwrap_or(true),
            policy_reason: policy.and_then(|p| p.reason),
        });
    }

    Ok(ApiResponse::success(overviews))
}

/// PUT /api/v1/workers/:name/policy — enable or disable a worker
/// administratively, independent of its health.
pub async fn update_policy(
    State(state): State<AppState>,
    _auth: WorkerToken,
    Path(name): Path<String>,
    Json(body): Json<UpdatePolicyRequest>,
) -> Result<Json<ApiResponse<WorkerPolicy>>, AppError> {
    if state.config.worker(&name).is_none() {
        return Err(AppError::NotFound(format!("Worker {name} not configured")));
    }

    let policy: WorkerPolicy = sqlx::query_as(
        "INSERT INTO worker_policies (worker_name, enabled, reason)
         VALUES ($1, $2, $3)
         ON CONFLICT (worker_name) DO UPDATE
             SET enabled = EXCLUDED.enabled, reason = EXCLUDED.reason,
                 updated_at = NOW()
         RETURNING worker_name, enabled, reason, updated_at",
    )
    .bind(&name)
    .bind(body.enabled)
    .bind(&body.reason)
    .fetch_one(&state.db)
    .await?;

    tracing::info!(
        worker_name = %name,
        enabled = policy.enabled,
        reason = ?policy.reason,
        "Worker policy updated"
    );
    Ok(ApiResponse::success(policy))
}

/// POST /api/v1/workers/:name/reset — manually reset a worker's breaker.
pub async fn reset(
    State(state): State<AppState>,
    _auth: WorkerToken,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<&'static str>>, AppError> {
    if state.config.worker(&name).is_none() {
        return Err(AppError::NotFound(format!("Worker {name} not configured")));
    }
    circuit_breaker::reset(&state.db, &name).await?;
    Ok(ApiResponse::success("reset"))
}
