//! Scan admission: quota check, worker selection, job creation, dispatch.
//!
//! Admission is synchronous and fail-fast. A caller is turned away before
//! any row is written when the tenant is over quota or no eligible worker
//! can take the subject; once a job row exists it always reaches a
//! well-defined status (running or failed) before the response returns.

use std::time::Duration;

use uuid::Uuid;
use validator::Validate;

use crate::config::WorkerEndpoint;
use crate::errors::AppError;
use crate::models::scan_job::{AdmitResponse, CreateScanRequest, JobStatus, SubjectType};
use crate::services::{circuit_breaker, ingestion, rate_limiter, retry};
use crate::AppState;

/// Default worker set per subject type. Intersected with the configured
/// endpoints at admission time, so deployments expose only what they run.
pub fn workers_for_subject(subject_type: SubjectType) -> &'static [&'static str] {
    match subject_type {
        SubjectType::Username => &["maigret", "whatsmyname", "gosearch"],
        SubjectType::Email => &["hibp", "dehashed", "clearbit", "fullcontact"],
        SubjectType::Domain => &["urlscan", "securitytrails", "shodan", "virustotal"],
        SubjectType::Phone => &["fullcontact"],
    }
}

/// Admit one scan request end-to-end.
pub async fn admit_scan(
    state: &AppState,
    req: &CreateScanRequest,
) -> Result<AdmitResponse, AppError> {
    req.validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let decision = rate_limiter::try_admit(
        &state.redis,
        &req.tenant_id.to_string(),
        "scan_hourly",
        rate_limiter::LimitSpec {
            max_allowed: state.config.scan_limit_max,
            window_secs: state.config.scan_limit_window_secs,
        },
    )
    .await;
    if let rate_limiter::Decision::Denied { reset_at, message } = decision {
        tracing::info!(tenant_id = %req.tenant_id, %message, "Scan admission rate limited");
        return Err(AppError::RateLimited { reset_at });
    }

    let eligible = select_workers(state, req.subject_type).await?;

    let job_id: Uuid = {
        let mut tx = state.db.begin().await?;
        let (job_id,): (Uuid,) = sqlx::query_as(
            "INSERT INTO scan_jobs (tenant_id, subject_type, subject_value, status)
             VALUES ($1, $2, $3, 'queued')
             RETURNING id",
        )
        .bind(req.tenant_id)
        .bind(req.subject_type)
        .bind(&req.subject_value)
        .fetch_one(&mut *tx)
        .await?;

        for worker in &eligible {
            sqlx::query(
                "INSERT INTO scan_job_workers (job_id, worker_name, pending)
                 VALUES ($1, $2, TRUE)",
            )
            .bind(job_id)
            .bind(&worker.name)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        job_id
    };

    let mut dispatched = Vec::new();
    for worker in &eligible {
        match dispatch(state, job_id, worker, &req.subject_value).await {
            Ok(()) => {
                sqlx::query(
                    "UPDATE scan_job_workers SET triggered_at = NOW()
                     WHERE job_id = $1 AND worker_name = $2",
                )
                .bind(job_id)
                .bind(&worker.name)
                .execute(&state.db)
                .await?;
                circuit_breaker::record_success(&state.db, &worker.name).await?;
                dispatched.push(worker.name.clone());
            }
            Err(e) => {
                tracing::warn!(%job_id, worker = %worker.name, error = %e, "Dispatch failed");
                // A loud dispatch failure ends the leg here; pending legs
                // are reserved for workers that still owe a final callback,
                // and the watchdog for dispatches that vanished silently.
                sqlx::query(
                    "UPDATE scan_job_workers SET pending = FALSE, dispatch_error = $3
                     WHERE job_id = $1 AND worker_name = $2",
                )
                .bind(job_id)
                .bind(&worker.name)
                .bind(e.to_string())
                .execute(&state.db)
                .await?;
                circuit_breaker::record_failure(&state.db, &worker.name).await?;
            }
        }
    }

    let status = if dispatched.is_empty() {
        sqlx::query(
            "UPDATE scan_jobs SET status = 'failed', error = $2, finished_at = NOW()
             WHERE id = $1 AND status = 'queued'",
        )
        .bind(job_id)
        .bind("all worker dispatches failed")
        .execute(&state.db)
        .await?;
        JobStatus::Failed
    } else {
        sqlx::query("UPDATE scan_jobs SET status = 'running' WHERE id = $1 AND status = 'queued'")
            .bind(job_id)
            .execute(&state.db)
            .await?;

        // A fast worker may have delivered its final batch before the
        // promotion above; the completion check cannot be left to a webhook
        // that already came and went.
        if ingestion::finish_if_complete(&state.db, job_id).await? {
            tracing::info!(%job_id, "All worker legs completed during admission");
        }

        let (status,): (JobStatus,) =
            sqlx::query_as("SELECT status FROM scan_jobs WHERE id = $1")
                .bind(job_id)
                .fetch_one(&state.db)
                .await?;
        status
    };

    tracing::info!(
        %job_id,
        tenant_id = %req.tenant_id,
        subject_type = %req.subject_type,
        dispatched = dispatched.len(),
        ?status,
        "Scan admitted"
    );

    Ok(AdmitResponse {
        job_id,
        status,
        dispatched_workers: dispatched,
    })
}

/// Candidate workers for the subject that are configured and pass the
/// availability gate. Empty result is a 503 with the denial reasons.
async fn select_workers(
    state: &AppState,
    subject_type: SubjectType,
) -> Result<Vec<WorkerEndpoint>, AppError> {
    let mut eligible = Vec::new();
    let mut denials = Vec::new();

    for name in workers_for_subject(subject_type) {
        let Some(endpoint) = state.config.worker(name) else {
            continue;
        };
        let availability = circuit_breaker::is_available(&state.db, name, &state.config).await?;
        if availability.is_available() {
            eligible.push(endpoint.clone());
        } else {
            denials.push(format!("{name}: {}", availability.reason()));
        }
    }

    if eligible.is_empty() {
        let detail = if denials.is_empty() {
            format!("no worker configured for subject type {subject_type}")
        } else {
            denials.join("; ")
        };
        return Err(AppError::WorkerUnavailable(detail));
    }
    Ok(eligible)
}

/// Trigger one worker with bounded retries. The worker acknowledges the
/// trigger synchronously and streams results back via the webhook later.
async fn dispatch(
    state: &AppState,
    job_id: Uuid,
    worker: &WorkerEndpoint,
    subject_value: &str,
) -> Result<(), retry::RetryError> {
    let url = dispatch_url(
        &worker.base_url,
        subject_value,
        job_id,
        &state.config.callback_base_url,
    )
    .map_err(retry::RetryError::Terminal)?;

    let policy = retry::RetryPolicy {
        max_attempts: state.config.dispatch_max_attempts,
        ..retry::RetryPolicy::default()
    };
    let timeout = Duration::from_secs(state.config.dispatch_timeout_secs);

    retry::invoke(&policy, |_attempt| {
        let url = url.clone();
        async move {
            let response = state
                .http
                .get(url)
                .header("X-Worker-Token", &state.config.worker_token)
                .timeout(timeout)
                .send()
                .await
                .map_err(retry::RetryError::from)?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(retry::RetryError::from_status(
                    status.as_u16(),
                    &worker.name,
                ))
            }
        }
    })
    .await
}

/// Build the worker trigger URL with the subject as a path segment and the
/// callback target as query parameters.
fn dispatch_url(
    base_url: &str,
    subject_value: &str,
    job_id: Uuid,
    callback_base_url: &str,
) -> Result<reqwest::Url, String> {
    let mut url =
        reqwest::Url::parse(base_url).map_err(|e| format!("bad worker url {base_url}: {e}"))?;
    url.path_segments_mut()
        .map_err(|_| format!("worker url {base_url} cannot take a path"))?
        .pop_if_empty()
        .push("scan")
        .push(subject_value);
    url.query_pairs_mut()
        .append_pair(
            "callback",
            &format!("{callback_base_url}/api/v1/webhooks/results"),
        )
        .append_pair("job_id", &job_id.to_string());
    Ok(url)
}
