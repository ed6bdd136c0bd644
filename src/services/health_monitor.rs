//! Active worker health monitoring.
//!
//! A background loop probes every configured worker's health endpoint and
//! records the outcome in `worker_health`. Dispatch reads that table (via
//! the availability gate) instead of probing inline, so admission latency
//! never pays for a slow worker.

use std::time::{Duration, Instant};

use sqlx::PgPool;

use crate::config::WorkerEndpoint;
use crate::models::worker::{HealthReport, WorkerStatus};
use crate::AppState;

/// Outcome of probing one worker.
#[derive(Debug)]
struct ProbeOutcome {
    status: WorkerStatus,
    response_time_ms: Option<i64>,
    error_message: Option<String>,
}

/// Run the probe loop forever. Spawned once at startup.
pub async fn run(state: AppState) {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(state.config.health_probe_interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        probe_all(&state).await;
    }
}

/// Probe every configured worker once and persist the outcomes.
pub async fn probe_all(state: &AppState) {
    for worker in &state.config.workers {
        let outcome = probe(
            &state.http,
            worker,
            &state.config.worker_token,
            state.config.health_probe_timeout_secs,
            state.config.health_sla_latency_ms,
        )
        .await;
        if let Err(e) = record_outcome(&state.db, &worker.name, &outcome).await {
            tracing::error!(worker = %worker.name, error = %e, "Failed to persist health probe");
        }
    }
}

async fn probe(
    http: &reqwest::Client,
    worker: &WorkerEndpoint,
    token: &str,
    timeout_secs: u64,
    sla_latency_ms: i64,
) -> ProbeOutcome {
    let started = Instant::now();
    let mut response = http
        .get(format!("{}/health", worker.base_url))
        .header("X-Worker-Token", token)
        .timeout(Duration::from_secs(timeout_secs))
        .send()
        .await;

    // Older worker builds expose /status instead of /health.
    if let Ok(resp) = &response {
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            response = http
                .get(format!("{}/status", worker.base_url))
                .header("X-Worker-Token", token)
                .timeout(Duration::from_secs(timeout_secs))
                .send()
                .await;
        }
    }

    let elapsed_ms = started.elapsed().as_millis() as i64;
    match response {
        Ok(resp) if resp.status().is_success() => {
            let status = if elapsed_ms <= sla_latency_ms {
                WorkerStatus::Online
            } else {
                WorkerStatus::Degraded
            };
            ProbeOutcome {
                status,
                response_time_ms: Some(elapsed_ms),
                error_message: None,
            }
        }
        Ok(resp) => ProbeOutcome {
            status: WorkerStatus::Offline,
            response_time_ms: Some(elapsed_ms),
            error_message: Some(format!("health endpoint returned {}", resp.status())),
        },
        Err(e) => ProbeOutcome {
            status: WorkerStatus::Offline,
            response_time_ms: None,
            error_message: Some(e.to_string()),
        },
    }
}

async fn record_outcome(
    pool: &PgPool,
    worker_name: &str,
    outcome: &ProbeOutcome,
) -> Result<(), sqlx::Error> {
    let previous: Option<(WorkerStatus,)> =
        sqlx::query_as("SELECT status FROM worker_health WHERE worker_name = $1")
            .bind(worker_name)
            .fetch_optional(pool)
            .await?;

    let succeeded = matches!(outcome.status, WorkerStatus::Online | WorkerStatus::Degraded);
    sqlx::query(
        "INSERT INTO worker_health
             (worker_name, status, last_check_at, last_success_at, response_time_ms, error_message)
         VALUES ($1, $2, NOW(), CASE WHEN $3 THEN NOW() END, $4, $5)
         ON CONFLICT (worker_name) DO UPDATE SET
             status = EXCLUDED.status,
             last_check_at = EXCLUDED.last_check_at,
             last_success_at = COALESCE(EXCLUDED.last_success_at, worker_health.last_success_at),
             response_time_ms = EXCLUDED.response_time_ms,
             error_message = EXCLUDED.error_message",
    )
    .bind(worker_name)
    .bind(outcome.status)
    .bind(succeeded)
    .bind(outcome.response_time_ms)
    .bind(&outcome.error_message)
    .execute(pool)
    .await?;

    match previous {
        Some((prev,)) if prev != outcome.status => {
            tracing::info!(
                worker_name,
                from = ?prev,
                to = ?outcome.status,
                response_time_ms = outcome.response_time_ms,
                "Worker health transition"
            );
        }
        None => {
            tracing::info!(worker_name, status = ?outcome.status, "Worker health first observation");
        }
        _ => {}
    }
    Ok(())
}

/// Persist a health report pushed by a worker or external scheduler.
///
/// The push channel is an audit trail only; the live state machine is owned
/// by the active probe loop above.
pub async fn record_report(pool: &PgPool, report: &HealthReport) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO worker_health_log
             (worker_name, status, healthy, response_time_ms, tools, error_message, reported_at)
         VALUES ($1, $2, $3, $4, $5, $6, COALESCE($7, NOW()))",
    )
    .bind(&report.worker)
    .bind(&report.status)
    .bind(report.healthy)
    .bind(report.response_time)
    .bind(&report.tools)
    .bind(&report.error)
    .bind(report.timestamp)
    .execute(pool)
    .await?;
    tracing::debug!(worker = %report.worker, healthy = report.healthy, "Recorded pushed health report");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sla_classify(elapsed_ms: i64, sla: i64) -> WorkerStatus {
        if elapsed_ms <= sla {
            WorkerStatus::Online
        } else {
            WorkerStatus::Degraded
        }
    }

    #[test]
    fn latency_within_sla_is_online() {
        assert_eq!(sla_classify(150, 2000), WorkerStatus::Online);
        assert_eq!(sla_classify(2000, 2000), WorkerStatus::Online);
    }

    #[test]
    fn latency_over_sla_is_degraded() {
        assert_eq!(sla_classify(2001, 2000), WorkerStatus::Degraded);
    }

    #[tokio::test]
    async fn unreachable_worker_probes_offline() {
        let http = reqwest::Client::new();
        let worker = WorkerEndpoint {
            name: "maigret".to_string(),
            // Port 1 is never listening.
            base_url: "http://127.0.0.1:1".to_string(),
        };
        let outcome = probe(&http, &worker, "token", 1, 2000).await;
        assert_eq!(outcome.status, WorkerStatus::Offline);
        assert!(outcome.error_message.is_some());
        assert!(outcome.response_time_ms.is_none());
    }

}
