//! Job watchdog: detects scans that claim to be running but never reached
//! a worker, and quarantines them as `stuck` with an incident record.
//!
//! A leg still pending with `triggered_at` NULL past the threshold means the
//! dispatch path reported running without the worker ever acknowledging.
//! Legs closed out with a recorded dispatch error are not silent and do not
//! count. The watchdog is the only writer of the `stuck` status.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::incident::INCIDENT_STUCK_JOB;
use crate::AppState;

/// One job flagged by the stuck-detection query.
#[derive(Debug, sqlx::FromRow)]
pub struct StuckJob {
    pub job_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub untriggered_workers: Vec<String>,
}

/// Counts from one sweep, for logging and tests.
#[derive(Debug, Default, PartialEq)]
pub struct SweepOutcome {
    pub examined: usize,
    pub marked_stuck: u64,
    pub incidents_created: u64,
}

/// Run the sweep loop forever. Spawned once at startup.
pub async fn run(state: AppState) {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(state.config.watchdog_interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match sweep(
            &state.db,
            state.config.watchdog_stuck_threshold_minutes,
            state.config.watchdog_batch_limit,
        )
        .await
        {
            Ok(outcome) if outcome.examined > 0 => {
                tracing::info!(
                    examined = outcome.examined,
                    marked_stuck = outcome.marked_stuck,
                    incidents_created = outcome.incidents_created,
                    "Watchdog sweep complete"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Watchdog sweep failed"),
        }
    }
}

/// Find running jobs older than the threshold with at least one worker leg
/// that was never triggered. Batch-bounded so one sweep stays cheap.
pub async fn find_stuck_jobs(
    pool: &PgPool,
    threshold_minutes: i64,
    batch_limit: i64,
) -> Result<Vec<StuckJob>, sqlx::Error> {
    sqlx::query_as(
        "SELECT j.id AS job_id, j.created_at,
                ARRAY_AGG(w.worker_name) AS untriggered_workers
         FROM scan_jobs j
         JOIN scan_job_workers w ON w.job_id = j.id
         WHERE j.status = 'running'
           AND w.triggered_at IS NULL
           AND w.pending
           AND j.created_at < NOW() - make_interval(mins => $1::int)
         GROUP BY j.id, j.created_at
         ORDER BY j.created_at
         LIMIT $2",
    )
    .bind(threshold_minutes)
    .bind(batch_limit)
    .fetch_all(pool)
    .await
}

/// One sweep: mark stuck jobs and record exactly one incident per job.
///
/// The incident insert is `ON CONFLICT DO NOTHING` on
/// (job_id, incident_type), so repeated sweeps over the same job are
/// harmless even if a previous sweep died between the two writes.
pub async fn sweep(
    pool: &PgPool,
    threshold_minutes: i64,
    batch_limit: i64,
) -> Result<SweepOutcome, sqlx::Error> {
    let candidates = find_stuck_jobs(pool, threshold_minutes, batch_limit).await?;
    let mut outcome = SweepOutcome {
        examined: candidates.len(),
        ..SweepOutcome::default()
    };

    for job in &candidates {
        let mut tx = pool.begin().await?;

        let marked = sqlx::query(
            "UPDATE scan_jobs SET status = 'stuck', finished_at = NOW(),
                    error = 'watchdog: worker dispatch never acknowledged'
             WHERE id = $1 AND status = 'running'",
        )
        .bind(job.job_id)
        .execute(&mut *tx)
        .await?;
        outcome.marked_stuck += marked.rows_affected();

        let incident = sqlx::query(
            "INSERT INTO incidents (job_id, incident_type, message, context)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (job_id, incident_type) DO NOTHING",
        )
        .bind(job.job_id)
        .bind(INCIDENT_STUCK_JOB)
        .bind(format!(
            "job stuck: workers {} never triggered within {} minutes",
            job.untriggered_workers.join(", "),
            threshold_minutes
        ))
        .bind(serde_json::json!({
            "untriggered_workers": job.untriggered_workers,
            "job_created_at": job.created_at,
            "threshold_minutes": threshold_minutes,
        }))
        .execute(&mut *tx)
        .await?;
        outcome.incidents_created += incident.rows_affected();

        tx.commit().await?;

        if marked.rows_affected() > 0 {
            tracing::warn!(
                job_id = %job.job_id,
                untriggered = ?job.untriggered_workers,
                "Job marked stuck by watchdog"
            );
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_outcome_defaults_to_zero() {
        let outcome = SweepOutcome::default();
        assert_eq!(outcome.examined, 0);
        assert_eq!(outcome.marked_stuck, 0);
        assert_eq!(outcome.incidents_created, 0);
    }
}
