//! Result ingestion pipeline: raw webhook batches to sequenced lines and
//! deduplicated findings, in one transaction per batch.
//!
//! Per-(job, worker) line numbering must stay monotonic under concurrent
//! deliveries, so each batch takes a transaction-scoped advisory lock on the
//! (job, worker) pair before reading the current high-water mark. Two
//! batches for the same pair serialize; batches for different pairs do not
//! contend.

use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::scan_job::{JobStatus, ScanJob};
use crate::services::{fingerprint, normalizer};

/// Outcome of one ingested batch, returned to the delivering worker.
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngestResult {
    pub job_id: Uuid,
    /// Lines that parsed as JSON, whether or not they were new.
    pub received: usize,
    /// Lines actually persisted (duplicates of a resent batch collapse).
    pub rows_inserted: u64,
    /// Canonical findings newly created from this batch.
    pub findings_upserted: u64,
    #[serde(rename = "final")]
    pub is_final: bool,
}

const PROMOTE_QUEUED_SQL: &str =
    "UPDATE scan_jobs SET status = 'running' WHERE id = $1 AND status = 'queued'";
const FINISH_RUNNING_SQL: &str =
    "UPDATE scan_jobs SET status = 'finished', finished_at = NOW()
     WHERE id = $1 AND status = 'running'";

/// Close out a job whose worker legs are all complete.
///
/// Safe to call at any point in the job lifecycle: only a queued or running
/// job with zero pending legs transitions, via queued -> running -> finished
/// so the transition graph holds. Returns whether the job finished here.
pub async fn finish_if_complete(pool: &PgPool, job_id: Uuid) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let (pending,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM scan_job_workers WHERE job_id = $1 AND pending")
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;

    let mut finished = false;
    if pending == 0 {
        sqlx::query(PROMOTE_QUEUED_SQL).bind(job_id).execute(&mut *tx).await?;
        let result = sqlx::query(FINISH_RUNNING_SQL)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        finished = result.rows_affected() > 0;
    }
    tx.commit().await?;
    Ok(finished)
}

/// Parse a webhook body into result lines.
///
/// Accepts a single JSON object, a JSON array of objects, or NDJSON. In
/// NDJSON mode individual malformed lines are dropped and counted; a body
/// that yields no parseable line at all is a validation error.
pub fn parse_lines(raw: &str) -> Result<(Vec<Value>, usize), AppError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok((Vec::new(), 0));
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return match value {
            Value::Array(items) => Ok((items, 0)),
            obj @ Value::Object(_) => Ok((vec![obj], 0)),
            _ => Err(AppError::Validation(
                "result payload must be an object, array, or NDJSON".to_string(),
            )),
        };
    }

    let mut lines = Vec::new();
    let mut dropped = 0usize;
    for line in trimmed.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => lines.push(value),
            Err(_) => dropped += 1,
        }
    }

    if lines.is_empty() {
        return Err(AppError::Validation(
            "request body is not valid JSON or NDJSON".to_string(),
        ));
    }
    Ok((lines, dropped))
}

/// Ingest one result batch from a worker.
///
/// All effects commit atomically: line append, finding upserts, progress
/// bump, and (on the final batch) leg completion and possible job finish.
/// A batch that fails validation mutates nothing.
pub async fn ingest_batch(
    pool: &PgPool,
    job_id: Uuid,
    worker_name: &str,
    is_final: bool,
    raw_body: &str,
) -> Result<IngestResult, AppError> {
    let (lines, dropped) = parse_lines(raw_body)?;

    let job: ScanJob = sqlx::query_as(
        "SELECT id, tenant_id, subject_type, subject_value, status, error,
                providers_completed, created_at, last_progress_at, finished_at
         FROM scan_jobs WHERE id = $1",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Job {job_id} not found")))?;

    if matches!(job.status, JobStatus::Finished | JobStatus::Failed) {
        return Err(AppError::InvalidTransition(format!(
            "job {job_id} already terminal, results rejected"
        )));
    }

    if dropped > 0 {
        tracing::warn!(%job_id, worker_name, dropped, "Dropped malformed result lines");
    }

    let mut tx = pool.begin().await?;

    // Serialize concurrent batches for this (job, worker) pair. The lock is
    // released automatically at commit/rollback.
    let lock_key = fingerprint::advisory_lock_key(&job_id, worker_name);
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(lock_key)
        .execute(&mut *tx)
        .await?;

    let (max_line_no,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(line_no), 0) FROM scan_lines
         WHERE job_id = $1 AND worker_name = $2",
    )
    .bind(job_id)
    .bind(worker_name)
    .fetch_one(&mut *tx)
    .await?;

    let mut rows_inserted = 0u64;
    for (offset, line) in lines.iter().enumerate() {
        let result = sqlx::query(
            "INSERT INTO scan_lines (job_id, worker_name, line_no, payload)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (job_id, worker_name, line_no) DO NOTHING",
        )
        .bind(job_id)
        .bind(worker_name)
        .bind(max_line_no + 1 + offset as i64)
        .bind(line)
        .execute(&mut *tx)
        .await?;
        rows_inserted += result.rows_affected();
    }

    let mut findings_upserted = 0u64;
    for line in &lines {
        let Some(finding) = normalizer::normalize(line, worker_name) else {
            continue;
        };
        let result = sqlx::query(
            "INSERT INTO findings
                 (job_id, provider, kind, severity, confidence, evidence, meta, fingerprint)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (job_id, provider, fingerprint) DO NOTHING",
        )
        .bind(job_id)
        .bind(&finding.provider)
        .bind(&finding.kind)
        .bind(finding.severity)
        .bind(finding.confidence)
        .bind(serde_json::to_value(&finding.evidence).unwrap_or(Value::Null))
        .bind(&finding.meta)
        .bind(&finding.fingerprint)
        .execute(&mut *tx)
        .await?;
        findings_upserted += result.rows_affected();
    }

    sqlx::query("UPDATE scan_jobs SET last_progress_at = NOW() WHERE id = $1")
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

    if is_final {
        let cleared = sqlx::query(
            "UPDATE scan_job_workers SET pending = FALSE
             WHERE job_id = $1 AND worker_name = $2 AND pending",
        )
        .bind(job_id)
        .bind(worker_name)
        .execute(&mut *tx)
        .await?;

        if cleared.rows_affected() > 0 {
            sqlx::query(
                "UPDATE scan_jobs SET providers_completed = providers_completed + 1
                 WHERE id = $1",
            )
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        }

        let (pending,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM scan_job_workers WHERE job_id = $1 AND pending",
        )
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;

        if pending == 0 {
            // A fast worker can deliver its final batch before admission has
            // promoted the job out of queued; take that step here so the
            // finish applies. The guards keep stuck and failed jobs terminal.
            sqlx::query(PROMOTE_QUEUED_SQL).bind(job_id).execute(&mut *tx).await?;
            let finished = sqlx::query(FINISH_RUNNING_SQL)
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
            if finished.rows_affected() > 0 {
                tracing::info!(%job_id, "All worker legs complete, job finished");
            }
        }
    }

    tx.commit().await?;

    tracing::info!(
        %job_id,
        worker_name,
        received = lines.len(),
        rows_inserted,
        findings_upserted,
        is_final,
        "Ingested result batch"
    );

    Ok(IngestResult {
        job_id,
        received: lines.len(),
        rows_inserted,
        findings_upserted,
        is_final,
    })
}
