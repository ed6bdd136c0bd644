//! Worker health, circuit breaker state, and administrative policy models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "worker_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Online,
    Degraded,
    Offline,
    Unknown,
}

/// Point-in-time health of one worker process, independent of any job.
/// Written only by the health monitor.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct WorkerHealthRecord {
    pub worker_name: String,
    pub status: WorkerStatus,
    pub last_check_at: DateTime<Utc>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub response_time_ms: Option<i64>,
    pub error_message: Option<String>,
}

impl WorkerHealthRecord {
    /// Status adjusted for staleness: a record nobody has refreshed within
    /// the staleness window cannot be trusted to mean "online".
    pub fn effective_status(&self, now: DateTime<Utc>, stale_after_secs: i64) -> WorkerStatus {
        let age = (now - self.last_check_at).num_seconds();
        if age > stale_after_secs {
            WorkerStatus::Unknown
        } else {
            self.status
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "circuit_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker state for one worker.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct CircuitBreakerState {
    pub worker_name: String,
    pub state: CircuitState,
    pub failure_count: i32,
    pub success_count: i32,
    pub failure_threshold: i32,
    pub success_threshold: i32,
    pub cooldown_ms: i64,
    pub opened_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub total_trips: i32,
    pub updated_at: DateTime<Utc>,
}

/// Administrative gate: a worker can be disabled platform-wide regardless of
/// health, e.g. for legal/ethical gating of a data category.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct WorkerPolicy {
    pub worker_name: String,
    pub enabled: bool,
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Request body for policy updates.
#[derive(Debug, Deserialize)]
pub struct UpdatePolicyRequest {
    pub enabled: bool,
    pub reason: Option<String>,
}

/// Health report pushed by a worker or scheduler; persisted verbatim as an
/// audit trail independent of the live health state machine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthReport {
    pub worker: String,
    pub status: String,
    pub healthy: bool,
    #[serde(rename = "responseTime")]
    pub response_time: Option<i64>,
    pub tools: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Combined operator view: health + breaker + policy for one worker.
#[derive(Debug, Serialize)]
pub struct WorkerOverview {
    pub worker_name: String,
    pub health: Option<WorkerHealthRecord>,
    pub effective_status: WorkerStatus,
    pub circuit: Option<CircuitBreakerState>,
    pub policy_enabled: bool,
    pub policy_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(status: WorkerStatus, checked_secs_ago: i64) -> WorkerHealthRecord {
        WorkerHealthRecord {
            worker_name: "maigret".to_string(),
            status,
            last_check_at: Utc::now() - Duration::seconds(checked_secs_ago),
            last_success_at: None,
            response_time_ms: Some(120),
            error_message: None,
        }
    }

    #[test]
    fn fresh_record_keeps_status() {
        let r = record(WorkerStatus::Online, 30);
        assert_eq!(r.effective_status(Utc::now(), 180), WorkerStatus::Online);
    }

    #[test]
    fn stale_record_downgrades_to_unknown() {
        let r = record(WorkerStatus::Online, 600);
        assert_eq!(r.effective_status(Utc::now(), 180), WorkerStatus::Unknown);
    }

    #[test]
    fn stale_offline_record_stays_distrusted() {
        let r = record(WorkerStatus::Offline, 600);
        assert_eq!(r.effective_status(Utc::now(), 180), WorkerStatus::Unknown);
    }

    #[test]
    fn health_report_deserializes_optional_fields() {
        let report: HealthReport = serde_json::from_str(
            r#"{"worker":"maigret","status":"ok","healthy":true,"responseTime":85}"#,
        )
        .unwrap();
        assert_eq!(report.worker, "maigret");
        assert_eq!(report.response_time, Some(85));
        assert!(report.tools.is_none());
    }
}
