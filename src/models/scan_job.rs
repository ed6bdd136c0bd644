//! Scan job model: one user-initiated investigation tracked end-to-end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

/// What kind of identifier a job investigates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "subject_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubjectType {
    Username,
    Email,
    Phone,
    Domain,
}

impl std::fmt::Display for SubjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Username => write!(f, "username"),
            Self::Email => write!(f, "email"),
            Self::Phone => write!(f, "phone"),
            Self::Domain => write!(f, "domain"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Failed,
    Stuck,
}

/// Check whether a job status transition follows the allowed graph.
///
/// `stuck` is only ever assigned by the watchdog; terminal states have no
/// outgoing edges.
pub fn is_valid_transition(from: JobStatus, to: JobStatus) -> bool {
    matches!(
        (from, to),
        (JobStatus::Queued, JobStatus::Running)
            | (JobStatus::Queued, JobStatus::Failed)
            | (JobStatus::Running, JobStatus::Finished)
            | (JobStatus::Running, JobStatus::Failed)
            | (JobStatus::Running, JobStatus::Stuck)
    )
}

/// One user-initiated scan job.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ScanJob {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub subject_type: SubjectType,
    pub subject_value: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub providers_completed: i32,
    pub created_at: DateTime<Utc>,
    pub last_progress_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-worker leg of a job. `triggered_at` records that dispatch reached the
/// worker; `pending` is cleared when the worker's final callback arrives, or
/// immediately when dispatch fails outright (`dispatch_error` records why).
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct JobWorkerLeg {
    pub job_id: Uuid,
    pub worker_name: String,
    pub triggered_at: Option<DateTime<Utc>>,
    pub pending: bool,
    pub dispatch_error: Option<String>,
}

/// Request body for scan admission.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateScanRequest {
    pub tenant_id: Uuid,
    pub subject_type: SubjectType,
    #[validate(length(min = 1, max = 255, message = "subject value must be 1-255 characters"))]
    pub subject_value: String,
}

/// Admission outcome returned to the caller.
#[derive(Debug, Serialize)]
pub struct AdmitResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub dispatched_workers: Vec<String>,
}

/// One raw result line received from a worker for a job.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ScanLine {
    pub id: i64,
    pub job_id: Uuid,
    pub worker_name: String,
    pub line_no: i64,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_type_serialization() {
        let st: SubjectType = serde_json::from_str("\"username\"").unwrap();
        assert_eq!(st, SubjectType::Username);
        assert_eq!(serde_json::to_string(&SubjectType::Domain).unwrap(), "\"domain\"");
    }

    #[test]
    fn queued_job_can_start_or_fail() {
        assert!(is_valid_transition(JobStatus::Queued, JobStatus::Running));
        assert!(is_valid_transition(JobStatus::Queued, JobStatus::Failed));
        assert!(!is_valid_transition(JobStatus::Queued, JobStatus::Finished));
    }

    #[test]
    fn running_job_terminal_states() {
        assert!(is_valid_transition(JobStatus::Running, JobStatus::Finished));
        assert!(is_valid_transition(JobStatus::Running, JobStatus::Failed));
        assert!(is_valid_transition(JobStatus::Running, JobStatus::Stuck));
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for terminal in [JobStatus::Finished, JobStatus::Failed, JobStatus::Stuck] {
            for target in [
                JobStatus::Queued,
                JobStatus::Running,
                JobStatus::Finished,
                JobStatus::Failed,
                JobStatus::Stuck,
            ] {
                assert!(!is_valid_transition(terminal, target));
            }
        }
    }

    #[test]
    fn create_scan_request_validation() {
        use validator::Validate;

        let ok = CreateScanRequest {
            tenant_id: Uuid::nil(),
            subject_type: SubjectType::Username,
            subject_value: "johndoe".to_string(),
        };
        assert!(ok.validate().is_ok());

        let empty = CreateScanRequest {
            tenant_id: Uuid::nil(),
            subject_type: SubjectType::Username,
            subject_value: String::new(),
        };
        assert!(empty.validate().is_err());
    }
}
