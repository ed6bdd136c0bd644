//! Operator-visible incident records raised by the job watchdog.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// Incident type for stuck-job detection. Stored as text so new incident
/// kinds can be added without a schema migration.
pub const INCIDENT_STUCK_JOB: &str = "stuck_job";

/// A structured incident record consumable by an external alerting
/// collaborator. The pipeline's responsibility ends at producing the record.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Incident {
    pub id: Uuid,
    pub job_id: Uuid,
    pub incident_type: String,
    pub message: String,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
