//! Canonical finding model: deduplicated facts derived from raw result lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, PartialOrd, Ord)]
#[sqlx(type_name = "severity_level", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Numeric weight for derived-signal scoring (0.0-1.0 scale).
    pub fn weight(&self) -> f64 {
        match self {
            Self::Critical => 1.0,
            Self::High => 0.8,
            Self::Medium => 0.5,
            Self::Low => 0.2,
            Self::Info => 0.05,
        }
    }
}

/// One ordered evidence key/value pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidencePair {
    pub key: String,
    pub value: String,
}

/// A canonical finding row. Immutable after creation; user-facing status
/// overlays live in `finding_overlays` and are joined at read time.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Finding {
    pub id: Uuid,
    pub job_id: Uuid,
    pub provider: String,
    pub kind: String,
    pub severity: Severity,
    pub confidence: f32,
    pub evidence: serde_json::Value,
    pub meta: serde_json::Value,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

/// A finding produced by the normalizer, ready for idempotent upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedFinding {
    pub provider: String,
    pub kind: String,
    pub severity: Severity,
    pub confidence: f32,
    pub evidence: Vec<EvidencePair>,
    pub meta: serde_json::Value,
    pub fingerprint: String,
}

/// User-owned status overlay on an immutable finding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "overlay_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OverlayStatus {
    Open,
    Resolved,
    Ignored,
}

/// Finding joined with its optional overlay for read views.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct FindingWithOverlay {
    pub id: Uuid,
    pub job_id: Uuid,
    pub provider: String,
    pub kind: String,
    pub severity: Severity,
    pub confidence: f32,
    pub evidence: serde_json::Value,
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub overlay_status: Option<OverlayStatus>,
}

/// Request body for overlay updates.
#[derive(Debug, Deserialize)]
pub struct UpdateOverlayRequest {
    pub status: OverlayStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_weight_ordering() {
        assert!(Severity::Critical.weight() > Severity::High.weight());
        assert!(Severity::High.weight() > Severity::Medium.weight());
        assert!(Severity::Medium.weight() > Severity::Low.weight());
        assert!(Severity::Low.weight() > Severity::Info.weight());
    }

    #[test]
    fn severity_serialization() {
        assert_eq!(serde_json::to_string(&Severity::High).unwrap(), "\"high\"");
        let s: Severity = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(s, Severity::Critical);
    }

    #[test]
    fn overlay_status_round_trip() {
        let s: OverlayStatus = serde_json::from_str("\"resolved\"").unwrap();
        assert_eq!(s, OverlayStatus::Resolved);
        assert_eq!(serde_json::to_string(&OverlayStatus::Ignored).unwrap(), "\"ignored\"");
    }
}
