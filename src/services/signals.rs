//! Derived exposure signals computed from canonical findings at read time.
//!
//! Nothing here is persisted. Signals are pure functions of the finding set
//! so they can never drift out of sync with the data they summarize.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::finding::{FindingWithOverlay, Severity};

/// Days over which a finding's contribution decays linearly.
const DECAY_WINDOW_DAYS: f64 = 180.0;
/// Decay floor: old findings never contribute less than this fraction.
const DECAY_FLOOR: f64 = 0.25;

/// Signals block attached to finding read views.
#[derive(Debug, Serialize, PartialEq)]
pub struct ExposureSignals {
    pub exposure_drivers: Vec<String>,
    pub dark_web_score: u8,
}

/// Compute the full signals block for a job's findings.
pub fn compute(findings: &[FindingWithOverlay], now: DateTime<Utc>) -> ExposureSignals {
    ExposureSignals {
        exposure_drivers: exposure_drivers(findings),
        dark_web_score: dark_web_score(findings, now),
    }
}

/// Human-readable summary of what is driving the subject's exposure.
///
/// An empty finding set yields an empty driver list, never a placeholder.
pub fn exposure_drivers(findings: &[FindingWithOverlay]) -> Vec<String> {
    let mut drivers = Vec::new();

    let platforms = distinct_platforms(findings);
    if !platforms.is_empty() {
        drivers.push(format!("Active profiles on {} platforms", platforms.len()));
    }

    let breach_sources = findings
        .iter()
        .filter(|f| f.kind == "breach.hit")
        .filter_map(|f| evidence_value(f, "source"))
        .collect::<std::collections::BTreeSet<_>>();
    if !breach_sources.is_empty() {
        drivers.push(format!(
            "Credentials present in {} breach datasets",
            breach_sources.len()
        ));
    }

    let severe = findings
        .iter()
        .filter(|f| f.severity >= Severity::High)
        .count();
    if severe > 0 {
        drivers.push(format!("{severe} high-severity findings"));
    }

    drivers
}

/// Bounded 0-100 score estimating dark-web/breach exposure.
///
/// Each qualifying finding contributes provider trust x severity weight x
/// confidence x recency decay; a count factor rewards breadth. Deterministic
/// for a fixed `now`.
pub fn dark_web_score(findings: &[FindingWithOverlay], now: DateTime<Utc>) -> u8 {
    let qualifying: Vec<&FindingWithOverlay> = findings
        .iter()
        .filter(|f| f.kind == "breach.hit" || f.severity >= Severity::High)
        .collect();
    if qualifying.is_empty() {
        return 0;
    }

    let base: f64 = qualifying
        .iter()
        .map(|f| {
            provider_trust(&f.provider)
                * f.severity.weight()
                * f64::from(f.confidence)
                * recency_decay(f.created_at, now)
        })
        .sum();

    let count_factor = (qualifying.len().min(10) as f64) * 2.0;
    let score = base * 20.0 + count_factor;
    score.round().clamp(0.0, 100.0) as u8
}

/// How much weight a provider's assertions carry. Breach-data providers are
/// trusted more than scrapers; unrecognized providers get a neutral weight.
fn provider_trust(provider: &str) -> f64 {
    match provider {
        "hibp" => 0.95,
        "dehashed" | "virustotal" | "maigret" => 0.9,
        "whatsmyname" | "securitytrails" | "shodan" => 0.85,
        "urlscan" => 0.8,
        "gosearch" | "fullcontact" | "clearbit" => 0.7,
        _ => 0.5,
    }
}

/// Linear decay from 1.0 at age zero down to the floor at the window edge.
fn recency_decay(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_days = (now - created_at).num_seconds().max(0) as f64 / 86_400.0;
    let decay = 1.0 - (age_days / DECAY_WINDOW_DAYS) * (1.0 - DECAY_FLOOR);
    decay.max(DECAY_FLOOR)
}

fn distinct_platforms(findings: &[FindingWithOverlay]) -> std::collections::BTreeSet<String> {
    findings
        .iter()
        .filter(|f| f.kind == "presence.hit")
        .filter_map(|f| evidence_value(f, "site"))
        .collect()
}

/// Look up one key in a finding's stored evidence array.
fn evidence_value(finding: &FindingWithOverlay, key: &str) -> Option<String> {
    finding.evidence.as_array()?.iter().find_map(|pair| {
        let obj = pair.as_object()?;
        if obj.get("key")?.as_str()? == key {
            obj.get("value")?.as_str().map(str::to_string)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use uuid::Uuid;

    fn finding(
        provider: &str,
        kind: &str,
        severity: Severity,
        evidence: serde_json::Value,
        age_days: i64,
    ) -> FindingWithOverlay {
        FindingWithOverlay {
            id: Uuid::new_v4(),
            job_id: Uuid::nil(),
            provider: provider.to_string(),
            kind: kind.to_string(),
            severity,
            confidence: 0.9,
            evidence,
            meta: json!({}),
            created_at: Utc::now() - Duration::days(age_days),
            overlay_status: None,
        }
    }

    fn site_hit(site: &str) -> FindingWithOverlay {
        finding(
            "maigret",
            "presence.hit",
            Severity::Low,
            json!([{"key": "site", "value": site}]),
            0,
        )
    }

    fn breach_hit(source: &str, age_days: i64) -> FindingWithOverlay {
        finding(
            "dehashed",
            "breach.hit",
            Severity::High,
            json!([{"key": "source", "value": source}]),
            age_days,
        )
    }

    #[test]
    fn empty_findings_empty_signals() {
        let signals = compute(&[], Utc::now());
        assert!(signals.exposure_drivers.is_empty());
        assert_eq!(signals.dark_web_score, 0);
    }

    #[test]
    fn platform_driver_counts_distinct_sites() {
        let findings = vec![site_hit("github"), site_hit("twitter"), site_hit("github")];
        let drivers = exposure_drivers(&findings);
        assert_eq!(drivers, vec!["Active profiles on 2 platforms"]);
    }

    #[test]
    fn breach_driver_counts_distinct_sources() {
        let findings = vec![breach_hit("LeakA", 0), breach_hit("LeakB", 0)];
        let drivers = exposure_drivers(&findings);
        assert!(drivers.contains(&"Credentials present in 2 breach datasets".to_string()));
        assert!(drivers.contains(&"2 high-severity findings".to_string()));
    }

    #[test]
    fn presence_only_scores_zero() {
        let findings = vec![site_hit("github"), site_hit("twitter")];
        assert_eq!(dark_web_score(&findings, Utc::now()), 0);
    }

    #[test]
    fn breach_findings_raise_score() {
        let now = Utc::now();
        let one = dark_web_score(&[breach_hit("LeakA", 0)], now);
        let three = dark_web_score(
            &[
                breach_hit("LeakA", 0),
                breach_hit("LeakB", 0),
                breach_hit("LeakC", 0),
            ],
            now,
        );
        assert!(one > 0);
        assert!(three > one);
        assert!(three <= 100);
    }

    #[test]
    fn old_findings_contribute_less() {
        let now = Utc::now();
        let fresh = dark_web_score(&[breach_hit("LeakA", 0)], now);
        let old = dark_web_score(&[breach_hit("LeakA", 400)], now);
        assert!(old < fresh);
        assert!(old > 0);
    }

    #[test]
    fn decay_floors_at_quarter() {
        let now = Utc::now();
        assert_eq!(recency_decay(now - Duration::days(1000), now), DECAY_FLOOR);
        assert!(recency_decay(now, now) > 0.99);
    }

    #[test]
    fn score_is_deterministic_for_fixed_now() {
        let now = Utc::now();
        let findings = vec![breach_hit("LeakA", 10), breach_hit("LeakB", 50)];
        assert_eq!(dark_web_score(&findings, now), dark_web_score(&findings, now));
    }

    #[test]
    fn score_caps_at_hundred() {
        let now = Utc::now();
        let findings: Vec<_> = (0..40)
            .map(|i| {
                let mut f = breach_hit(&format!("Leak{i}"), 0);
                f.severity = Severity::Critical;
                f
            })
            .collect();
        assert_eq!(dark_web_score(&findings, now), 100);
    }
}
