//! Finding normalizer: maps worker-specific payload shapes into the
//! canonical finding taxonomy.
//!
//! Raw lines are loosely-typed JSON from untrusted external processes. They
//! are resolved into a tagged `ProviderPayload` at this boundary; nothing
//! downstream ever sees an untyped payload. Normalization is deterministic:
//! the same line always yields the same finding (and fingerprint), which is
//! what makes the idempotent upsert collapse resent batches.

use serde_json::Value;

use crate::models::finding::{EvidencePair, NormalizedFinding, Severity};
use crate::services::fingerprint;

/// Tagged union over known provider payload shapes, plus a generic fallback.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderPayload {
    /// Platform presence result (maigret/whatsmyname style): a `site` field
    /// with optional url and status.
    SiteHit {
        site: String,
        url: Option<String>,
        status: Option<String>,
    },
    /// Breach/leak result: a breach source with optional record count.
    BreachHit {
        source: String,
        records: Option<i64>,
    },
    /// Progress marker carrying no finding.
    Heartbeat,
    /// Unrecognized object shape.
    Generic(Value),
}

/// Statuses a site hit may carry that mean the profile actually exists.
const FOUND_STATUSES: [&str; 3] = ["found", "claimed", "ok"];

/// Resolve a raw line into its payload shape.
pub fn classify(raw: &Value) -> ProviderPayload {
    let Some(obj) = raw.as_object() else {
        return ProviderPayload::Heartbeat;
    };

    if obj.get("event").and_then(Value::as_str) == Some("progress")
        || obj.contains_key("heartbeat")
        || obj.get("status").and_then(Value::as_str) == Some("progress")
    {
        return ProviderPayload::Heartbeat;
    }

    if let Some(site) = obj.get("site").and_then(Value::as_str) {
        return ProviderPayload::SiteHit {
            site: site.to_string(),
            url: obj.get("url").and_then(Value::as_str).map(str::to_string),
            status: obj
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
    }

    let breach_source = obj
        .get("breach")
        .or_else(|| obj.get("breach_name"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            // holehe/dehashed style: a source plus a record count
            obj.get("source")
                .and_then(Value::as_str)
                .filter(|_| obj.contains_key("records"))
                .map(str::to_string)
        });
    if let Some(source) = breach_source {
        return ProviderPayload::BreachHit {
            source,
            records: obj.get("records").and_then(Value::as_i64),
        };
    }

    ProviderPayload::Generic(raw.clone())
}

/// Normalize one raw line into a canonical finding.
///
/// Returns `None` when the line carries no identifiable finding (progress
/// heartbeats, not-found site results, empty generic payloads).
pub fn normalize(raw: &Value, provider: &str) -> Option<NormalizedFinding> {
    match classify(raw) {
        ProviderPayload::Heartbeat => None,
        ProviderPayload::SiteHit { site, url, status } => {
            normalize_site_hit(provider, site, url, status)
        }
        ProviderPayload::BreachHit { source, records } => {
            let mut evidence = vec![EvidencePair {
                key: "source".to_string(),
                value: source,
            }];
            if let Some(n) = records {
                evidence.push(EvidencePair {
                    key: "records".to_string(),
                    value: n.to_string(),
                });
            }
            Some(build(
                provider,
                "breach.hit",
                Severity::High,
                0.85,
                evidence,
                raw,
            ))
        }
        ProviderPayload::Generic(value) => normalize_generic(provider, &value, raw),
    }
}

fn normalize_site_hit(
    provider: &str,
    site: String,
    url: Option<String>,
    status: Option<String>,
) -> Option<NormalizedFinding> {
    let found = url.is_some()
        || status
            .as_deref()
            .is_some_and(|s| FOUND_STATUSES.contains(&s));
    if !found {
        // "not found" / "available" results are worker output, not findings
        return None;
    }

    // Evidence order is fixed; the fingerprint depends on it.
    let mut evidence = vec![EvidencePair {
        key: "site".to_string(),
        value: site,
    }];
    if let Some(url) = &url {
        evidence.push(EvidencePair {
            key: "url".to_string(),
            value: url.clone(),
        });
    }
    if let Some(status) = &status {
        evidence.push(EvidencePair {
            key: "status".to_string(),
            value: status.clone(),
        });
    }

    let confidence = if url.is_some() { 0.9 } else { 0.6 };
    let meta = serde_json::json!({ "status": status });
    let fp_evidence = evidence.clone();
    Some(NormalizedFinding {
        provider: provider.to_string(),
        kind: "presence.hit".to_string(),
        severity: Severity::Low,
        confidence,
        fingerprint: fingerprint::compute(provider, "presence.hit", &fp_evidence),
        evidence,
        meta,
    })
}

/// Unknown provider shapes fall back to a conservative generic presence hit,
/// keyed on the stable string fields of the payload.
fn normalize_generic(provider: &str, value: &Value, raw: &Value) -> Option<NormalizedFinding> {
    let obj = value.as_object()?;

    // Deterministic evidence: string fields in sorted key order.
    let mut evidence: Vec<EvidencePair> = obj
        .iter()
        .filter_map(|(k, v)| {
            v.as_str().map(|s| EvidencePair {
                key: k.clone(),
                value: s.to_string(),
            })
        })
        .collect();
    evidence.sort_by(|a, b| a.key.cmp(&b.key));

    if evidence.is_empty() {
        return None;
    }

    Some(build(
        provider,
        "presence.hit",
        Severity::Info,
        0.5,
        evidence,
        raw,
    ))
}

fn build(
    provider: &str,
    kind: &str,
    severity: Severity,
    confidence: f32,
    evidence: Vec<EvidencePair>,
    raw: &Value,
) -> NormalizedFinding {
    NormalizedFinding {
        provider: provider.to_string(),
        kind: kind.to_string(),
        severity,
        confidence,
        fingerprint: fingerprint::compute(provider, kind, &evidence),
        evidence,
        meta: serde_json::json!({ "raw_keys": raw.as_object().map(|o| o.len()).unwrap_or(0) }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn site_hit_with_url_is_high_confidence() {
        let raw = json!({"site": "github", "url": "https://github.com/johndoe", "status": "found"});
        let finding = normalize(&raw, "maigret").unwrap();
        assert_eq!(finding.kind, "presence.hit");
        assert_eq!(finding.confidence, 0.9);
        assert_eq!(finding.evidence[0].key, "site");
        assert_eq!(finding.evidence[0].value, "github");
    }

    #[test]
    fn site_hit_without_url_is_lower_confidence() {
        let raw = json!({"site": "github", "status": "claimed"});
        let finding = normalize(&raw, "maigret").unwrap();
        assert_eq!(finding.confidence, 0.6);
    }

    #[test]
    fn not_found_site_result_is_not_a_finding() {
        let raw = json!({"site": "github", "status": "not_found"});
        assert!(normalize(&raw, "maigret").is_none());
    }

    #[test]
    fn heartbeat_yields_none() {
        assert!(normalize(&json!({"event": "progress", "done": 12}), "maigret").is_none());
        assert!(normalize(&json!({"status": "progress"}), "maigret").is_none());
        assert!(normalize(&json!("just a string"), "maigret").is_none());
    }

    #[test]
    fn breach_payload_maps_to_breach_hit() {
        let raw = json!({"breach": "ExampleLeak2019", "records": 1500});
        let finding = normalize(&raw, "dehashed").unwrap();
        assert_eq!(finding.kind, "breach.hit");
        assert_eq!(finding.severity, Severity::High);
        assert_eq!(finding.evidence[0].value, "ExampleLeak2019");
    }

    #[test]
    fn unknown_provider_falls_back_to_generic_presence() {
        let raw = json!({"profile_name": "johndoe", "platform_url": "https://example.com/johndoe"});
        let finding = normalize(&raw, "mystery-tool").unwrap();
        assert_eq!(finding.kind, "presence.hit");
        assert_eq!(finding.confidence, 0.5);
        // sorted key order
        assert_eq!(finding.evidence[0].key, "platform_url");
        assert_eq!(finding.evidence[1].key, "profile_name");
    }

    #[test]
    fn empty_generic_payload_yields_none() {
        assert!(normalize(&json!({"count": 3}), "mystery-tool").is_none());
    }

    #[test]
    fn normalization_is_deterministic() {
        let raw = json!({"site": "github", "url": "https://github.com/x", "status": "found"});
        let a = normalize(&raw, "maigret").unwrap();
        let b = normalize(&raw, "maigret").unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a, b);
    }

    #[test]
    fn classify_resolves_shapes() {
        assert!(matches!(
            classify(&json!({"site": "x"})),
            ProviderPayload::SiteHit { .. }
        ));
        assert!(matches!(
            classify(&json!({"source": "leak", "records": 10})),
            ProviderPayload::BreachHit { .. }
        ));
        assert!(matches!(
            classify(&json!({"heartbeat": true})),
            ProviderPayload::Heartbeat
        ));
        assert!(matches!(
            classify(&json!({"something": "else"})),
            ProviderPayload::Generic(_)
        ));
    }
}
