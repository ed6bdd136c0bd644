//! Evidence fingerprint computation for finding deduplication.
//!
//! The fingerprint is a deterministic hash of the provider, finding kind,
//! and the ordered evidence pairs. Volatile fields (timestamps, latency,
//! worker-side request ids) live in `meta` and are deliberately excluded so
//! a resent line hashes identically.

use sha2::{Digest, Sha256};

use crate::models::finding::EvidencePair;

/// Compute the natural-key fingerprint for a finding.
pub fn compute(provider: &str, kind: &str, evidence: &[EvidencePair]) -> String {
    let mut input = format!("{provider}:{kind}");
    for pair in evidence {
        input.push('|');
        input.push_str(&pair.key);
        input.push('=');
        input.push_str(&pair.value);
    }
    hash(&input)
}

/// Derive a signed 64-bit advisory lock key for a (job, worker) pair.
///
/// Postgres advisory locks take a bigint; we fold the first 8 bytes of the
/// digest so distinct pairs land on distinct lock keys with negligible
/// collision probability.
pub fn advisory_lock_key(job_id: &uuid::Uuid, worker_name: &str) -> i64 {
    let digest = Sha256::digest(format!("{job_id}:{worker_name}").as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// SHA-256 hash a string and return hex-encoded digest.
fn hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evidence(pairs: &[(&str, &str)]) -> Vec<EvidencePair> {
        pairs
            .iter()
            .map(|(k, v)| EvidencePair {
                key: k.to_string(),
                value: v.to_string(),
            })
            .collect()
    }

    #[test]
    fn same_inputs_same_fingerprint() {
        let ev = evidence(&[("site", "github"), ("url", "https://github.com/x")]);
        assert_eq!(
            compute("maigret", "presence.hit", &ev),
            compute("maigret", "presence.hit", &ev)
        );
    }

    #[test]
    fn different_site_different_fingerprint() {
        let a = evidence(&[("site", "github")]);
        let b = evidence(&[("site", "twitter")]);
        assert_ne!(
            compute("maigret", "presence.hit", &a),
            compute("maigret", "presence.hit", &b)
        );
    }

    #[test]
    fn different_provider_different_fingerprint() {
        let ev = evidence(&[("site", "github")]);
        assert_ne!(
            compute("maigret", "presence.hit", &ev),
            compute("whatsmyname", "presence.hit", &ev)
        );
    }

    #[test]
    fn evidence_order_matters() {
        // Evidence is an ordered list; the normalizer emits a stable order.
        let a = evidence(&[("site", "github"), ("status", "found")]);
        let b = evidence(&[("status", "found"), ("site", "github")]);
        assert_ne!(
            compute("maigret", "presence.hit", &a),
            compute("maigret", "presence.hit", &b)
        );
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = compute("maigret", "presence.hit", &evidence(&[("site", "github")]));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn advisory_key_stable_and_distinct() {
        let job = uuid::Uuid::nil();
        let k1 = advisory_lock_key(&job, "maigret");
        let k2 = advisory_lock_key(&job, "maigret");
        let k3 = advisory_lock_key(&job, "holehe");
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }
}
