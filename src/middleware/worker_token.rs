//! Shared-secret token extractor for worker callbacks and internal admin
//! endpoints.
//!
//! Workers authenticate with an exact-match token in `X-Worker-Token`.
//! Comparison goes through SHA-256 digests so the byte-wise equality check
//! never short-circuits on the raw secret. Repeated failures from one
//! client install a lockout through the auth rate limiter.

use axum::{extract::FromRequestParts, http::request::Parts};
use sha2::{Digest, Sha256};

use crate::errors::AppError;
use crate::services::rate_limiter;
use crate::AppState;

const AUTH_LIMIT_TYPE: &str = "worker_auth";

/// Marker extractor: the request carried a valid worker token.
///
/// Use as an Axum extractor in handlers that only workers or internal
/// schedulers may call:
/// ```ignore
/// async fn handler(_auth: WorkerToken) -> impl IntoResponse { ... }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct WorkerToken;

/// Compare a presented token against the expected secret without leaking
/// position-of-mismatch timing on the secret itself.
pub fn token_matches(presented: &str, expected: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Best-effort client identity for the lockout key. Proxied deployments set
/// X-Forwarded-For; otherwise all unattributed callers share one bucket.
fn client_key(parts: &Parts) -> String {
    parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .unwrap_or_else(|| "direct".to_string())
}

impl FromRequestParts<AppState> for WorkerToken {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let client = client_key(parts);

        if rate_limiter::blocked_until(&state.redis, &client, AUTH_LIMIT_TYPE)
            .await
            .is_some()
        {
            tracing::warn!(client, "Rejected callback from locked-out client");
            return Err(AppError::Unauthorized);
        }

        let presented = parts
            .headers
            .get("X-Worker-Token")
            .and_then(|v| v.to_str().ok())
            .ok_or(AppError::Unauthorized)?;

        if !token_matches(presented, &state.config.worker_token) {
            tracing::warn!(client, "Rejected callback with invalid worker token");
            if let Err(e) = rate_limiter::record_auth_failure(
                &state.redis,
                &client,
                AUTH_LIMIT_TYPE,
                rate_limiter::LimitSpec {
                    max_allowed: state.config.auth_limit_max,
                    window_secs: state.config.auth_limit_window_secs,
                },
                state.config.auth_lockout_secs,
            )
            .await
            {
                tracing::debug!(error = %e, "Auth failure counter unavailable");
            }
            return Err(AppError::Unauthorized);
        }

        Ok(WorkerToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_tokens_accepted() {
        assert!(token_matches("secret-token", "secret-token"));
    }

    #[test]
    fn mismatched_tokens_rejected() {
        assert!(!token_matches("secret-token", "other-token"));
        assert!(!token_matches("", "secret-token"));
        assert!(!token_matches("secret-token", ""));
    }

    #[test]
    fn prefix_is_not_enough() {
        assert!(!token_matches("secret", "secret-token"));
    }

    #[test]
    fn forwarded_header_wins_first_hop() {
        let request = axum::http::Request::builder()
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(())
            .unwrap();
        let (parts, _) = request.into_parts();
        assert_eq!(client_key(&parts), "203.0.113.9");
    }

    #[test]
    fn missing_forwarded_header_shares_bucket() {
        let request = axum::http::Request::builder().body(()).unwrap();
        let (parts, _) = request.into_parts();
        assert_eq!(client_key(&parts), "direct");
    }
}
