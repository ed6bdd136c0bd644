//! Fixed-window rate limiting backed by the Redis counter store.
//!
//! Admission is an atomic check-and-increment (`INCR` inside a MULTI/EXEC
//! pipeline), so concurrent attempts for the same subject serialize in Redis
//! and at most `max_allowed` succeed per window. When the counter store is
//! unreachable the limiter fails open: availability of the product outranks
//! strict quota enforcement for a transient infrastructure fault.

use chrono::{DateTime, TimeZone, Utc};
use redis::AsyncCommands;

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allowed,
    Denied {
        reset_at: DateTime<Utc>,
        message: String,
    },
}

/// Parameters for one limit type.
#[derive(Debug, Clone, Copy)]
pub struct LimitSpec {
    pub max_allowed: i64,
    pub window_secs: i64,
}

/// Compute the window start from a single authoritative timestamp, so the
/// check and the increment always agree on the window boundary.
fn window_start(now: DateTime<Utc>, window_secs: i64) -> i64 {
    let ts = now.timestamp();
    ts - ts.rem_euclid(window_secs)
}

fn counter_key(limit_type: &str, subject: &str, start: i64) -> String {
    format!("rl:{limit_type}:{subject}:{start}")
}

fn block_key(limit_type: &str, subject: &str) -> String {
    format!("rl:block:{limit_type}:{subject}")
}

/// Atomic check-and-increment against the counter store.
///
/// Returns `Allowed` when the incremented count is within the limit, or on
/// any counter-store failure (fail open, logged).
pub async fn try_admit(
    redis: &redis::Client,
    subject: &str,
    limit_type: &str,
    spec: LimitSpec,
) -> Decision {
    let now = Utc::now();
    let start = window_start(now, spec.window_secs);
    let key = counter_key(limit_type, subject, start);

    let count: i64 = match incr_with_ttl(redis, &key, spec.window_secs).await {
        Ok(count) => count,
        Err(e) => {
            tracing::warn!(
                subject,
                limit_type,
                error = %e,
                "Rate limit counter store unreachable, failing open"
            );
            return Decision::Allowed;
        }
    };

    if count <= spec.max_allowed {
        Decision::Allowed
    } else {
        let reset_at = Utc
            .timestamp_opt(start + spec.window_secs, 0)
            .single()
            .unwrap_or(now);
        Decision::Denied {
            reset_at,
            message: format!(
                "{limit_type} limit reached ({} per {}s)",
                spec.max_allowed, spec.window_secs
            ),
        }
    }
}

/// Sibling limiter for authentication-sensitive endpoints: record one failed
/// attempt and install a lockout once `max_failures` is reached.
pub async fn record_auth_failure(
    redis: &redis::Client,
    subject: &str,
    limit_type: &str,
    spec: LimitSpec,
    lockout_secs: i64,
) -> Result<(), redis::RedisError> {
    let now = Utc::now();
    let start = window_start(now, spec.window_secs);
    let key = counter_key(limit_type, subject, start);

    let count = incr_with_ttl(redis, &key, spec.window_secs).await?;

    if count >= spec.max_allowed {
        let mut conn = redis.get_multiplexed_async_connection().await?;
        let blocked_until = now.timestamp() + lockout_secs;
        let _: () = conn
            .set_ex(
                block_key(limit_type, subject),
                blocked_until,
                lockout_secs as u64,
            )
            .await?;
        tracing::warn!(subject, limit_type, blocked_until, "Auth lockout installed");
    }

    Ok(())
}

/// Check whether a subject is currently locked out. Fails open.
pub async fn blocked_until(
    redis: &redis::Client,
    subject: &str,
    limit_type: &str,
) -> Option<DateTime<Utc>> {
    let mut conn = match redis.get_multiplexed_async_connection().await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(subject, error = %e, "Lockout check failed open");
            return None;
        }
    };
    let epoch: Option<i64> = conn.get(block_key(limit_type, subject)).await.ok()?;
    let epoch = epoch?;
    let until = Utc.timestamp_opt(epoch, 0).single()?;
    (until > Utc::now()).then_some(until)
}

/// INCR + EXPIRE inside one MULTI/EXEC so the counter and its TTL commit
/// together. The key embeds the window start, so refreshing the TTL on
/// every hit only delays cleanup, never extends the window.
async fn incr_with_ttl(
    redis: &redis::Client,
    key: &str,
    ttl_secs: i64,
) -> Result<i64, redis::RedisError> {
    let mut conn = redis.get_multiplexed_async_connection().await?;
    let (count,): (i64,) = redis::pipe()
        .atomic()
        .incr(key, 1)
        .expire(key, ttl_secs)
        .ignore()
        .query_async(&mut conn)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_start_is_aligned() {
        let now = Utc.timestamp_opt(10_000, 0).single().unwrap();
        assert_eq!(window_start(now, 3600), 7200);

        let boundary = Utc.timestamp_opt(7200, 0).single().unwrap();
        assert_eq!(window_start(boundary, 3600), 7200);
    }

    #[test]
    fn same_window_same_key() {
        let t1 = Utc.timestamp_opt(7201, 0).single().unwrap();
        let t2 = Utc.timestamp_opt(10_799, 0).single().unwrap();
        let k1 = counter_key("scan_hourly", "tenant-a", window_start(t1, 3600));
        let k2 = counter_key("scan_hourly", "tenant-a", window_start(t2, 3600));
        assert_eq!(k1, k2);
    }

    #[test]
    fn next_window_different_key() {
        let t1 = Utc.timestamp_opt(7201, 0).single().unwrap();
        let t2 = Utc.timestamp_opt(10_801, 0).single().unwrap();
        let k1 = counter_key("scan_hourly", "tenant-a", window_start(t1, 3600));
        let k2 = counter_key("scan_hourly", "tenant-a", window_start(t2, 3600));
        assert_ne!(k1, k2);
    }

    #[tokio::test]
    async fn unreachable_store_fails_open() {
        // Port 1 is never listening; the connection attempt errors quickly.
        let client = redis::Client::open("redis://127.0.0.1:1").unwrap();
        let decision = try_admit(
            &client,
            "tenant-a",
            "scan_hourly",
            LimitSpec {
                max_allowed: 1,
                window_secs: 3600,
            },
        )
        .await;
        assert_eq!(decision, Decision::Allowed);
    }

    #[tokio::test]
    async fn unreachable_store_reports_no_lockout() {
        let client = redis::Client::open("redis://127.0.0.1:1").unwrap();
        assert!(blocked_until(&client, "1.2.3.4", "auth_login").await.is_none());
    }
}
