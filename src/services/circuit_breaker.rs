//! Per-worker circuit breaker over dispatch outcomes.
//!
//! State lives in Postgres so every instance of the control plane shares one
//! view of a worker's circuit. Transitions happen under a row lock; the pure
//! state machine itself is separated from persistence so it can be tested
//! directly.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::errors::AppError;
use crate::models::worker::{CircuitBreakerState, CircuitState, WorkerHealthRecord, WorkerStatus};

pub const DEFAULT_FAILURE_THRESHOLD: i32 = 5;
pub const DEFAULT_SUCCESS_THRESHOLD: i32 = 2;
pub const DEFAULT_COOLDOWN_MS: i64 = 60_000;

/// Why a worker can or cannot take a dispatch right now.
#[derive(Debug, Clone, PartialEq)]
pub enum Availability {
    Available,
    /// Administratively disabled via policy.
    Disabled(String),
    /// Health monitor says the worker is offline.
    Unhealthy(String),
    /// Circuit open and cooldown not yet elapsed.
    CircuitOpen { retry_at: Option<DateTime<Utc>> },
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }

    /// Operator-facing reason string for denial logging and 503 bodies.
    pub fn reason(&self) -> String {
        match self {
            Self::Available => "available".to_string(),
            Self::Disabled(reason) => format!("disabled by policy: {reason}"),
            Self::Unhealthy(msg) => format!("unhealthy: {msg}"),
            Self::CircuitOpen { retry_at } => match retry_at {
                Some(at) => format!("circuit open until {}", at.to_rfc3339()),
                None => "circuit open".to_string(),
            },
        }
    }
}

/// Apply one dispatch failure to the state machine.
///
/// Returns the audit event name when a transition happened.
fn apply_failure(state: &mut CircuitBreakerState, now: DateTime<Utc>) -> Option<&'static str> {
    state.updated_at = now;
    match state.state {
        CircuitState::Closed => {
            state.failure_count += 1;
            if state.failure_count >= state.failure_threshold {
                trip(state, now);
                Some("opened")
            } else {
                None
            }
        }
        CircuitState::HalfOpen => {
            // One failure during the probe window re-opens immediately.
            trip(state, now);
            Some("reopened")
        }
        CircuitState::Open => None,
    }
}

/// Apply one dispatch success to the state machine.
fn apply_success(state: &mut CircuitBreakerState, now: DateTime<Utc>) -> Option<&'static str> {
    state.updated_at = now;
    match state.state {
        CircuitState::Closed => {
            state.failure_count = 0;
            None
        }
        CircuitState::HalfOpen => {
            state.success_count += 1;
            if state.success_count >= state.success_threshold {
                state.state = CircuitState::Closed;
                state.failure_count = 0;
                state.success_count = 0;
                state.opened_at = None;
                state.next_attempt_at = None;
                Some("closed")
            } else {
                None
            }
        }
        CircuitState::Open => None,
    }
}

/// Whether the breaker itself permits a dispatch, moving open to half-open
/// once the cooldown elapses.
fn apply_gate(state: &mut CircuitBreakerState, now: DateTime<Utc>) -> (bool, Option<&'static str>) {
    match state.state {
        CircuitState::Closed | CircuitState::HalfOpen => (true, None),
        CircuitState::Open => {
            let cooled = state.next_attempt_at.is_some_and(|at| now >= at);
            if cooled {
                state.state = CircuitState::HalfOpen;
                state.success_count = 0;
                state.updated_at = now;
                (true, Some("half_opened"))
            } else {
                (false, None)
            }
        }
    }
}

fn trip(state: &mut CircuitBreakerState, now: DateTime<Utc>) {
    state.state = CircuitState::Open;
    state.success_count = 0;
    state.opened_at = Some(now);
    state.next_attempt_at = Some(now + Duration::milliseconds(state.cooldown_ms));
    state.total_trips += 1;
}

const STATE_COLUMNS: &str = "worker_name, state, failure_count, success_count,
    failure_threshold, success_threshold, cooldown_ms, opened_at,
    next_attempt_at, total_trips, updated_at";

/// Ensure a breaker row exists for the worker and return it.
pub async fn ensure_state(pool: &PgPool, worker_name: &str) -> Result<CircuitBreakerState, AppError> {
    sqlx::query(
        "INSERT INTO circuit_breaker_states
             (worker_name, failure_threshold, success_threshold, cooldown_ms)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (worker_name) DO NOTHING",
    )
    .bind(worker_name)
    .bind(DEFAULT_FAILURE_THRESHOLD)
    .bind(DEFAULT_SUCCESS_THRESHOLD)
    .bind(DEFAULT_COOLDOWN_MS)
    .execute(pool)
    .await?;

    let state: CircuitBreakerState = sqlx::query_as(&format!(
        "SELECT {STATE_COLUMNS} FROM circuit_breaker_states WHERE worker_name = $1"
    ))
    .bind(worker_name)
    .fetch_one(pool)
    .await?;
    Ok(state)
}

/// Full availability gate for one worker: policy, then health, then circuit.
pub async fn is_available(
    pool: &PgPool,
    worker_name: &str,
    config: &AppConfig,
) -> Result<Availability, AppError> {
    let policy: Option<(bool, Option<String>)> = sqlx::query_as(
        "SELECT enabled, reason FROM worker_policies WHERE worker_name = $1",
    )
    .bind(worker_name)
    .fetch_optional(pool)
    .await?;
    if let Some((false, reason)) = policy {
        return Ok(Availability::Disabled(
            reason.unwrap_or_else(|| "no reason recorded".to_string()),
        ));
    }

    let health: Option<WorkerHealthRecord> = sqlx::query_as(
        "SELECT worker_name, status, last_check_at, last_success_at,
                response_time_ms, error_message
         FROM worker_health WHERE worker_name = $1",
    )
    .bind(worker_name)
    .fetch_optional(pool)
    .await?;
    if let Some(health) = health {
        // A stale record downgrades to unknown, which does not block.
        if health.effective_status(Utc::now(), config.health_stale_after_secs)
            == WorkerStatus::Offline
        {
            return Ok(Availability::Unhealthy(
                health
                    .error_message
                    .unwrap_or_else(|| "health probe failing".to_string()),
            ));
        }
    }

    ensure_state(pool, worker_name).await?;

    let mut tx = pool.begin().await?;
    let mut state: CircuitBreakerState = sqlx::query_as(&format!(
        "SELECT {STATE_COLUMNS} FROM circuit_breaker_states
         WHERE worker_name = $1 FOR UPDATE"
    ))
    .bind(worker_name)
    .fetch_one(&mut *tx)
    .await?;

    let now = Utc::now();
    let (allowed, event) = apply_gate(&mut state, now);
    if let Some(event) = event {
        persist(&mut tx, &state).await?;
        record_event(&mut tx, worker_name, event, &state).await?;
    }
    tx.commit().await?;

    if allowed {
        Ok(Availability::Available)
    } else {
        Ok(Availability::CircuitOpen {
            retry_at: state.next_attempt_at,
        })
    }
}

/// Record a dispatch success for the worker's breaker.
pub async fn record_success(pool: &PgPool, worker_name: &str) -> Result<(), AppError> {
    record_outcome(pool, worker_name, apply_success).await
}

/// Record a dispatch failure for the worker's breaker.
pub async fn record_failure(pool: &PgPool, worker_name: &str) -> Result<(), AppError> {
    record_outcome(pool, worker_name, apply_failure).await
}

async fn record_outcome(
    pool: &PgPool,
    worker_name: &str,
    apply: fn(&mut CircuitBreakerState, DateTime<Utc>) -> Option<&'static str>,
) -> Result<(), AppError> {
    ensure_state(pool, worker_name).await?;

    let mut tx = pool.begin().await?;
    let mut state: CircuitBreakerState = sqlx::query_as(&format!(
        "SELECT {STATE_COLUMNS} FROM circuit_breaker_states
         WHERE worker_name = $1 FOR UPDATE"
    ))
    .bind(worker_name)
    .fetch_one(&mut *tx)
    .await?;

    let now = Utc::now();
    let event = apply(&mut state, now);
    persist(&mut tx, &state).await?;
    if let Some(event) = event {
        record_event(&mut tx, worker_name, event, &state).await?;
        tracing::warn!(worker_name, event, total_trips = state.total_trips, "Circuit transition");
    }
    tx.commit().await?;
    Ok(())
}

async fn persist(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    state: &CircuitBreakerState,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE circuit_breaker_states
         SET state = $2, failure_count = $3, success_count = $4, opened_at = $5,
             next_attempt_at = $6, total_trips = $7, updated_at = $8
         WHERE worker_name = $1",
    )
    .bind(&state.worker_name)
    .bind(state.state)
    .bind(state.failure_count)
    .bind(state.success_count)
    .bind(state.opened_at)
    .bind(state.next_attempt_at)
    .bind(state.total_trips)
    .bind(state.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn record_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    worker_name: &str,
    event: &str,
    state: &CircuitBreakerState,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO circuit_breaker_events (worker_name, event, details)
         VALUES ($1, $2, $3)",
    )
    .bind(worker_name)
    .bind(event)
    .bind(serde_json::json!({
        "failure_count": state.failure_count,
        "success_count": state.success_count,
        "total_trips": state.total_trips,
        "next_attempt_at": state.next_attempt_at,
    }))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Reset a breaker to closed with zeroed counters (operator action).
pub async fn reset(pool: &PgPool, worker_name: &str) -> Result<(), AppError> {
    ensure_state(pool, worker_name).await?;
    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE circuit_breaker_states
         SET state = 'closed', failure_count = 0, success_count = 0,
             opened_at = NULL, next_attempt_at = NULL, updated_at = NOW()
         WHERE worker_name = $1",
    )
    .bind(worker_name)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "INSERT INTO circuit_breaker_events (worker_name, event, details)
         VALUES ($1, 'reset', '{}'::jsonb)",
    )
    .bind(worker_name)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    tracing::info!(worker_name, "Circuit breaker reset");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_state() -> CircuitBreakerState {
        CircuitBreakerState {
            worker_name: "maigret".to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            opened_at: None,
            next_attempt_at: None,
            total_trips: 0,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn closed_trips_open_at_failure_threshold() {
        let mut state = fresh_state();
        let now = Utc::now();
        for _ in 0..DEFAULT_FAILURE_THRESHOLD - 1 {
            assert_eq!(apply_failure(&mut state, now), None);
        }
        assert_eq!(apply_failure(&mut state, now), Some("opened"));
        assert_eq!(state.state, CircuitState::Open);
        assert_eq!(state.total_trips, 1);
        assert_eq!(
            state.next_attempt_at,
            Some(now + Duration::milliseconds(DEFAULT_COOLDOWN_MS))
        );
    }

    #[test]
    fn success_resets_closed_failure_count() {
        let mut state = fresh_state();
        let now = Utc::now();
        apply_failure(&mut state, now);
        apply_failure(&mut state, now);
        assert_eq!(state.failure_count, 2);
        apply_success(&mut state, now);
        assert_eq!(state.failure_count, 0);
        assert_eq!(state.state, CircuitState::Closed);
    }

    #[test]
    fn open_gate_denies_before_cooldown() {
        let mut state = fresh_state();
        let now = Utc::now();
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            apply_failure(&mut state, now);
        }
        let (allowed, event) = apply_gate(&mut state, now + Duration::seconds(10));
        assert!(!allowed);
        assert_eq!(event, None);
        assert_eq!(state.state, CircuitState::Open);
    }

    #[test]
    fn open_gate_half_opens_after_cooldown() {
        let mut state = fresh_state();
        let now = Utc::now();
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            apply_failure(&mut state, now);
        }
        let (allowed, event) = apply_gate(&mut state, now + Duration::milliseconds(60_001));
        assert!(allowed);
        assert_eq!(event, Some("half_opened"));
        assert_eq!(state.state, CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let mut state = fresh_state();
        state.state = CircuitState::HalfOpen;
        let now = Utc::now();
        assert_eq!(apply_success(&mut state, now), None);
        assert_eq!(apply_success(&mut state, now), Some("closed"));
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
        assert_eq!(state.next_attempt_at, None);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let mut state = fresh_state();
        state.state = CircuitState::HalfOpen;
        state.total_trips = 1;
        let now = Utc::now();
        assert_eq!(apply_failure(&mut state, now), Some("reopened"));
        assert_eq!(state.state, CircuitState::Open);
        assert_eq!(state.total_trips, 2);
    }

    #[test]
    fn availability_reasons_read_well() {
        assert!(Availability::Available.is_available());
        let denied = Availability::Disabled("legal hold".to_string());
        assert!(!denied.is_available());
        assert_eq!(denied.reason(), "disabled by policy: legal hold");
    }
}
