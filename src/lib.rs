pub mod config;
pub mod db;
pub mod errors;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use sqlx::PgPool;

/// Shared application state passed to all Axum handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: config::AppConfig,
    /// Counter store behind the rate limiter. Client is cheap to clone;
    /// connections are established per use so an unreachable Redis degrades
    /// to fail-open instead of failing startup.
    pub redis: redis::Client,
    pub http: reqwest::Client,
}
