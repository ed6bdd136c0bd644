//! Route definitions for the scanplane API.

use axum::routing::{get, patch, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub mod health;
pub mod incidents;
pub mod scans;
pub mod webhook;
pub mod workers;

/// Assemble the full application router. Shared by `main.rs` and the
/// integration tests so both always serve the same surface.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/scans", post(scans::create).get(scans::list))
        .route("/scans/{id}", get(scans::get_by_id))
        .route("/scans/{id}/findings", get(scans::list_findings))
        .route("/findings/{id}/overlay", patch(scans::update_overlay))
        .route("/webhooks/results", post(webhook::results))
        .route("/webhooks/health", post(webhook::health_report))
        .route("/workers", get(workers::list))
        .route("/workers/{name}/policy", put(workers::update_policy))
        .route("/workers/{name}/reset", post(workers::reset))
        .route("/incidents", get(incidents::list));

    Router::new()
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .nest("/api/v1", api)
        // Result batches are the largest bodies; 16 MiB cap.
        .layer(RequestBodyLimitLayer::new(16 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
