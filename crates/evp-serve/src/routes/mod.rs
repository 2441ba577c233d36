//! API route definitions.

mod events;
mod health;
mod stats;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::auth::require_api_key;
use crate::state::AppState;

pub use events::{BatchRequest, BatchResponse, IngestResponse, RejectedEvent, SuccessResponse};
pub use stats::StatsResponse;

/// Build the complete API router.
///
/// # Route Structure
///
/// ## Public (no auth)
/// - `GET /health` - Health check
///
/// ## Protected (`x-api-key` required)
/// - `POST /v1/events` - Submit one event
/// - `POST /v1/events/batch` - Submit 1-1000 events
/// - `GET /v1/events/stats` - Ingestion rate and totals
pub fn router(state: AppState) -> Router {
    // Public routes (no authentication)
    let public = Router::new().route("/health", get(health::health_check));

    // Protected API routes
    let v1 = Router::new()
        .route("/events", post(events::ingest_event))
        .route("/events/batch", post(events::ingest_batch))
        .route("/events/stats", get(stats::ingest_stats))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .merge(public)
        .nest("/v1", v1)
        .with_state(state)
}
