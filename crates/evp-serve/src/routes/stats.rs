//! Ingestion statistics endpoint.

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::AppState;

/// Response for `GET /v1/events/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    /// Events per second over the trailing minute.
    pub ingestion_rate: f64,
    /// Events accepted since startup.
    pub total_ingested: u64,
    pub timestamp: DateTime<Utc>,
}

/// `GET /v1/events/stats`
///
/// Returns the current ingestion rate and cumulative total.
pub async fn ingest_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let snapshot = state.counters.snapshot();
    Json(StatsResponse {
        ingestion_rate: snapshot.ingest_rate,
        total_ingested: snapshot.total_ingested,
        timestamp: Utc::now(),
    })
}
