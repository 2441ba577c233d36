//! Event submission endpoints.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use evp_core::IngestRequest;
use evp_ingest::IngestOutcome;
use serde::{Deserialize, Serialize};

use crate::auth::SourceUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Success envelope shared by the event endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SuccessResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> SuccessResponse<T> {
    fn new(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// Response data for a single event submission.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    pub event_id: String,
    pub accepted: bool,
    pub duplicate: bool,
}

/// `POST /v1/events`
///
/// Submit one event. `202` with `accepted:true` on a new accept, `200`
/// with `duplicate:true` when the same `eventId` was accepted within the
/// dedup window.
pub async fn ingest_event(
    State(state): State<AppState>,
    Extension(SourceUser(source_user_id)): Extension<SourceUser>,
    body: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::Validation(e.body_text()))?;

    match state.ingest.ingest(&request, &source_user_id)? {
        IngestOutcome::Accepted { event_id } => Ok((
            StatusCode::ACCEPTED,
            Json(SuccessResponse::new(IngestResponse {
                event_id,
                accepted: true,
                duplicate: false,
            })),
        )
            .into_response()),
        IngestOutcome::Duplicate { event_id } => Ok((
            StatusCode::OK,
            Json(SuccessResponse::new(IngestResponse {
                event_id,
                accepted: false,
                duplicate: true,
            })),
        )
            .into_response()),
        IngestOutcome::Rejected(error) => Err(ApiError::Validation(error.to_string())),
    }
}

/// Request body for batch submission.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchRequest {
    pub events: Vec<IngestRequest>,
}

/// One rejected batch member.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedEvent {
    /// Index into the submitted `events` array.
    pub index: usize,
    pub field: String,
    pub message: String,
}

/// Response data for a batch submission.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    pub accepted: usize,
    pub duplicates: usize,
    pub total: usize,
    pub event_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedEvent>,
}

/// `POST /v1/events/batch`
///
/// Submit 1-1000 events in one request. Always `202` when the batch shape
/// is valid; per-event validation failures are reported in `rejected`
/// without failing the rest of the batch.
pub async fn ingest_batch(
    State(state): State<AppState>,
    Extension(SourceUser(source_user_id)): Extension<SourceUser>,
    body: Result<Json<BatchRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(batch) = body.map_err(|e| ApiError::Validation(e.body_text()))?;
    let total = batch.events.len();

    let outcome = state.ingest.ingest_batch(&batch.events, &source_user_id)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SuccessResponse::new(BatchResponse {
            accepted: outcome.accepted_ids.len(),
            duplicates: outcome.duplicates,
            total,
            event_ids: outcome.accepted_ids,
            rejected: outcome
                .rejected
                .into_iter()
                .map(|(index, error)| RejectedEvent {
                    index,
                    field: error.field,
                    message: error.message,
                })
                .collect(),
        })),
    )
        .into_response())
}
