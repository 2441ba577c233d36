//! API error types and response formatting.
//!
//! Every error leaving the API carries a stable machine-readable `code`
//! that clients dispatch on; the human message is advisory only.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use evp_ingest::IngestError;
use serde::Serialize;

/// API error type that converts to appropriate HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// No `x-api-key` header was provided.
    #[error("missing API key")]
    MissingApiKey,

    /// The API key is unknown, revoked or expired.
    #[error("invalid API key")]
    InvalidApiKey,

    /// The payload failed schema validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The pipeline could not admit the event (infrastructure failure).
    #[error("ingestion failed: {0}")]
    Ingestion(String),
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::InvalidBatchSize { .. } => Self::Validation(err.to_string()),
            IngestError::Stream(_) => Self::Ingestion(err.to_string()),
        }
    }
}

/// JSON error response body.
#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    success: bool,
    error: ErrorBody,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingApiKey => "MISSING_API_KEY",
            Self::InvalidApiKey => "INVALID_API_KEY",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Ingestion(_) => "INGESTION_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::MissingApiKey | Self::InvalidApiKey => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Ingestion(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, Self::Ingestion(_)) {
            tracing::error!(error = %self, "ingestion error");
        }

        let body = ErrorResponse {
            success: false,
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ApiError::MissingApiKey.code(), "MISSING_API_KEY");
        assert_eq!(ApiError::InvalidApiKey.code(), "INVALID_API_KEY");
        assert_eq!(ApiError::Validation(String::new()).code(), "VALIDATION_ERROR");
        assert_eq!(ApiError::Ingestion(String::new()).code(), "INGESTION_ERROR");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::MissingApiKey.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Ingestion("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_batch_size_error_maps_to_validation() {
        let err: ApiError = IngestError::InvalidBatchSize { len: 1001, max: 1000 }.into();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
