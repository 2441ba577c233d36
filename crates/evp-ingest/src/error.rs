//! Error types for the ingestion service and worker.

use thiserror::Error;

/// Errors from the external store ports (event store, dead-letter sink,
/// credential store).
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The backend could not be reached or timed out; retryable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the write for a non-transient reason.
    #[error("store rejected write: {0}")]
    Rejected(String),
}

/// Errors surfaced by the ingestion fast path.
///
/// Validation failures are not errors here; they are an
/// [`IngestOutcome::Rejected`](crate::service::IngestOutcome::Rejected)
/// answer. This type covers the cases the API maps to `INGESTION_ERROR`.
#[derive(Error, Debug)]
pub enum IngestError {
    /// The stream refused the append (backpressure or backend failure).
    #[error("stream append failed: {0}")]
    Stream(#[from] evp_stream::StreamError),

    /// A batch outside the accepted 1..=1000 size range.
    #[error("batch size {len} outside accepted range 1..={max}")]
    InvalidBatchSize { len: usize, max: usize },
}

/// Errors that abort one iteration of the worker loop.
///
/// These never propagate out of the worker; the loop logs, drops its
/// buffer and backs off.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("stream operation failed: {0}")]
    Stream(#[from] evp_stream::StreamError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Unavailable("connection reset".to_string());
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_invalid_batch_size_display() {
        let err = IngestError::InvalidBatchSize { len: 1001, max: 1000 };
        let msg = err.to_string();
        assert!(msg.contains("1001"));
        assert!(msg.contains("1000"));
    }

    #[test]
    fn test_worker_error_from_stream_error() {
        let err: WorkerError = evp_stream::StreamError::UnknownGroup("g".to_string()).into();
        assert!(err.to_string().contains("'g'"));
    }
}
