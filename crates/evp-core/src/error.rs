//! Error types shared across the pipeline crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while handling events.
#[derive(Error, Debug)]
pub enum Error {
    /// A stream entry could not be decoded back into an event.
    ///
    /// Workers acknowledge and drop entries that produce this error so a
    /// single bad record cannot wedge the stream.
    #[error("malformed stream entry: {0}")]
    MalformedEntry(String),

    /// An event field has an invalid value.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// JSON encoding/decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
