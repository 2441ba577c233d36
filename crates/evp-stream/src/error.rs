//! Error types for the stream primitives.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors raised by the event stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// A consumer-group operation named a group that was never created.
    #[error("unknown consumer group '{0}'")]
    UnknownGroup(String),

    /// The stream is at capacity; the append was refused.
    ///
    /// Retained entries (un-acknowledged plus not-yet-delivered) count
    /// against the capacity, so a stalled worker pool eventually pushes
    /// back on producers instead of growing without bound.
    #[error("stream is full ({capacity} retained entries)")]
    Full {
        /// Configured retention capacity.
        capacity: usize,
    },
}
