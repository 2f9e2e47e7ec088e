//! Error types for the Usher core library.

use thiserror::Error;

/// Result type alias using Usher [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error types for wire-level operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Envelope does not carry a usable generation id
    #[error("event envelope missing generation id")]
    MissingGeneration,

    /// Envelope failed structural validation
    #[error("malformed event envelope: {0}")]
    MalformedEnvelope(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
