//! Error types for ghost-protocols.

use thiserror::Error;

/// Result type for ghost-protocols operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding or handling mesh traffic.
#[derive(Debug, Error)]
pub enum Error {
    /// Event has no `type` tag.
    #[error("event has no type tag")]
    MissingTag,

    /// Event has a known tag but its fields do not parse.
    #[error("malformed {tag} event: {source}")]
    Malformed {
        tag: String,
        #[source]
        source: serde_json::Error,
    },

    /// Event parsed but carries values outside their domain.
    #[error("invalid event: {0}")]
    Invalid(String),

    /// Content exchange failure (hash mismatch, encoding).
    #[error("content error: {0}")]
    Content(#[from] ghost_replica::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
