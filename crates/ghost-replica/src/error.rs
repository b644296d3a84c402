//! Error types for ghost-replica.

use thiserror::Error;

use crate::content::ContentHash;

/// Result type for ghost-replica operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in replica operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A fulfilled payload does not hash to the announced address.
    #[error("content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
