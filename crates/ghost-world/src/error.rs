//! Error types for ghost-world.

use thiserror::Error;

/// Result type for ghost-world operations.
pub type Result<T> = std::result::Result<T, ArbitrationError>;

/// Why a candidate state was rejected, or the gate could not be built.
#[derive(Debug, Clone, Error)]
pub enum ArbitrationError {
    /// Candidate does not match the world-state schema.
    #[error("Schema Mismatch: {0}")]
    SchemaMismatch(String),

    /// Candidate contains credential-shaped content.
    #[error("Security Violation: matched {rule}")]
    SecurityViolation { rule: &'static str },

    /// A security rule failed to compile.
    #[error("invalid security rule: {0}")]
    InvalidRule(#[from] regex::Error),
}
