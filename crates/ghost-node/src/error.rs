//! Error types for the Ghost node.

use thiserror::Error;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in node operations.
///
/// Remote-triggered failures (bad frames, rejected worlds, dropped links)
/// never surface here; they are logged and dropped where they occur.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration value
    #[error("Config error: {0}")]
    Config(String),

    /// No signaling relay configured
    #[error("No signaling relays configured")]
    NoRelays,

    /// Room id rejected before joining
    #[error("Invalid room id: {0:?}")]
    InvalidRoom(String),

    /// Relay handshake or link failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// World producer failure
    #[error("Producer error: {0}")]
    Producer(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ghost_protocols::Error),

    /// Arbitrator construction error
    #[error("Arbitration error: {0}")]
    Arbitration(#[from] ghost_world::ArbitrationError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
