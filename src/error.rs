//! Error types for the event broker.

use thiserror::Error;

/// Main error type for broker and persistence operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The persistence layer rejected or failed an operation.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Sentinel returned by playback visitors to stop iteration when the
    /// subscriber has gone away.
    #[error("playback shutting down")]
    PlaybackShutdown,

    /// Sentinel returned by playback visitors once the historical replay has
    /// reached the live stream.
    #[error("caught up")]
    CaughtUp,

    /// The persistence layer has been shut down.
    #[error("event persistence is shut down")]
    Shutdown,
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
