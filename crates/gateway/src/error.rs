//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Log transport error (publish, subscribe, commit).
    #[error("Log error: {0}")]
    Log(#[from] anyhow::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Recipient resolution failed.
    #[error("Membership error: {0}")]
    Membership(String),

    /// The receive deadline expired.
    #[error("Deadline exceeded after {0:?}")]
    Timeout(std::time::Duration),

    /// The connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Outbound queue is full or gone.
    #[error("Channel send error")]
    ChannelSend,

    /// Invalid configuration value.
    #[error("Config error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
