//! Error types for the order-flow recorder

use thiserror::Error;

/// Order-flow recorder errors
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("Feed closed by the exchange")]
    FeedClosed,

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("REST API error: {0}")]
    RestApiError(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Reconciliation inconsistency for {product}: {reason}")]
    Reconciliation { product: String, reason: String },

    #[error("Sequence gap on {product}: expected {expected}, got {got}")]
    SequenceGap {
        product: String,
        expected: u64,
        got: u64,
    },

    #[error("Persister stopped: {0}")]
    PersisterStopped(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Max reconnection attempts exceeded")]
    MaxReconnectAttemptsExceeded,
}

impl RecorderError {
    /// Whether the ingestion loop may recover by reconnecting and resynchronizing.
    ///
    /// Transport, snapshot and sequencing failures are transient. Anything that
    /// touches the integrity of stored history halts ingestion instead.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RecorderError::WebSocketConnection(_)
                | RecorderError::WebSocketMessage(_)
                | RecorderError::FeedClosed
                | RecorderError::ParseError(_)
                | RecorderError::RestApiError(_)
                | RecorderError::SequenceGap { .. }
                | RecorderError::ConnectionTimeout
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RecorderError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RecorderError::WebSocketConnection(err.to_string())
    }
}

impl From<serde_json::Error> for RecorderError {
    fn from(err: serde_json::Error) -> Self {
        RecorderError::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for RecorderError {
    fn from(err: reqwest::Error) -> Self {
        RecorderError::RestApiError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RecorderError>;
