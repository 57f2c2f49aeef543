use std::time::Duration;

use thiserror::Error;

/// Main error type for the loader and its sinks
#[derive(Error, Debug)]
pub enum DepthcastError {
    // Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Validation(String),

    // Database errors
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("exchange returned {status}: {message}")]
    ExchangeHttp { status: u16, message: String },

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    // Payload errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed exchange payload: {0}")]
    Protocol(String),

    // Engine errors
    #[error("depth streams not available within {0:?}")]
    BootstrapTimeout(Duration),

    // Sink errors
    #[error("record encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("record decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for DepthcastError
pub type Result<T> = std::result::Result<T, DepthcastError>;

impl DepthcastError {
    /// Whether the supervisor loop should restart the session instead of
    /// aborting the process.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_)
                | Self::ExchangeHttp { .. }
                | Self::WebSocket(_)
                | Self::Json(_)
                | Self::Protocol(_)
                | Self::BootstrapTimeout(_)
        )
    }
}
