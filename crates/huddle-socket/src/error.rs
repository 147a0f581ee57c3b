//! Socket error types.

use thiserror::Error;

/// Socket client error type.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("socket client is closed")]
    Closed,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Socket result type.
pub type Result<T> = std::result::Result<T, SocketError>;
