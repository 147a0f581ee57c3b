//! Sync error types.

use huddle_client_core::{ApiError, ConfigError, CredentialStoreError};
use huddle_socket::SocketError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Credentials(#[from] CredentialStoreError),

    #[error("socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("push event on {topic} is not an object")]
    InvalidEvent { topic: String },
}

impl SyncError {
    pub fn api(&self) -> Option<&ApiError> {
        match self {
            Self::Api(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.api().is_some_and(ApiError::is_cancelled)
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
