//! Normalized API errors.
//!
//! Every failure that leaves the request pipeline is reshaped into an
//! [`ApiError`] carrying `{code, message, timestamp, http_status}`. Backend
//! error payloads are loosely shaped (`{error, message, timestamp}`, all
//! optional), so each field falls back to a default when missing.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::transport::TransportFailure;

pub const DEFAULT_ERROR_CODE: &str = "UNKNOWN_ERROR";
pub const DEFAULT_ERROR_MESSAGE: &str = "An unexpected error occurred";
pub const NETWORK_ERROR_CODE: &str = "NETWORK_ERROR";
pub const CANCELLED_ERROR_CODE: &str = "REQUEST_CANCELLED";
pub const DECODE_ERROR_CODE: &str = "DECODE_ERROR";

/// Error classes the pipeline distinguishes for recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// No response was received (offline, DNS, timeout).
    Transport,
    /// 401-class failure that survived the refresh-and-retry cycle.
    Auth,
    /// 429-class failure that survived every backoff retry.
    RateLimit,
    /// Remaining 4xx responses.
    Validation,
    /// 5xx responses.
    Server,
    /// A success response whose body could not be decoded.
    Decode,
    /// The caller cancelled the request.
    Cancelled,
}

impl ApiErrorKind {
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Auth,
            429 => Self::RateLimit,
            500..=599 => Self::Server,
            _ => Self::Validation,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Validation => "validation",
            Self::Server => "server",
            Self::Decode => "decode",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub http_status: Option<u16>,
}

impl ApiError {
    /// Normalize an HTTP error response. The body may be empty, non-JSON, or
    /// a partial `{error, message, timestamp}` object.
    #[must_use]
    pub fn from_response(status: u16, body: &[u8]) -> Self {
        let payload = serde_json::from_slice::<Value>(body).unwrap_or(Value::Null);
        let code = payload
            .get("error")
            .and_then(scalar_text)
            .unwrap_or_else(|| DEFAULT_ERROR_CODE.to_string());
        let message = payload
            .get("message")
            .and_then(scalar_text)
            .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string());
        let timestamp = payload
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map_or_else(Utc::now, |parsed| parsed.with_timezone(&Utc));

        Self {
            kind: ApiErrorKind::from_status(status),
            code,
            message,
            timestamp,
            http_status: Some(status),
        }
    }

    #[must_use]
    pub fn transport(failure: &TransportFailure) -> Self {
        Self {
            kind: ApiErrorKind::Transport,
            code: NETWORK_ERROR_CODE.to_string(),
            message: failure.to_string(),
            timestamp: Utc::now(),
            http_status: None,
        }
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self {
            kind: ApiErrorKind::Cancelled,
            code: CANCELLED_ERROR_CODE.to_string(),
            message: "request was cancelled".to_string(),
            timestamp: Utc::now(),
            http_status: None,
        }
    }

    #[must_use]
    pub fn decode(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Decode,
            code: DECODE_ERROR_CODE.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
            http_status: Some(status),
        }
    }

    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Validation,
            code: "INVALID_REQUEST".to_string(),
            message: message.into(),
            timestamp: Utc::now(),
            http_status: None,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.kind == ApiErrorKind::Cancelled
    }

    /// Transport failures are safe to retry at the caller's discretion.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind == ApiErrorKind::Transport
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        _ => return None,
    };
    if text.is_empty() { None } else { Some(text) }
}
