//! Wire envelope for socket frames: `{"topic": "...", "payload": ...}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SocketError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
}

impl Frame {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

/// Parse an inbound text frame. Frames without a non-empty topic are rejected.
pub fn parse_frame(text: &str) -> Result<Frame> {
    let frame: Frame = serde_json::from_str(text)?;
    if frame.topic.trim().is_empty() {
        return Err(SocketError::Protocol("frame topic is empty".to_string()));
    }
    Ok(frame)
}

pub fn encode_frame(topic: &str, payload: &Value) -> Result<String> {
    if topic.trim().is_empty() {
        return Err(SocketError::InvalidPayload(
            "cannot publish to an empty topic".to_string(),
        ));
    }
    let envelope = serde_json::json!({ "topic": topic, "payload": payload });
    Ok(serde_json::to_string(&envelope)?)
}
