//! Topic naming and the chat channel helper.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use crate::client::{SocketClient, TopicSubscription};
use crate::error::{Result, SocketError};

const ENTITY_TOPIC_PREFIX: &str = "entity:";

pub fn entity_topic(entity_id: &str) -> String {
    format!("{ENTITY_TOPIC_PREFIX}{}", entity_id.trim())
}

pub fn chat_topic(entity_id: &str) -> String {
    format!("{}:chat", entity_topic(entity_id))
}

pub fn typing_topic(entity_id: &str) -> String {
    format!("{}:typing", entity_topic(entity_id))
}

/// Entity id addressed by an `entity:{id}` topic or one of its sub-topics.
pub fn parse_entity_topic(topic: &str) -> Option<&str> {
    let rest = topic.strip_prefix(ENTITY_TOPIC_PREFIX)?;
    let entity_id = rest.split(':').next().unwrap_or_default().trim();
    if entity_id.is_empty() {
        None
    } else {
        Some(entity_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingIndicator {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub typing: bool,
}

/// Chat and typing topics of one entity over a shared [`SocketClient`].
#[derive(Clone)]
pub struct ChatChannel {
    client: SocketClient,
    entity_id: String,
}

impl ChatChannel {
    pub fn new(client: SocketClient, entity_id: impl Into<String>) -> Self {
        Self {
            client,
            entity_id: entity_id.into(),
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Publish a chat message. Returns the generated client message id so
    /// the caller can match the server echo.
    pub fn send_message(&self, body: &str) -> Result<String> {
        let body = body.trim();
        if body.is_empty() {
            return Err(SocketError::InvalidPayload(
                "chat message body is empty".to_string(),
            ));
        }
        let client_message_id = Uuid::new_v4().to_string();
        self.client.publish(
            &chat_topic(&self.entity_id),
            json!({
                "type": "message",
                "clientMessageId": client_message_id,
                "body": body,
            }),
        )?;
        Ok(client_message_id)
    }

    pub fn set_typing(&self, typing: bool) -> Result<()> {
        self.client
            .publish(&typing_topic(&self.entity_id), json!({ "typing": typing }))
    }

    pub fn on_message<F>(&self, listener: F) -> TopicSubscription
    where
        F: Fn(ChatMessage) + Send + Sync + 'static,
    {
        self.client
            .subscribe(&chat_topic(&self.entity_id), move |payload: &Value| {
                match serde_json::from_value::<ChatMessage>(payload.clone()) {
                    Ok(message) => listener(message),
                    Err(error) => debug!("ignoring undecodable chat payload: {}", error),
                }
            })
    }

    pub fn on_typing<F>(&self, listener: F) -> TopicSubscription
    where
        F: Fn(TypingIndicator) + Send + Sync + 'static,
    {
        self.client
            .subscribe(&typing_topic(&self.entity_id), move |payload: &Value| {
                match serde_json::from_value::<TypingIndicator>(payload.clone()) {
                    Ok(indicator) => listener(indicator),
                    Err(error) => debug!("ignoring undecodable typing payload: {}", error),
                }
            })
    }
}
