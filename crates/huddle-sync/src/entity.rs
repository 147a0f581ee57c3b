//! Cached domain records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Shared entity (room, event, group) as served by `GET /entities/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    #[serde(default)]
    pub participant_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub is_joined: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity {
    pub fn new(id: impl Into<String>, participant_count: u32, capacity: Option<u32>) -> Self {
        Self {
            id: id.into(),
            participant_count,
            capacity,
            is_joined: false,
            owner_id: None,
            extra: Map::new(),
        }
    }

    pub fn joined(mut self, is_joined: bool) -> Self {
        self.is_joined = is_joined;
        self
    }

    /// Copy of this entity with `fields` shallow-merged over its wire form.
    /// `id` is never overwritten.
    pub fn merged(&self, fields: &Map<String, Value>) -> Result<Self, serde_json::Error> {
        let mut wire = match serde_json::to_value(self)? {
            Value::Object(wire) => wire,
            _ => Map::new(),
        };
        for (key, value) in fields {
            if key == "id" {
                continue;
            }
            wire.insert(key.clone(), value.clone());
        }
        serde_json::from_value(Value::Object(wire))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Participant {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
            avatar_url: None,
            joined_at: None,
            extra: Map::new(),
        }
    }
}

/// One page of `GET /entities`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityPage {
    #[serde(default)]
    pub items: Vec<Entity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl EntityPage {
    pub fn new(items: Vec<Entity>, next_cursor: Option<String>) -> Self {
        Self { items, next_cursor }
    }
}
