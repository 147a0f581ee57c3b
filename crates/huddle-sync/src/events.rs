//! Server-pushed domain events and how they fold into the cache.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::cache::{QueryCache, QueryKey};
use crate::entity::Participant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DomainEvent {
    ParticipantJoined {
        entity_id: String,
        participant: Participant,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_count: Option<u32>,
    },
    ParticipantLeft {
        entity_id: String,
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_count: Option<u32>,
    },
    CapacityChanged {
        entity_id: String,
        participant_count: u32,
        #[serde(default)]
        capacity: Option<u32>,
    },
    EntityUpdated {
        entity_id: String,
        #[serde(default)]
        fields: Map<String, Value>,
    },
}

impl DomainEvent {
    pub fn entity_id(&self) -> &str {
        match self {
            Self::ParticipantJoined { entity_id, .. }
            | Self::ParticipantLeft { entity_id, .. }
            | Self::CapacityChanged { entity_id, .. }
            | Self::EntityUpdated { entity_id, .. } => entity_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ParticipantJoined { .. } => "participant_joined",
            Self::ParticipantLeft { .. } => "participant_left",
            Self::CapacityChanged { .. } => "capacity_changed",
            Self::EntityUpdated { .. } => "entity_updated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FoldOutcome {
    /// Cache entries changed.
    Applied(Vec<QueryKey>),
    /// Entity is cached but the event changed nothing.
    Unchanged,
    /// Entity is absent from the cache.
    Dropped,
}

pub fn fold_event(cache: &mut QueryCache, event: &DomainEvent) -> FoldOutcome {
    let entity_id = event.entity_id();
    let has_participants = cache.participants(entity_id).is_some();
    if !cache.contains_entity(entity_id) && !has_participants {
        debug!("dropping {} for uncached entity {}", event.kind(), entity_id);
        return FoldOutcome::Dropped;
    }

    let mut touched = Vec::new();
    match event {
        DomainEvent::ParticipantJoined {
            participant,
            participant_count,
            ..
        } => {
            let inserted = cache.update_participants(entity_id, |participants| {
                if participants
                    .iter()
                    .any(|existing| existing.user_id == participant.user_id)
                {
                    return false;
                }
                participants.insert(0, participant.clone());
                true
            });
            if inserted {
                touched.push(QueryKey::participants(entity_id));
            }
            touched.extend(fold_count(
                cache,
                entity_id,
                *participant_count,
                inserted || !has_participants,
                1,
            ));
        }
        DomainEvent::ParticipantLeft {
            user_id,
            participant_count,
            ..
        } => {
            let removed = cache.update_participants(entity_id, |participants| {
                let before = participants.len();
                participants.retain(|existing| existing.user_id != *user_id);
                participants.len() != before
            });
            if removed {
                touched.push(QueryKey::participants(entity_id));
            }
            touched.extend(fold_count(
                cache,
                entity_id,
                *participant_count,
                removed || !has_participants,
                -1,
            ));
        }
        DomainEvent::CapacityChanged {
            participant_count,
            capacity,
            ..
        } => {
            touched.extend(cache.update_entity(entity_id, |entity| {
                let changed =
                    entity.participant_count != *participant_count || entity.capacity != *capacity;
                entity.participant_count = *participant_count;
                entity.capacity = *capacity;
                changed
            }));
        }
        DomainEvent::EntityUpdated { fields, .. } => {
            touched.extend(cache.update_entity(entity_id, |entity| {
                match entity.merged(fields) {
                    Ok(merged) if merged != *entity => {
                        *entity = merged;
                        true
                    }
                    Ok(_) => false,
                    Err(error) => {
                        warn!("ignoring entity_updated for {}: {}", entity_id, error);
                        false
                    }
                }
            }));
        }
    }

    if touched.is_empty() {
        FoldOutcome::Unchanged
    } else {
        FoldOutcome::Applied(touched)
    }
}

/// Explicit counts overwrite. Otherwise the count moves by `delta` when the
/// event is not a replay of a roster change already applied.
fn fold_count(
    cache: &mut QueryCache,
    entity_id: &str,
    explicit: Option<u32>,
    derive: bool,
    delta: i8,
) -> Vec<QueryKey> {
    match explicit {
        Some(count) => cache.update_entity(entity_id, |entity| {
            let changed = entity.participant_count != count;
            entity.participant_count = count;
            changed
        }),
        None if derive => cache.update_entity(entity_id, |entity| {
            entity.participant_count = if delta > 0 {
                entity.participant_count.saturating_add(1)
            } else {
                entity.participant_count.saturating_sub(1)
            };
            true
        }),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedValue;
    use crate::entity::{Entity, EntityPage};
    use serde_json::json;

    fn cache() -> QueryCache {
        let mut cache = QueryCache::new();
        cache.insert(
            QueryKey::all_entities(),
            CachedValue::List(vec![EntityPage::new(
                vec![Entity::new("ent_1", 3, Some(10))],
                None,
            )]),
        );
        cache.insert(
            QueryKey::participants("ent_1"),
            CachedValue::Participants(vec![Participant::new("u_1")]),
        );
        cache
    }

    fn decode(value: Value) -> DomainEvent {
        serde_json::from_value(value).expect("event decodes")
    }

    #[test]
    fn events_decode_from_wire_shape() {
        let event = decode(json!({
            "type": "participant_joined",
            "entityId": "ent_1",
            "participant": { "userId": "u_2", "displayName": "Ada" },
        }));
        assert_eq!(event.entity_id(), "ent_1");
        assert_eq!(event.kind(), "participant_joined");

        let event = decode(json!({
            "type": "capacity_changed",
            "entityId": "ent_1",
            "participantCount": 5,
            "capacity": 12,
        }));
        assert!(matches!(
            event,
            DomainEvent::CapacityChanged {
                participant_count: 5,
                capacity: Some(12),
                ..
            }
        ));
    }

    #[test]
    fn participant_joined_inserts_at_head_and_increments() {
        let mut cache = cache();
        let event = decode(json!({
            "type": "participant_joined",
            "entityId": "ent_1",
            "participant": { "userId": "u_2" },
        }));

        assert!(matches!(fold_event(&mut cache, &event), FoldOutcome::Applied(_)));
        let participants = cache.participants("ent_1").expect("participants");
        assert_eq!(participants[0].user_id, "u_2");
        assert_eq!(participants.len(), 2);
        assert_eq!(cache.entity("ent_1").map(|e| e.participant_count), Some(4));

        assert_eq!(fold_event(&mut cache, &event), FoldOutcome::Unchanged);
        assert_eq!(cache.entity("ent_1").map(|e| e.participant_count), Some(4));
    }

    #[test]
    fn participant_left_prefers_explicit_count() {
        let mut cache = cache();
        let event = decode(json!({
            "type": "participant_left",
            "entityId": "ent_1",
            "userId": "u_1",
            "participantCount": 7,
        }));
        fold_event(&mut cache, &event);
        assert!(cache.participants("ent_1").is_some_and(<[_]>::is_empty));
        assert_eq!(cache.entity("ent_1").map(|e| e.participant_count), Some(7));
    }

    #[test]
    fn capacity_changed_is_idempotent() {
        let mut once = cache();
        let event = decode(json!({
            "type": "capacity_changed",
            "entityId": "ent_1",
            "participantCount": 6,
            "capacity": 8,
        }));
        fold_event(&mut once, &event);
        let mut twice = cache();
        fold_event(&mut twice, &event);
        assert_eq!(fold_event(&mut twice, &event), FoldOutcome::Unchanged);

        assert_eq!(
            once.value(&QueryKey::all_entities()),
            twice.value(&QueryKey::all_entities())
        );
        assert_eq!(once.entity("ent_1").and_then(|e| e.capacity), Some(8));
    }

    #[test]
    fn entity_updated_merges_fields() {
        let mut cache = cache();
        let event = decode(json!({
            "type": "entity_updated",
            "entityId": "ent_1",
            "fields": { "title": "Picnic", "capacity": 20 },
        }));
        fold_event(&mut cache, &event);
        let entity = cache.entity("ent_1").expect("entity");
        assert_eq!(entity.capacity, Some(20));
        assert_eq!(entity.extra.get("title"), Some(&json!("Picnic")));
        assert_eq!(entity.participant_count, 3);
    }

    #[test]
    fn events_for_uncached_entities_are_dropped() {
        let mut cache = cache();
        let before = cache.len();
        let event = decode(json!({
            "type": "participant_joined",
            "entityId": "ent_404",
            "participant": { "userId": "u_9" },
        }));
        assert_eq!(fold_event(&mut cache, &event), FoldOutcome::Dropped);
        assert_eq!(cache.len(), before);
        assert!(!cache.contains_entity("ent_404"));
        assert!(cache.participants("ent_404").is_none());
    }
}
