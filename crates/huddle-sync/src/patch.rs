//! Membership patches and their compensating inverses.

use crate::cache::{QueryCache, QueryKey};
use crate::entity::Entity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Join,
    Leave,
}

impl MembershipChange {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
        }
    }

    /// Membership flag after the change.
    pub fn target_joined(self) -> bool {
        matches!(self, Self::Join)
    }
}

/// Move the membership flag to `joined`, adjusting the count by one in the
/// same direction. Occurrences already at the target are left alone so flag
/// and count never drift apart.
pub fn set_membership(entity: &mut Entity, joined: bool) -> bool {
    if entity.is_joined == joined {
        return false;
    }
    entity.is_joined = joined;
    entity.participant_count = if joined {
        entity.participant_count.saturating_add(1)
    } else {
        entity.participant_count.saturating_sub(1)
    };
    true
}

/// Forward patch: set membership on every cached occurrence of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipPatch {
    pub entity_id: String,
    pub joined: bool,
}

impl MembershipPatch {
    pub fn new(entity_id: impl Into<String>, change: MembershipChange) -> Self {
        Self {
            entity_id: entity_id.into(),
            joined: change.target_joined(),
        }
    }

    /// Apply to `cache`, returning the inverse scoped to the entries this
    /// call actually changed.
    pub fn apply(&self, cache: &mut QueryCache) -> CompensatingPatch {
        let touched = cache.update_entity(&self.entity_id, |entity| {
            set_membership(entity, self.joined)
        });
        CompensatingPatch {
            entity_id: self.entity_id.clone(),
            joined: !self.joined,
            keys: touched,
        }
    }
}

/// Inverse of an applied [`MembershipPatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensatingPatch {
    pub entity_id: String,
    pub joined: bool,
    pub keys: Vec<QueryKey>,
}

impl CompensatingPatch {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn apply(&self, cache: &mut QueryCache) -> Vec<QueryKey> {
        cache.update_entity_in(&self.keys, &self.entity_id, |entity| {
            set_membership(entity, self.joined)
        })
    }
}
