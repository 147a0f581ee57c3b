//! Query cache keyed by composite query keys.
//!
//! The same entity can live in several list pages and a detail entry at
//! once. Writers go through [`QueryCache::update_entity`] and friends so
//! every occurrence is patched together and page shape is preserved. Each
//! entry carries a revision that moves whenever its value changes; the
//! invalidator uses it to discard refetches that raced a newer write.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;

use crate::entity::{Entity, EntityPage, Participant};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryKey {
    EntityList { filters: BTreeMap<String, String> },
    EntityDetail { entity_id: String },
    Participants { entity_id: String },
}

impl QueryKey {
    pub fn entity_list<I, K, V>(filters: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::EntityList {
            filters: filters
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    pub fn all_entities() -> Self {
        Self::EntityList {
            filters: BTreeMap::new(),
        }
    }

    pub fn entity_detail(entity_id: impl Into<String>) -> Self {
        Self::EntityDetail {
            entity_id: entity_id.into(),
        }
    }

    pub fn participants(entity_id: impl Into<String>) -> Self {
        Self::Participants {
            entity_id: entity_id.into(),
        }
    }

    pub fn scope(&self) -> &'static str {
        match self {
            Self::EntityList { .. } => "entities",
            Self::EntityDetail { .. } => "entity",
            Self::Participants { .. } => "participants",
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Self::EntityList { .. })
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EntityList { filters } => {
                write!(f, "{}", self.scope())?;
                for (key, value) in filters {
                    write!(f, ":{key}={value}")?;
                }
                Ok(())
            }
            Self::EntityDetail { entity_id } | Self::Participants { entity_id } => {
                write!(f, "{}:{entity_id}", self.scope())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    List(Vec<EntityPage>),
    Detail(Entity),
    Participants(Vec<Participant>),
}

impl CachedValue {
    /// Number of pages held, used as a refetch depth hint.
    pub fn page_count(&self) -> usize {
        match self {
            Self::List(pages) => pages.len(),
            Self::Detail(_) | Self::Participants(_) => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: CachedValue,
    pub stale: bool,
    pub revision: u64,
}

#[derive(Debug, Default)]
pub struct QueryCache {
    entries: BTreeMap<QueryKey, CacheEntry>,
    revision: u64,
    changed: Vec<QueryKey>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fresh value for `key`.
    pub fn insert(&mut self, key: QueryKey, value: CachedValue) {
        let revision = self.bump();
        self.changed.push(key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                value,
                stale: false,
                revision,
            },
        );
    }

    pub fn remove(&mut self, key: &QueryKey) -> Option<CacheEntry> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.changed.push(key.clone());
        }
        removed
    }

    pub fn entry(&self, key: &QueryKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn value(&self, key: &QueryKey) -> Option<&CachedValue> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn revision_of(&self, key: &QueryKey) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.revision)
    }

    pub fn keys(&self) -> impl Iterator<Item = &QueryKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// An occurrence of the entity, preferring the detail entry.
    pub fn entity(&self, entity_id: &str) -> Option<&Entity> {
        if let Some(CachedValue::Detail(entity)) =
            self.value(&QueryKey::entity_detail(entity_id))
        {
            return Some(entity);
        }
        self.entries.values().find_map(|entry| match &entry.value {
            CachedValue::List(pages) => pages
                .iter()
                .flat_map(|page| page.items.iter())
                .find(|entity| entity.id == entity_id),
            _ => None,
        })
    }

    pub fn contains_entity(&self, entity_id: &str) -> bool {
        self.entity(entity_id).is_some()
    }

    pub fn participants(&self, entity_id: &str) -> Option<&[Participant]> {
        match self.value(&QueryKey::participants(entity_id)) {
            Some(CachedValue::Participants(participants)) => Some(participants),
            _ => None,
        }
    }

    /// Apply `patch` to every cached occurrence of the entity. `patch`
    /// returns whether it changed the record. Returns the keys whose value
    /// changed.
    pub fn update_entity<F>(&mut self, entity_id: &str, patch: F) -> Vec<QueryKey>
    where
        F: FnMut(&mut Entity) -> bool,
    {
        let keys = self.entries.keys().cloned().collect::<Vec<_>>();
        self.update_entity_in(&keys, entity_id, patch)
    }

    /// Like [`QueryCache::update_entity`] but restricted to `keys`.
    pub fn update_entity_in<F>(&mut self, keys: &[QueryKey], entity_id: &str, mut patch: F) -> Vec<QueryKey>
    where
        F: FnMut(&mut Entity) -> bool,
    {
        let mut touched = Vec::new();
        for key in keys {
            let Some(entry) = self.entries.get_mut(key) else {
                continue;
            };
            let changed = match &mut entry.value {
                CachedValue::Detail(entity) if entity.id == entity_id => patch(entity),
                CachedValue::List(pages) => {
                    let mut changed = false;
                    for entity in pages
                        .iter_mut()
                        .flat_map(|page| page.items.iter_mut())
                        .filter(|entity| entity.id == entity_id)
                    {
                        changed |= patch(entity);
                    }
                    changed
                }
                _ => false,
            };
            if changed {
                touched.push(key.clone());
            }
        }
        for key in &touched {
            let revision = self.bump();
            if let Some(entry) = self.entries.get_mut(key) {
                entry.revision = revision;
            }
        }
        self.changed.extend(touched.iter().cloned());
        touched
    }

    /// Patch the cached participants list of an entity, if present.
    pub fn update_participants<F>(&mut self, entity_id: &str, patch: F) -> bool
    where
        F: FnOnce(&mut Vec<Participant>) -> bool,
    {
        let key = QueryKey::participants(entity_id);
        let changed = match self.entries.get_mut(&key) {
            Some(CacheEntry {
                value: CachedValue::Participants(participants),
                ..
            }) => patch(participants),
            _ => false,
        };
        if changed {
            let revision = self.bump();
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.revision = revision;
            }
            self.changed.push(key);
        }
        changed
    }

    /// Mark keys stale. Returns `(key, revision, page_count)` for each key
    /// that exists.
    pub fn mark_stale(&mut self, keys: &[QueryKey]) -> Vec<(QueryKey, u64, usize)> {
        keys.iter()
            .filter_map(|key| {
                let entry = self.entries.get_mut(key)?;
                entry.stale = true;
                Some((key.clone(), entry.revision, entry.value.page_count()))
            })
            .collect()
    }

    /// Every list key plus the detail and participants keys of the entity,
    /// restricted to keys currently cached.
    pub fn dependent_keys(&self, entity_id: &str) -> Vec<QueryKey> {
        let detail = QueryKey::entity_detail(entity_id);
        let participants = QueryKey::participants(entity_id);
        self.entries
            .keys()
            .filter(|key| key.is_list() || **key == detail || **key == participants)
            .cloned()
            .collect()
    }

    fn bump(&mut self) -> u64 {
        self.revision = self.revision.saturating_add(1);
        self.revision
    }

    fn take_changed(&mut self) -> Vec<QueryKey> {
        std::mem::take(&mut self.changed)
    }
}

/// Shared handle to a [`QueryCache`] that broadcasts changed keys after
/// every write.
#[derive(Clone)]
pub struct CacheHandle {
    cache: Arc<Mutex<QueryCache>>,
    changes: broadcast::Sender<QueryKey>,
}

impl Default for CacheHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheHandle {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            cache: Arc::new(Mutex::new(QueryCache::new())),
            changes,
        }
    }

    pub fn read<R>(&self, read: impl FnOnce(&QueryCache) -> R) -> R {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        read(&cache)
    }

    pub fn write<R>(&self, write: impl FnOnce(&mut QueryCache) -> R) -> R {
        let (result, changed) = {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            let result = write(&mut cache);
            (result, cache.take_changed())
        };
        for key in changed {
            // No receivers is fine.
            let _ = self.changes.send(key);
        }
        result
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueryKey> {
        self.changes.subscribe()
    }

    pub fn insert(&self, key: QueryKey, value: CachedValue) {
        self.write(|cache| cache.insert(key, value));
    }

    pub fn entity(&self, entity_id: &str) -> Option<Entity> {
        self.read(|cache| cache.entity(entity_id).cloned())
    }

    pub fn value(&self, key: &QueryKey) -> Option<CachedValue> {
        self.read(|cache| cache.value(key).cloned())
    }

    pub fn entry(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.read(|cache| cache.entry(key).cloned())
    }
}
