//! Topic listener registry.
//!
//! Listener handles carry a monotonically increasing id so the same closure
//! can be registered twice and removed independently. A topic entry is
//! dropped as soon as its last listener leaves.

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

pub type TopicListener = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Default)]
pub struct TopicRegistry {
    next_id: u64,
    topics: HashMap<String, BTreeMap<ListenerId, TopicListener>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, topic: &str, listener: TopicListener) -> ListenerId {
        self.next_id = self.next_id.saturating_add(1);
        let id = ListenerId(self.next_id);
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(id, listener);
        id
    }

    /// Remove one listener. Returns false when the handle was already gone.
    pub fn remove(&mut self, topic: &str, id: ListenerId) -> bool {
        let Some(listeners) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = listeners.remove(&id).is_some();
        if listeners.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    /// Snapshot of a topic's listeners in registration order.
    pub fn listeners(&self, topic: &str) -> Vec<TopicListener> {
        self.topics
            .get(topic)
            .map(|listeners| listeners.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains_topic(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, BTreeMap::len)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

/// Invoke every listener with the payload. A panicking listener is logged
/// and skipped. Returns the number of listeners that panicked.
pub fn dispatch(listeners: &[TopicListener], topic: &str, payload: &Value) -> usize {
    let mut panicked = 0;
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| listener(payload))).is_err() {
            panicked += 1;
            warn!("listener for topic {} panicked; continuing dispatch", topic);
        }
    }
    panicked
}
