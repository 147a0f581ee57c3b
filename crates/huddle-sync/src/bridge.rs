//! Socket-to-cache bridge: entity topics fold straight into the cache.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use huddle_socket::{SocketClient, TopicSubscription, entity_topic};
use serde_json::Value;
use tracing::debug;

use crate::events::FoldOutcome;
use crate::reconciler::SyncReconciler;

pub struct RealtimeBridge {
    socket: SocketClient,
    reconciler: SyncReconciler,
    watches: Mutex<BTreeMap<String, TopicSubscription>>,
}

impl RealtimeBridge {
    pub fn new(socket: SocketClient, reconciler: SyncReconciler) -> Self {
        Self {
            socket,
            reconciler,
            watches: Mutex::new(BTreeMap::new()),
        }
    }

    /// Subscribe to `entity:{id}` and fold every event into the cache.
    /// Returns false if the entity is already watched.
    pub fn watch_entity(&self, entity_id: &str) -> bool {
        let mut watches = self.watches();
        if watches.contains_key(entity_id) {
            return false;
        }
        let topic = entity_topic(entity_id);
        let reconciler = self.reconciler.clone();
        let listener_topic = topic.clone();
        let subscription = self.socket.subscribe(&topic, move |payload: &Value| {
            match reconciler.apply_push_payload(&listener_topic, payload) {
                Ok(FoldOutcome::Applied(keys)) => {
                    debug!("{} updated {} cache entries", listener_topic, keys.len());
                }
                Ok(FoldOutcome::Unchanged | FoldOutcome::Dropped) => {}
                Err(error) => debug!("ignoring push event on {}: {}", listener_topic, error),
            }
        });
        watches.insert(entity_id.to_string(), subscription);
        true
    }

    pub fn unwatch_entity(&self, entity_id: &str) -> bool {
        self.watches()
            .remove(entity_id)
            .is_some_and(|subscription| subscription.unsubscribe())
    }

    pub fn watched(&self) -> Vec<String> {
        self.watches().keys().cloned().collect()
    }

    pub fn unwatch_all(&self) {
        let watches = std::mem::take(&mut *self.watches());
        for subscription in watches.values() {
            subscription.unsubscribe();
        }
    }

    fn watches(&self) -> MutexGuard<'_, BTreeMap<String, TopicSubscription>> {
        self.watches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
