//! Optimistic join/leave with exact rollback, plus push-event folding into
//! the same cache.
//!
//! Per mutation: patch the cache synchronously, record the patch and its
//! inverse as a [`PendingMutation`], call the backend, then either schedule
//! invalidation (success) or replay the stored inverse (failure). The patch
//! always lands before the request is issued and the rollback always lands
//! before the error is returned.
//!
//! The latest patch on an entity wins locally. A failed mutation that has a
//! newer pending mutation on the same entity hands its inverse to that
//! mutation, which replays it only if it fails too. A failed mutation older
//! than a kept one (confirmed, or cancelled in flight) is not rolled back;
//! its dependents are invalidated instead.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use huddle_client_core::routes::{entity_join_path, entity_leave_path};
use huddle_client_core::{ApiError, ApiRequest, CancellationToken, RequestPipeline};
use huddle_socket::parse_entity_topic;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{CacheHandle, QueryKey};
use crate::error::{Result, SyncError};
use crate::events::{DomainEvent, FoldOutcome, fold_event};
use crate::fetcher::{Invalidation, Invalidator};
use crate::patch::{CompensatingPatch, MembershipChange, MembershipPatch};

/// Backend membership calls.
#[async_trait]
pub trait MembershipApi: Send + Sync {
    async fn set_membership(
        &self,
        entity_id: &str,
        change: MembershipChange,
        cancel: Option<CancellationToken>,
    ) -> std::result::Result<(), ApiError>;
}

#[derive(Clone)]
pub struct HttpMembershipApi {
    pipeline: RequestPipeline,
}

impl HttpMembershipApi {
    pub fn new(pipeline: RequestPipeline) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl MembershipApi for HttpMembershipApi {
    async fn set_membership(
        &self,
        entity_id: &str,
        change: MembershipChange,
        cancel: Option<CancellationToken>,
    ) -> std::result::Result<(), ApiError> {
        let path = match change {
            MembershipChange::Join => entity_join_path(entity_id),
            MembershipChange::Leave => entity_leave_path(entity_id),
        };
        let mut request = ApiRequest::post(path);
        if let Some(cancel) = cancel {
            request = request.with_cancel(cancel);
        }
        self.pipeline.send_empty(request).await
    }
}

/// A mutation whose network call has not settled yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutation {
    pub id: u64,
    pub change: MembershipChange,
    pub apply: MembershipPatch,
    pub inverse: CompensatingPatch,
    /// Inverses of older failed mutations on the same entity, keyed by
    /// mutation id. Replayed newest first after `inverse` if this mutation
    /// fails.
    pub deferred: BTreeMap<u64, CompensatingPatch>,
}

/// Result of a confirmed mutation.
#[derive(Debug)]
pub struct MutationOutcome {
    pub id: u64,
    pub change: MembershipChange,
    /// Cache entries the optimistic patch changed.
    pub patched: Vec<QueryKey>,
    pub invalidation: Invalidation,
}

#[derive(Clone)]
pub struct SyncReconciler {
    inner: Arc<ReconcilerInner>,
}

struct ReconcilerInner {
    cache: CacheHandle,
    api: Arc<dyn MembershipApi>,
    invalidator: Invalidator,
    ledger: Mutex<MutationLedger>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct MutationLedger {
    pending: BTreeMap<u64, PendingMutation>,
    /// Newest mutation per entity whose patch was kept.
    kept: BTreeMap<String, u64>,
}

enum Rollback {
    Replayed(usize),
    Deferred(u64),
    Superseded(u64),
}

impl MutationLedger {
    fn keep(&mut self, id: u64) {
        let Some(mutation) = self.pending.remove(&id) else {
            return;
        };
        let newest = self.kept.entry(mutation.apply.entity_id).or_insert(id);
        *newest = (*newest).max(id);
    }

    /// Settle a failed mutation and decide where its inverse goes.
    fn fail(&mut self, id: u64, cache: &CacheHandle) -> Option<Rollback> {
        let mutation = self.pending.remove(&id)?;
        let entity_id = mutation.apply.entity_id.as_str();
        if let Some(&kept) = self.kept.get(entity_id)
            && kept > id
        {
            return Some(Rollback::Superseded(kept));
        }
        if let Some(newer) = self
            .pending
            .range_mut((Bound::Excluded(id), Bound::Unbounded))
            .map(|(_, newer)| newer)
            .find(|newer| newer.apply.entity_id == entity_id)
        {
            newer.deferred.insert(id, mutation.inverse);
            newer.deferred.extend(mutation.deferred);
            return Some(Rollback::Deferred(newer.id));
        }
        let mut chain = vec![mutation.inverse];
        chain.extend(mutation.deferred.into_values().rev());
        cache.write(|cache| {
            for inverse in &chain {
                inverse.apply(cache);
            }
        });
        Some(Rollback::Replayed(chain.len()))
    }
}

impl SyncReconciler {
    pub fn new(cache: CacheHandle, api: Arc<dyn MembershipApi>, invalidator: Invalidator) -> Self {
        Self {
            inner: Arc::new(ReconcilerInner {
                cache,
                api,
                invalidator,
                ledger: Mutex::new(MutationLedger::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn cache(&self) -> &CacheHandle {
        &self.inner.cache
    }

    pub async fn join(&self, entity_id: &str) -> Result<MutationOutcome> {
        self.mutate(entity_id, MembershipChange::Join, None).await
    }

    pub async fn leave(&self, entity_id: &str) -> Result<MutationOutcome> {
        self.mutate(entity_id, MembershipChange::Leave, None).await
    }

    /// Cancelling before the patch returns `Cancelled` with the cache
    /// untouched. Cancelling after it leaves the patch in place and
    /// schedules invalidation so the refetch settles the entry.
    pub async fn mutate(
        &self,
        entity_id: &str,
        change: MembershipChange,
        cancel: Option<CancellationToken>,
    ) -> Result<MutationOutcome> {
        if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(SyncError::Api(ApiError::cancelled()));
        }

        let apply = MembershipPatch::new(entity_id, change);
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let patched = {
            let mut ledger = self.ledger();
            let inverse = self.inner.cache.write(|cache| apply.apply(cache));
            let patched = inverse.keys.clone();
            ledger.pending.insert(
                id,
                PendingMutation {
                    id,
                    change,
                    apply,
                    inverse,
                    deferred: BTreeMap::new(),
                },
            );
            patched
        };
        debug!(
            "optimistic {} on {} patched {} entries (mutation {})",
            change.as_str(),
            entity_id,
            patched.len(),
            id
        );

        let result = self
            .inner
            .api
            .set_membership(entity_id, change, cancel)
            .await;

        match result {
            Ok(()) => {
                self.ledger().keep(id);
                let invalidation = self.invalidate_entity(entity_id);
                Ok(MutationOutcome {
                    id,
                    change,
                    patched,
                    invalidation,
                })
            }
            Err(error) if error.is_cancelled() => {
                self.ledger().keep(id);
                info!(
                    "{} on {} cancelled after patch; reconciling by refetch",
                    change.as_str(),
                    entity_id
                );
                drop(self.invalidate_entity(entity_id));
                Err(SyncError::Api(error))
            }
            Err(error) => {
                self.roll_back(id, entity_id);
                warn!(
                    "{} on {} failed: {}",
                    change.as_str(),
                    entity_id,
                    error
                );
                Err(SyncError::Api(error))
            }
        }
    }

    /// Snapshot of unsettled mutations in start order.
    pub fn pending_mutations(&self) -> Vec<PendingMutation> {
        self.ledger().pending.values().cloned().collect()
    }

    pub fn apply_push_event(&self, event: &DomainEvent) -> FoldOutcome {
        self.inner.cache.write(|cache| fold_event(cache, event))
    }

    /// Decode a socket payload into a [`DomainEvent`] and fold it. A missing
    /// `entityId` is filled from an `entity:{id}` topic.
    pub fn apply_push_payload(&self, topic: &str, payload: &Value) -> Result<FoldOutcome> {
        let Value::Object(fields) = payload else {
            return Err(SyncError::InvalidEvent {
                topic: topic.to_string(),
            });
        };
        let mut fields = fields.clone();
        if !fields.contains_key("entityId")
            && let Some(entity_id) = parse_entity_topic(topic)
        {
            fields.insert("entityId".to_string(), Value::from(entity_id));
        }
        let event: DomainEvent = serde_json::from_value(Value::Object(fields))?;
        Ok(self.apply_push_event(&event))
    }

    fn invalidate_entity(&self, entity_id: &str) -> Invalidation {
        let keys = self
            .inner
            .cache
            .read(|cache| cache.dependent_keys(entity_id));
        self.inner.invalidator.invalidate(&keys)
    }

    fn roll_back(&self, id: u64, entity_id: &str) {
        let rollback = self.ledger().fail(id, &self.inner.cache);
        match rollback {
            Some(Rollback::Replayed(patches)) => {
                debug!(
                    "rolled back mutation {} on {} ({} inverse patches)",
                    id, entity_id, patches
                );
            }
            Some(Rollback::Deferred(newer)) => {
                debug!(
                    "rollback of mutation {} on {} deferred to pending mutation {}",
                    id, entity_id, newer
                );
            }
            Some(Rollback::Superseded(newer)) => {
                info!(
                    "mutation {} on {} superseded by mutation {}; refetching instead of rolling back",
                    id, entity_id, newer
                );
                drop(self.invalidate_entity(entity_id));
            }
            None => {}
        }
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, MutationLedger> {
        self.inner
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
