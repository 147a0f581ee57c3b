#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use huddle_client_core::{
    ApiError, CancellationToken, HttpRequest, HttpResponse, HttpTransport, TransportFailure,
};
use huddle_sync::{
    CacheHandle, CachedValue, Entity, EntityPage, MembershipApi, MembershipChange, QueryFetcher,
    QueryKey,
};
use tokio::sync::{Notify, mpsc, oneshot};

/// Membership API whose calls resolve when the test sends an outcome.
pub struct ScriptedMembership {
    outcomes: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<(), ApiError>>>,
    calls: AtomicUsize,
}

impl ScriptedMembership {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<Result<(), ApiError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                outcomes: tokio::sync::Mutex::new(rx),
                calls: AtomicUsize::new(0),
            }),
            tx,
        )
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MembershipApi for ScriptedMembership {
    async fn set_membership(
        &self,
        _entity_id: &str,
        _change: MembershipChange,
        _cancel: Option<CancellationToken>,
    ) -> Result<(), ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut outcomes = self.outcomes.lock().await;
        outcomes
            .recv()
            .await
            .unwrap_or_else(|| Err(ApiError::cancelled()))
    }
}

/// Membership API whose calls resolve individually, in any order.
pub struct ManualMembership {
    calls: Mutex<Vec<Option<oneshot::Sender<Result<(), ApiError>>>>>,
}

impl ManualMembership {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Settle the call made `index`-th (zero based). Returns false if that
    /// call does not exist or was already settled.
    pub fn resolve(&self, index: usize, outcome: Result<(), ApiError>) -> bool {
        let sender = self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(index)
            .and_then(Option::take);
        sender.is_some_and(|sender| sender.send(outcome).is_ok())
    }
}

#[async_trait]
impl MembershipApi for ManualMembership {
    async fn set_membership(
        &self,
        _entity_id: &str,
        _change: MembershipChange,
        _cancel: Option<CancellationToken>,
    ) -> Result<(), ApiError> {
        let (tx, rx) = oneshot::channel();
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Some(tx));
        rx.await.unwrap_or_else(|_| Err(ApiError::cancelled()))
    }
}

/// Fetcher answering from a fixed table, optionally held until released.
pub struct StaticFetcher {
    values: Mutex<HashMap<QueryKey, CachedValue>>,
    gate: Option<Arc<Notify>>,
    fetches: AtomicUsize,
}

impl StaticFetcher {
    pub fn new(values: Vec<(QueryKey, CachedValue)>) -> Self {
        Self {
            values: Mutex::new(values.into_iter().collect()),
            gate: None,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryFetcher for StaticFetcher {
    async fn fetch(&self, key: &QueryKey, _pages: usize) -> huddle_sync::Result<Option<CachedValue>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }
}

pub type Route = Box<dyn Fn(&HttpRequest) -> Option<HttpResponse> + Send + Sync>;

/// HTTP transport answering from a route closure; unmatched requests get 404.
pub struct FakeBackend {
    route: Route,
    requests: Mutex<Vec<HttpRequest>>,
}

impl FakeBackend {
    pub fn new(route: Route) -> Self {
        Self {
            route,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|request| (request.method.to_string(), request.url.clone()))
            .collect()
    }
}

#[async_trait]
impl HttpTransport for FakeBackend {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportFailure> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        Ok((self.route)(&request).unwrap_or_else(|| {
            HttpResponse::json(404, &serde_json::json!({ "error": "NOT_FOUND" }))
        }))
    }
}

pub fn entity(count: u32, joined: bool) -> Entity {
    Entity::new("ent_1", count, Some(10)).joined(joined)
}

/// ent_1 at 3/10 in two list views and its detail entry, plus ent_2.
pub fn seeded_cache() -> CacheHandle {
    let cache = CacheHandle::new();
    cache.insert(
        QueryKey::all_entities(),
        CachedValue::List(vec![
            EntityPage::new(vec![entity(3, false)], Some("page-2".to_string())),
            EntityPage::new(vec![Entity::new("ent_2", 1, None)], None),
        ]),
    );
    cache.insert(
        QueryKey::entity_list([("city", "berlin")]),
        CachedValue::List(vec![EntityPage::new(vec![entity(3, false)], None)]),
    );
    cache.insert(
        QueryKey::entity_detail("ent_1"),
        CachedValue::Detail(entity(3, false)),
    );
    cache
}

/// `(participant_count, is_joined)` of ent_1 in every view that holds it.
pub fn occurrences(cache: &CacheHandle) -> Vec<(u32, bool)> {
    cache.read(|cache| {
        cache
            .keys()
            .filter_map(|key| match cache.value(key)? {
                CachedValue::Detail(entity) if entity.id == "ent_1" => {
                    Some(vec![(entity.participant_count, entity.is_joined)])
                }
                CachedValue::List(pages) => Some(
                    pages
                        .iter()
                        .flat_map(|page| page.items.iter())
                        .filter(|entity| entity.id == "ent_1")
                        .map(|entity| (entity.participant_count, entity.is_joined))
                        .collect(),
                ),
                _ => None,
            })
            .flatten()
            .collect()
    })
}
