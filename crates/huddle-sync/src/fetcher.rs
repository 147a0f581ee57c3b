//! Background refetch of invalidated cache entries.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use huddle_client_core::routes::{ENTITIES_PATH, entity_participants_path, entity_path};
use huddle_client_core::{ApiRequest, RequestPipeline};
use serde::Deserialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{CacheHandle, CachedValue, QueryKey};
use crate::entity::{Entity, EntityPage, Participant};
use crate::error::Result;

/// Fetches per invalidated key, including retries after racing writes.
pub const MAX_REFETCH_ATTEMPTS: u32 = 3;

/// Loads the authoritative value for a query key. `Ok(None)` means there is
/// nothing to load and the entry stays as it is.
#[async_trait]
pub trait QueryFetcher: Send + Sync {
    async fn fetch(&self, key: &QueryKey, pages: usize) -> Result<Option<CachedValue>>;
}

/// Fetcher for contexts without a backend: invalidation only marks entries
/// stale.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopQueryFetcher;

#[async_trait]
impl QueryFetcher for NoopQueryFetcher {
    async fn fetch(&self, _key: &QueryKey, _pages: usize) -> Result<Option<CachedValue>> {
        Ok(None)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ParticipantsBody {
    List(Vec<Participant>),
    Page { items: Vec<Participant> },
}

#[derive(Clone)]
pub struct HttpQueryFetcher {
    pipeline: RequestPipeline,
}

impl HttpQueryFetcher {
    pub fn new(pipeline: RequestPipeline) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl QueryFetcher for HttpQueryFetcher {
    async fn fetch(&self, key: &QueryKey, pages: usize) -> Result<Option<CachedValue>> {
        let value = match key {
            QueryKey::EntityList { filters } => {
                let mut fetched: Vec<EntityPage> = Vec::new();
                let mut cursor: Option<String> = None;
                while fetched.len() < pages.max(1) {
                    let mut request = ApiRequest::get(ENTITIES_PATH);
                    for (name, value) in filters {
                        request = request.with_query(name.as_str(), value.as_str());
                    }
                    if let Some(cursor) = cursor.take() {
                        request = request.with_query("cursor", cursor);
                    }
                    let page: EntityPage = self.pipeline.get_json(request).await?;
                    cursor.clone_from(&page.next_cursor);
                    fetched.push(page);
                    if cursor.is_none() {
                        break;
                    }
                }
                CachedValue::List(fetched)
            }
            QueryKey::EntityDetail { entity_id } => {
                let entity: Entity = self
                    .pipeline
                    .get_json(ApiRequest::get(entity_path(entity_id)))
                    .await?;
                CachedValue::Detail(entity)
            }
            QueryKey::Participants { entity_id } => {
                let body: ParticipantsBody = self
                    .pipeline
                    .get_json(ApiRequest::get(entity_participants_path(entity_id)))
                    .await?;
                CachedValue::Participants(match body {
                    ParticipantsBody::List(items) | ParticipantsBody::Page { items } => items,
                })
            }
        };
        Ok(Some(value))
    }
}

/// Refetch tasks spawned by one invalidation.
#[derive(Debug)]
pub struct Invalidation {
    pub keys: Vec<QueryKey>,
    tasks: Vec<JoinHandle<()>>,
}

impl Invalidation {
    fn empty() -> Self {
        Self {
            keys: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Wait for every refetch to finish.
    pub async fn settled(self) {
        for outcome in join_all(self.tasks).await {
            if let Err(error) = outcome {
                warn!("refetch task failed: {}", error);
            }
        }
    }
}

#[derive(Clone)]
pub struct Invalidator {
    cache: CacheHandle,
    fetcher: Arc<dyn QueryFetcher>,
}

impl Invalidator {
    pub fn new(cache: CacheHandle, fetcher: Arc<dyn QueryFetcher>) -> Self {
        Self { cache, fetcher }
    }

    /// Mark the cached subset of `keys` stale and refetch each in the
    /// background. Keys that are not cached are ignored.
    pub fn invalidate(&self, keys: &[QueryKey]) -> Invalidation {
        let marked = self.cache.write(|cache| cache.mark_stale(keys));
        if marked.is_empty() {
            return Invalidation::empty();
        }
        let Ok(handle) = Handle::try_current() else {
            debug!("no runtime; {} entries left stale", marked.len());
            return Invalidation {
                keys: marked.into_iter().map(|(key, _, _)| key).collect(),
                tasks: Vec::new(),
            };
        };

        let mut invalidation = Invalidation::empty();
        for (key, revision, pages) in marked {
            let this = self.clone();
            let task_key = key.clone();
            invalidation
                .tasks
                .push(handle.spawn(async move { this.refetch(task_key, revision, pages).await }));
            invalidation.keys.push(key);
        }
        invalidation
    }

    /// Fetch `key` and store the result if the entry still has `revision`.
    /// When a newer write landed during the fetch the entry is re-marked and
    /// fetched again with the new revision, up to [`MAX_REFETCH_ATTEMPTS`]
    /// times in total.
    pub async fn refetch(&self, key: QueryKey, mut revision: u64, mut pages: usize) {
        for attempt in 1..=MAX_REFETCH_ATTEMPTS {
            let value = match self.fetcher.fetch(&key, pages).await {
                Ok(Some(value)) => value,
                Ok(None) => return,
                Err(error) => {
                    warn!("refetch of {} failed: {}", key, error);
                    return;
                }
            };
            let outcome = self.cache.write(|cache| match cache.revision_of(&key) {
                Some(current) if current == revision => {
                    cache.insert(key.clone(), value);
                    RefetchOutcome::Stored
                }
                Some(_) => cache
                    .mark_stale(std::slice::from_ref(&key))
                    .pop()
                    .map_or(RefetchOutcome::Evicted, |(_, current, page_count)| {
                        RefetchOutcome::Raced(current, page_count)
                    }),
                None => RefetchOutcome::Evicted,
            });
            match outcome {
                RefetchOutcome::Stored => {
                    debug!("refetched {}", key);
                    return;
                }
                RefetchOutcome::Evicted => {
                    debug!("discarding refetch of {}: entry removed", key);
                    return;
                }
                RefetchOutcome::Raced(current, page_count) => {
                    debug!(
                        "refetch of {} raced a newer write (attempt {}/{})",
                        key, attempt, MAX_REFETCH_ATTEMPTS
                    );
                    revision = current;
                    pages = page_count;
                }
            }
        }
        warn!(
            "giving up on refetch of {} after {} attempts; entry left stale",
            key, MAX_REFETCH_ATTEMPTS
        );
    }
}

enum RefetchOutcome {
    Stored,
    Evicted,
    Raced(u64, usize),
}
