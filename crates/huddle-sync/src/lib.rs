//! Huddle sync: a shared query cache, optimistic membership mutations with
//! exact rollback, and folding of server-pushed events into that cache.

pub mod bridge;
pub mod cache;
pub mod context;
pub mod entity;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod patch;
pub mod reconciler;

pub use bridge::RealtimeBridge;
pub use cache::{CacheEntry, CacheHandle, CachedValue, QueryCache, QueryKey};
pub use context::{ClientContext, ContextParts};
pub use entity::{Entity, EntityPage, Participant};
pub use error::{Result, SyncError};
pub use events::{DomainEvent, FoldOutcome, fold_event};
pub use fetcher::{
    HttpQueryFetcher, Invalidation, Invalidator, MAX_REFETCH_ATTEMPTS, NoopQueryFetcher,
    QueryFetcher,
};
pub use patch::{CompensatingPatch, MembershipChange, MembershipPatch};
pub use reconciler::{
    HttpMembershipApi, MembershipApi, MutationOutcome, PendingMutation, SyncReconciler,
};
