//! Credential storage.
//!
//! The access token lives only in process memory. The refresh token is
//! persisted through an external [`CredentialStore`], an opaque async
//! key-value store supplied by the host platform.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use thiserror::Error;

pub const REFRESH_TOKEN_KEY: &str = "huddle.refresh_token";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialStoreError {
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
    #[error("credential store rejected key {key}: {reason}")]
    Rejected { key: String, reason: String },
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CredentialStoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), CredentialStoreError>;
    async fn delete(&self, key: &str) -> Result<(), CredentialStoreError>;
}

/// Process-local store for tests and platforms without secure storage.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_refresh_token(refresh_token: &str) -> Self {
        let store = Self::default();
        store
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(REFRESH_TOKEN_KEY.to_string(), refresh_token.to_string());
        store
    }

    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CredentialStoreError> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CredentialStoreError> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CredentialStoreError> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CredentialPair {
    /// Expiry is read from the access token's `exp` claim when it is a JWT.
    #[must_use]
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        let access_token = access_token.into();
        let expires_at = decode_jwt_expiry(&access_token);
        Self {
            access_token,
            refresh_token,
            expires_at,
        }
    }

    #[must_use]
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>, skew: ChronoDuration) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at <= now + skew)
    }
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[must_use]
pub fn decode_jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut segments = token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&decoded).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    DateTime::from_timestamp(exp, 0)
}

/// Process-wide session credentials: in-memory access pair plus the
/// externally persisted refresh token.
pub struct SessionCredentials {
    current: RwLock<Option<CredentialPair>>,
    store: Arc<dyn CredentialStore>,
}

impl SessionCredentials {
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            current: RwLock::new(None),
            store,
        }
    }

    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|pair| pair.access_token.clone())
    }

    #[must_use]
    pub fn current(&self) -> Option<CredentialPair> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install a new pair. The refresh token, when present, is persisted
    /// before the access token becomes visible.
    pub async fn install(&self, pair: CredentialPair) -> Result<(), CredentialStoreError> {
        let persisted = match &pair.refresh_token {
            Some(refresh_token) => self.store.set(REFRESH_TOKEN_KEY, refresh_token).await,
            None => Ok(()),
        };
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(pair);
        persisted
    }

    pub async fn stored_refresh_token(&self) -> Result<Option<String>, CredentialStoreError> {
        self.store.get(REFRESH_TOKEN_KEY).await
    }

    /// Drop the in-memory pair and delete the persisted refresh token.
    pub async fn clear(&self) -> Result<(), CredentialStoreError> {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.store.delete(REFRESH_TOKEN_KEY).await
    }
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}
