//! Single-flight credential refresh.
//!
//! Concurrent callers of [`RefreshCoordinator::refresh`] share one flight: the
//! first caller installs a shared future, later callers await a clone of it,
//! and every waiter observes the same outcome. The slot is cleared by pointer
//! identity so a flight started after settlement is never clobbered.

use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::RefreshCredentialMode;
use crate::credentials::{CredentialPair, SessionCredentials};
use crate::routes::REFRESH_PATH;
use crate::transport::{HttpRequest, HttpTransport};

type RefreshFlight = Shared<BoxFuture<'static, Option<String>>>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<RefreshInner>,
}

struct RefreshInner {
    transport: Arc<dyn HttpTransport>,
    credentials: Arc<SessionCredentials>,
    endpoint: String,
    mode: RefreshCredentialMode,
    timeout: Duration,
    flight: Mutex<Option<RefreshFlight>>,
    flights_started: AtomicU64,
}

impl RefreshCoordinator {
    #[must_use]
    pub fn new(
        base_url: &str,
        transport: Arc<dyn HttpTransport>,
        credentials: Arc<SessionCredentials>,
        mode: RefreshCredentialMode,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RefreshInner {
                transport,
                credentials,
                endpoint: format!("{}{}", base_url.trim_end_matches('/'), REFRESH_PATH),
                mode,
                timeout,
                flight: Mutex::new(None),
                flights_started: AtomicU64::new(0),
            }),
        }
    }

    /// Refresh the access credential, joining an in-flight refresh if one
    /// exists. Returns `None` when the refresh failed and credentials were
    /// cleared.
    pub async fn refresh(&self) -> Option<String> {
        let flight = {
            let mut slot = self
                .inner
                .flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = slot.as_ref() {
                debug!("joining in-flight credential refresh");
                existing.clone()
            } else {
                let inner = Arc::clone(&self.inner);
                let flight = async move { inner.run().await }.boxed().shared();
                *slot = Some(flight.clone());
                self.inner.flights_started.fetch_add(1, Ordering::SeqCst);
                flight
            }
        };

        let outcome = flight.clone().await;

        let mut slot = self
            .inner
            .flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot
            .as_ref()
            .is_some_and(|current| current.ptr_eq(&flight))
        {
            *slot = None;
        }
        outcome
    }

    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.inner
            .flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Number of refresh flights started over the coordinator's lifetime.
    #[must_use]
    pub fn flights_started(&self) -> u64 {
        self.inner.flights_started.load(Ordering::SeqCst)
    }
}

impl RefreshInner {
    async fn run(&self) -> Option<String> {
        let stored_refresh_token = match self.mode {
            RefreshCredentialMode::Explicit => match self.credentials.stored_refresh_token().await
            {
                Ok(Some(token)) => Some(token),
                Ok(None) => {
                    info!("no refresh token stored; clearing session");
                    self.clear().await;
                    return None;
                }
                Err(error) => {
                    warn!("failed to read refresh token: {}", error);
                    self.clear().await;
                    return None;
                }
            },
            RefreshCredentialMode::TransportCookie => None,
        };

        let request = HttpRequest {
            method: Method::POST,
            url: self.endpoint.clone(),
            headers: vec![("Cache-Control".to_string(), "no-store".to_string())],
            body: stored_refresh_token
                .as_ref()
                .map(|token| json!({ "refreshToken": token })),
            timeout: self.timeout,
        };

        let response = match self.transport.execute(request).await {
            Ok(response) => response,
            Err(error) => {
                warn!("credential refresh failed: {}", error);
                self.clear().await;
                return None;
            }
        };
        if !response.is_success() {
            warn!("credential refresh rejected with status {}", response.status);
            self.clear().await;
            return None;
        }

        let refreshed = match serde_json::from_slice::<RefreshResponse>(&response.body) {
            Ok(refreshed) => refreshed,
            Err(error) => {
                warn!("credential refresh returned an unreadable body: {}", error);
                self.clear().await;
                return None;
            }
        };

        let access_token = refreshed.access_token;
        let refresh_token = match self.mode {
            RefreshCredentialMode::Explicit => refreshed.refresh_token.or(stored_refresh_token),
            RefreshCredentialMode::TransportCookie => refreshed.refresh_token,
        };
        if let Err(error) = self
            .credentials
            .install(CredentialPair::new(access_token.clone(), refresh_token))
            .await
        {
            warn!("refreshed credentials could not be persisted: {}", error);
        }
        info!("credential refresh succeeded");
        Some(access_token)
    }

    async fn clear(&self) {
        if let Err(error) = self.credentials.clear().await {
            warn!("failed to clear credentials: {}", error);
        }
    }
}
