//! Owned client context held by the application root.

use std::sync::Arc;

use huddle_client_core::{
    ApiError, ClientConfig, CredentialPair, CredentialStore, HttpTransport, ReqwestTransport,
    RequestPipeline, SessionCredentials,
};
use huddle_socket::{ChatChannel, SocketClient, SocketConfig, SocketConnector, TungsteniteConnector};
use tracing::info;

use crate::bridge::RealtimeBridge;
use crate::cache::CacheHandle;
use crate::error::Result;
use crate::fetcher::{HttpQueryFetcher, Invalidator, QueryFetcher};
use crate::reconciler::{HttpMembershipApi, MembershipApi, SyncReconciler};

/// Injected capabilities for [`ClientContext::with_parts`].
pub struct ContextParts {
    pub store: Arc<dyn CredentialStore>,
    pub transport: Arc<dyn HttpTransport>,
    pub connector: Arc<dyn SocketConnector>,
    pub socket: SocketConfig,
    /// Defaults to [`HttpQueryFetcher`] over the pipeline.
    pub fetcher: Option<Arc<dyn QueryFetcher>>,
    /// Defaults to [`HttpMembershipApi`] over the pipeline.
    pub membership: Option<Arc<dyn MembershipApi>>,
}

pub struct ClientContext {
    config: ClientConfig,
    credentials: Arc<SessionCredentials>,
    pipeline: RequestPipeline,
    socket: SocketClient,
    cache: CacheHandle,
    reconciler: SyncReconciler,
    bridge: RealtimeBridge,
}

impl ClientContext {
    /// Production wiring: reqwest for HTTP, tungstenite for the socket.
    pub fn new(config: ClientConfig, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let transport = ReqwestTransport::new(config.refresh_mode.uses_cookie_jar())
            .map_err(|failure| ApiError::transport(&failure))?;
        let socket = SocketConfig::new(&config.resolved_socket_url()?)?;
        Ok(Self::with_parts(
            config,
            ContextParts {
                store,
                transport: Arc::new(transport),
                connector: Arc::new(TungsteniteConnector),
                socket,
                fetcher: None,
                membership: None,
            },
        ))
    }

    pub fn with_parts(config: ClientConfig, parts: ContextParts) -> Self {
        let credentials = Arc::new(SessionCredentials::new(parts.store));
        let pipeline = RequestPipeline::new(&config, parts.transport, Arc::clone(&credentials));
        let socket = SocketClient::with_connector(parts.socket, parts.connector);
        let cache = CacheHandle::new();
        let fetcher: Arc<dyn QueryFetcher> = match parts.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpQueryFetcher::new(pipeline.clone())),
        };
        let membership: Arc<dyn MembershipApi> = match parts.membership {
            Some(membership) => membership,
            None => Arc::new(HttpMembershipApi::new(pipeline.clone())),
        };
        let invalidator = Invalidator::new(cache.clone(), fetcher);
        let reconciler = SyncReconciler::new(cache.clone(), membership, invalidator);
        let bridge = RealtimeBridge::new(socket.clone(), reconciler.clone());
        Self {
            config,
            credentials,
            pipeline,
            socket,
            cache,
            reconciler,
            bridge,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<SessionCredentials> {
        &self.credentials
    }

    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    pub fn socket(&self) -> &SocketClient {
        &self.socket
    }

    pub fn cache(&self) -> &CacheHandle {
        &self.cache
    }

    pub fn reconciler(&self) -> &SyncReconciler {
        &self.reconciler
    }

    pub fn bridge(&self) -> &RealtimeBridge {
        &self.bridge
    }

    pub fn chat(&self, entity_id: &str) -> ChatChannel {
        ChatChannel::new(self.socket.clone(), entity_id)
    }

    /// Install credentials obtained by the sign-in flow.
    pub async fn sign_in(&self, pair: CredentialPair) -> Result<()> {
        self.credentials.install(pair).await?;
        Ok(())
    }

    /// Drop watches and close the socket. Terminal for the socket client.
    pub fn shutdown(&self) {
        self.bridge.unwatch_all();
        self.socket.close();
        info!("client context shut down");
    }
}
