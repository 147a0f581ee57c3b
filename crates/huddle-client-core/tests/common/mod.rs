use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use huddle_client_core::{
    ClientConfig, CredentialPair, HttpRequest, HttpResponse, HttpTransport, MemoryCredentialStore,
    RequestPipeline, SessionCredentials, TransportFailure,
};

pub type Responder =
    Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportFailure> + Send + Sync>;
pub type Delay = Box<dyn Fn(&HttpRequest) -> Duration + Send + Sync>;

/// Transport that answers from a closure and records every request.
pub struct ScriptedTransport {
    responder: Responder,
    requests: Mutex<Vec<HttpRequest>>,
    refresh_delay: Duration,
    delay: Option<Delay>,
}

impl ScriptedTransport {
    pub fn new(responder: Responder) -> Self {
        Self {
            responder,
            requests: Mutex::new(Vec::new()),
            refresh_delay: Duration::ZERO,
            delay: None,
        }
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    /// Hold each request for the duration `delay` picks before answering.
    pub fn with_delay(mut self, delay: Delay) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn refresh_calls(&self) -> usize {
        self.requests()
            .iter()
            .filter(|request| is_refresh(request))
            .count()
    }

    pub fn api_calls(&self) -> usize {
        self.requests()
            .iter()
            .filter(|request| !is_refresh(request))
            .count()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportFailure> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        if is_refresh(&request) && !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        if let Some(delay) = &self.delay {
            let delay = delay(&request);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        (self.responder)(&request)
    }
}

pub fn is_refresh(request: &HttpRequest) -> bool {
    request.url.ends_with("/auth/refresh")
}

pub fn bearer(request: &HttpRequest) -> Option<&str> {
    request
        .header("Authorization")
        .and_then(|value| value.strip_prefix("Bearer "))
}

pub struct Harness {
    pub transport: Arc<ScriptedTransport>,
    pub store: Arc<MemoryCredentialStore>,
    pub credentials: Arc<SessionCredentials>,
    pub pipeline: RequestPipeline,
}

pub async fn harness(
    config: ClientConfig,
    transport: ScriptedTransport,
    pair: Option<CredentialPair>,
) -> Harness {
    let transport = Arc::new(transport);
    let store = Arc::new(MemoryCredentialStore::new());
    let credentials = Arc::new(SessionCredentials::new(store.clone()));
    if let Some(pair) = pair {
        credentials.install(pair).await.expect("install credentials");
    }
    let pipeline = RequestPipeline::new(&config, transport.clone(), credentials.clone());
    Harness {
        transport,
        store,
        credentials,
        pipeline,
    }
}

pub fn config() -> ClientConfig {
    ClientConfig::new("https://api.huddle.test").expect("valid config")
}
