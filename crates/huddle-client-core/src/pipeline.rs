//! Request pipeline.
//!
//! Wraps each outbound call: attaches the access credential, recovers from
//! expired credentials with exactly one refresh-and-retry, backs off on rate
//! limiting, and normalizes every propagated failure into [`ApiError`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use reqwest::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::credentials::SessionCredentials;
use crate::error::ApiError;
use crate::refresh::RefreshCoordinator;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, TransportFailure};

pub const MAX_RATE_LIMIT_RETRIES: u32 = 3;
pub const RATE_LIMIT_BASE_DELAY_MS: u64 = 1_000;
pub const RATE_LIMIT_MAX_DELAY_MS: u64 = 8_000;
pub const RATE_LIMIT_JITTER_MS: u64 = 250;

const EXPIRY_SKEW_SECONDS: i64 = 30;

/// Backoff applied to 429 responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RATE_LIMIT_RETRIES,
            base_delay: Duration::from_millis(RATE_LIMIT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(RATE_LIMIT_MAX_DELAY_MS),
            jitter: Duration::from_millis(RATE_LIMIT_JITTER_MS),
        }
    }
}

impl RateLimitPolicy {
    /// `min(base * 2^attempt, max)`, before jitter. `attempt` counts from 0.
    #[must_use]
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let scaled = base_ms.saturating_mul(1_u64 << attempt.min(32));
        Duration::from_millis(scaled.min(max_ms))
    }

    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(0);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..jitter_ms)
        };
        self.base_delay_for(attempt) + Duration::from_millis(jitter)
    }

    /// Upper bound on the total time spent sleeping across every retry.
    #[must_use]
    pub fn max_total_delay(&self) -> Duration {
        (0..self.max_retries)
            .map(|attempt| self.base_delay_for(attempt) + self.jitter)
            .sum()
    }
}

/// A single logical call. Lives until terminal resolution.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub retry_count: u32,
    pub is_retry: bool,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl ApiRequest {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            retry_count: 0,
            is_retry: false,
            timeout: None,
            cancel: None,
        }
    }

    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

#[derive(Clone)]
pub struct RequestPipeline {
    base_url: String,
    transport: Arc<dyn HttpTransport>,
    credentials: Arc<SessionCredentials>,
    refresher: RefreshCoordinator,
    rate_limit: RateLimitPolicy,
    default_timeout: Duration,
}

impl RequestPipeline {
    #[must_use]
    pub fn new(
        config: &ClientConfig,
        transport: Arc<dyn HttpTransport>,
        credentials: Arc<SessionCredentials>,
    ) -> Self {
        let refresher = RefreshCoordinator::new(
            &config.api_base_url,
            Arc::clone(&transport),
            Arc::clone(&credentials),
            config.refresh_mode,
            config.request_timeout,
        );
        Self {
            base_url: config.api_base_url.clone(),
            transport,
            credentials,
            refresher,
            rate_limit: RateLimitPolicy::default(),
            default_timeout: config.request_timeout,
        }
    }

    #[must_use]
    pub fn with_rate_limit_policy(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = policy;
        self
    }

    #[must_use]
    pub fn credentials(&self) -> &Arc<SessionCredentials> {
        &self.credentials
    }

    #[must_use]
    pub fn refresher(&self) -> &RefreshCoordinator {
        &self.refresher
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.base_url, trimmed))
        }
    }

    pub async fn send(&self, mut request: ApiRequest) -> Result<HttpResponse, ApiError> {
        loop {
            if request.is_cancelled() {
                return Err(ApiError::cancelled());
            }
            self.refresh_if_expired(&request).await?;

            let sent_token = self.credentials.access_token();
            let http_request = self.build(&request, sent_token.as_deref())?;
            let response = self
                .cancellable(&request, self.transport.execute(http_request))
                .await?
                .map_err(|failure| {
                    debug!("{} {} failed: {}", request.method, request.path, failure);
                    ApiError::transport(&failure)
                })?;

            match response.status {
                status if (200..300).contains(&status) => return Ok(response),
                401 if !request.is_retry => {
                    let current = self.credentials.access_token();
                    if current.is_some() && current != sent_token {
                        debug!("credential rotated while {} was in flight", request.path);
                        request.is_retry = true;
                        continue;
                    }
                    // Dropping a cancelled waiter leaves the shared flight to
                    // the other waiters.
                    if self
                        .cancellable(&request, self.refresher.refresh())
                        .await?
                        .is_some()
                    {
                        request.is_retry = true;
                        continue;
                    }
                    info!("refresh failed; propagating auth failure for {}", request.path);
                    return Err(ApiError::from_response(response.status, &response.body));
                }
                401 => {
                    warn!("{} rejected after credential refresh", request.path);
                    if let Err(error) = self.credentials.clear().await {
                        warn!("failed to clear credentials: {}", error);
                    }
                    return Err(ApiError::from_response(response.status, &response.body));
                }
                429 if request.retry_count < self.rate_limit.max_retries => {
                    let delay = self.rate_limit.delay_for(request.retry_count);
                    warn!(
                        "{} rate limited; retry {} of {} in {:?}",
                        request.path,
                        request.retry_count + 1,
                        self.rate_limit.max_retries,
                        delay
                    );
                    self.cancellable(&request, tokio::time::sleep(delay)).await?;
                    request.retry_count += 1;
                }
                status => return Err(ApiError::from_response(status, &response.body)),
            }
        }
    }

    pub async fn get_json<T>(&self, request: ApiRequest) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let response = self.send(request).await?;
        decode_json(&response)
    }

    pub async fn post_json<Req, Res>(&self, path: &str, payload: &Req) -> Result<Res, ApiError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let body = serde_json::to_value(payload)
            .map_err(|error| ApiError::invalid_request(error.to_string()))?;
        let response = self.send(ApiRequest::post(path).with_body(body)).await?;
        decode_json(&response)
    }

    pub async fn delete_json<T>(&self, path: &str) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let response = self.send(ApiRequest::delete(path)).await?;
        decode_json(&response)
    }

    /// Send a request whose response body is irrelevant.
    pub async fn send_empty(&self, request: ApiRequest) -> Result<(), ApiError> {
        self.send(request).await.map(|_| ())
    }

    async fn refresh_if_expired(&self, request: &ApiRequest) -> Result<(), ApiError> {
        let expired = self.credentials.current().is_some_and(|pair| {
            pair.is_expired_at(Utc::now(), ChronoDuration::seconds(EXPIRY_SKEW_SECONDS))
        });
        if expired {
            debug!("access credential expired; refreshing before send");
            let _ = self.cancellable(request, self.refresher.refresh()).await?;
        }
        Ok(())
    }

    async fn cancellable<F>(&self, request: &ApiRequest, future: F) -> Result<F::Output, ApiError>
    where
        F: std::future::Future,
    {
        match &request.cancel {
            Some(cancel) => tokio::select! {
                () = cancel.cancelled() => Err(ApiError::cancelled()),
                output = future => Ok(output),
            },
            None => Ok(future.await),
        }
    }

    fn build(&self, request: &ApiRequest, access_token: Option<&str>) -> Result<HttpRequest, ApiError> {
        let endpoint = self
            .endpoint(&request.path)
            .ok_or_else(|| ApiError::invalid_request("request path must not be empty"))?;
        let mut url = Url::parse(&endpoint).map_err(|error| {
            ApiError::transport(&TransportFailure::Network(format!(
                "invalid url {endpoint}: {error}"
            )))
        })?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(
                request
                    .query
                    .iter()
                    .map(|(key, value)| (key.as_str(), value.as_str())),
            );
        }

        let mut headers = vec![
            ("Cache-Control".to_string(), "no-store".to_string()),
            (
                "x-request-id".to_string(),
                format!("req_{}", Uuid::new_v4().simple()),
            ),
        ];
        if let Some(token) = access_token {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }

        Ok(HttpRequest {
            method: request.method.clone(),
            url: url.to_string(),
            headers,
            body: request.body.clone(),
            timeout: request.timeout.unwrap_or(self.default_timeout),
        })
    }
}

fn decode_json<T>(response: &HttpResponse) -> Result<T, ApiError>
where
    T: DeserializeOwned,
{
    serde_json::from_slice::<T>(&response.body)
        .map_err(|error| ApiError::decode(response.status, error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_delay_doubles_and_caps() {
        let policy = RateLimitPolicy::default();
        assert_eq!(policy.base_delay_for(0), Duration::from_millis(1_000));
        assert_eq!(policy.base_delay_for(1), Duration::from_millis(2_000));
        assert_eq!(policy.base_delay_for(2), Duration::from_millis(4_000));
        assert_eq!(policy.base_delay_for(3), Duration::from_millis(8_000));
        assert_eq!(policy.base_delay_for(9), Duration::from_millis(8_000));
    }

    #[test]
    fn jittered_delay_stays_within_bound() {
        let policy = RateLimitPolicy::default();
        for attempt in 0..6 {
            for _ in 0..50 {
                let delay = policy.delay_for(attempt);
                let base = policy.base_delay_for(attempt);
                assert!(delay >= base);
                assert!(delay < base + policy.jitter);
            }
        }
        assert_eq!(policy.max_total_delay(), Duration::from_millis(7_750));
    }

    #[test]
    fn request_builder_collects_parts() {
        let cancel = CancellationToken::new();
        let request = ApiRequest::get("/entities")
            .with_query("city", "berlin")
            .with_timeout(Duration::from_secs(5))
            .with_cancel(cancel.clone());
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.query, vec![("city".to_string(), "berlin".to_string())]);
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
        assert!(!request.is_cancelled());
        cancel.cancel();
        assert!(request.is_cancelled());
    }
}
