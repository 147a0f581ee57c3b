//! Huddle client core: configuration, credentials, and the HTTP request
//! pipeline with single-flight credential refresh.

pub mod config;
pub mod credentials;
pub mod error;
pub mod pipeline;
pub mod refresh;
pub mod routes;
pub mod transport;

pub use config::{ClientConfig, ConfigError, RefreshCredentialMode};
pub use credentials::{
    CredentialPair, CredentialStore, CredentialStoreError, MemoryCredentialStore,
    REFRESH_TOKEN_KEY, SessionCredentials,
};
pub use error::{ApiError, ApiErrorKind};
pub use pipeline::{ApiRequest, RateLimitPolicy, RequestPipeline};
pub use refresh::RefreshCoordinator;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportFailure};

pub use reqwest::Method;
pub use tokio_util::sync::CancellationToken;
