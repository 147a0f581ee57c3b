//! Client configuration: API base URL, socket URL derivation, refresh mode
//! and request timeout, read from the environment with validated defaults.

use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_SOCKET_PATH: &str = "/ws";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 20_000;

pub const ENV_API_BASE_URL: &str = "HUDDLE_API_BASE_URL";
pub const ENV_SOCKET_URL: &str = "HUDDLE_SOCKET_URL";
pub const ENV_REFRESH_MODE: &str = "HUDDLE_REFRESH_MODE";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "HUDDLE_REQUEST_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("base url must not be empty")]
    EmptyBaseUrl,
    #[error("base url must use http:// or https:// and include a host")]
    InvalidBaseUrl,
    #[error("socket url must use ws:// or wss:// and include a host, got: {0}")]
    InvalidSocketUrl(String),
    #[error("unknown refresh credential mode: {0}")]
    InvalidRefreshMode(String),
    #[error("request timeout must be a positive number of milliseconds, got: {0}")]
    InvalidTimeout(String),
}

/// How the refresh credential reaches `/auth/refresh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshCredentialMode {
    /// Refresh token is read from the credential store and sent in the body.
    #[default]
    Explicit,
    /// Refresh token travels as a cookie held by the HTTP transport.
    TransportCookie,
}

impl RefreshCredentialMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::TransportCookie => "transport_cookie",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "explicit" | "body" | "store" => Some(Self::Explicit),
            "transport_cookie" | "transport-cookie" | "cookie" => Some(Self::TransportCookie),
            _ => None,
        }
    }

    #[must_use]
    pub fn uses_cookie_jar(self) -> bool {
        matches!(self, Self::TransportCookie)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub socket_url: Option<String>,
    pub request_timeout: Duration,
    pub refresh_mode: RefreshCredentialMode,
}

impl ClientConfig {
    pub fn new(api_base_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            api_base_url: normalize_base_url(api_base_url)?,
            socket_url: None,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            refresh_mode: RefreshCredentialMode::default(),
        })
    }

    /// Build configuration from `HUDDLE_*` environment variables, falling
    /// back to the local default base URL.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url =
            env_non_empty(ENV_API_BASE_URL).unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        let mut config = Self::new(&base_url)?;

        if let Some(socket_url) = env_non_empty(ENV_SOCKET_URL) {
            config = config.with_socket_url(&socket_url)?;
        }
        if let Some(raw) = env_non_empty(ENV_REFRESH_MODE) {
            config.refresh_mode = RefreshCredentialMode::parse(&raw)
                .ok_or(ConfigError::InvalidRefreshMode(raw))?;
        }
        if let Some(raw) = env_non_empty(ENV_REQUEST_TIMEOUT_MS) {
            let millis = raw
                .parse::<u64>()
                .ok()
                .filter(|value| *value > 0)
                .ok_or(ConfigError::InvalidTimeout(raw))?;
            config.request_timeout = Duration::from_millis(millis);
        }
        Ok(config)
    }

    pub fn with_socket_url(mut self, raw: &str) -> Result<Self, ConfigError> {
        self.socket_url = Some(normalize_socket_url(raw)?);
        Ok(self)
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_refresh_mode(mut self, mode: RefreshCredentialMode) -> Self {
        self.refresh_mode = mode;
        self
    }

    /// Explicit socket URL if configured, otherwise derived from the API base URL.
    pub fn resolved_socket_url(&self) -> Result<String, ConfigError> {
        match &self.socket_url {
            Some(url) => Ok(url.clone()),
            None => derive_socket_url(&self.api_base_url, DEFAULT_SOCKET_PATH),
        }
    }
}

pub fn normalize_base_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyBaseUrl);
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ConfigError::InvalidBaseUrl);
    }
    let Some((_, remainder)) = trimmed.split_once("://") else {
        return Err(ConfigError::InvalidBaseUrl);
    };
    if remainder.trim().is_empty() || remainder.starts_with('/') {
        return Err(ConfigError::InvalidBaseUrl);
    }
    Ok(trimmed.to_string())
}

fn normalize_socket_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let parsed =
        url::Url::parse(trimmed).map_err(|_| ConfigError::InvalidSocketUrl(trimmed.to_string()))?;
    if !matches!(parsed.scheme(), "ws" | "wss") || parsed.host_str().is_none() {
        return Err(ConfigError::InvalidSocketUrl(trimmed.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Swap `http`/`https` for `ws`/`wss` and append `path`.
pub fn derive_socket_url(base_url: &str, path: &str) -> Result<String, ConfigError> {
    let base = normalize_base_url(base_url)?;
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    if let Some(rest) = base.strip_prefix("https://") {
        return Ok(format!("wss://{rest}{path}"));
    }
    if let Some(rest) = base.strip_prefix("http://") {
        return Ok(format!("ws://{rest}{path}"));
    }
    Err(ConfigError::InvalidBaseUrl)
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn with_env<T>(overrides: &[(&str, Option<&str>)], test: impl FnOnce() -> T) -> T {
        let lock = ENV_LOCK.get_or_init(|| Mutex::new(()));
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let previous = overrides
            .iter()
            .map(|(key, _)| (*key, std::env::var(key).ok()))
            .collect::<Vec<_>>();

        for (key, value) in overrides {
            if let Some(value) = value {
                unsafe { std::env::set_var(key, value) };
            } else {
                unsafe { std::env::remove_var(key) };
            }
        }

        let result = test();

        for (key, value) in previous {
            if let Some(value) = value {
                unsafe { std::env::set_var(key, value) };
            } else {
                unsafe { std::env::remove_var(key) };
            }
        }

        result
    }

    fn cleared() -> Vec<(&'static str, Option<&'static str>)> {
        vec![
            (ENV_API_BASE_URL, None),
            (ENV_SOCKET_URL, None),
            (ENV_REFRESH_MODE, None),
            (ENV_REQUEST_TIMEOUT_MS, None),
        ]
    }

    #[test]
    fn normalize_base_url_trims_and_drops_trailing_slash() {
        let normalized = normalize_base_url(" https://api.huddle.app/ ").expect("valid base url");
        assert_eq!(normalized, "https://api.huddle.app");
    }

    #[test]
    fn normalize_base_url_requires_http_scheme() {
        let error = normalize_base_url("api.huddle.app").expect_err("expected invalid url");
        assert_eq!(error, ConfigError::InvalidBaseUrl);
        let error = normalize_base_url("https:///path").expect_err("expected missing host");
        assert_eq!(error, ConfigError::InvalidBaseUrl);
        assert_eq!(normalize_base_url("  "), Err(ConfigError::EmptyBaseUrl));
    }

    #[test]
    fn socket_url_is_derived_by_scheme_substitution() {
        assert_eq!(
            derive_socket_url("https://api.huddle.app", DEFAULT_SOCKET_PATH),
            Ok("wss://api.huddle.app/ws".to_string())
        );
        assert_eq!(
            derive_socket_url("http://127.0.0.1:8080/v1/", "socket"),
            Ok("ws://127.0.0.1:8080/v1/socket".to_string())
        );
    }

    #[test]
    fn explicit_socket_url_overrides_derivation() {
        let config = ClientConfig::new("https://api.huddle.app")
            .and_then(|config| config.with_socket_url("wss://rt.huddle.app/live/"))
            .expect("valid config");
        assert_eq!(
            config.resolved_socket_url(),
            Ok("wss://rt.huddle.app/live".to_string())
        );

        let error = ClientConfig::new("https://api.huddle.app")
            .and_then(|config| config.with_socket_url("https://rt.huddle.app"))
            .expect_err("http scheme is not a socket url");
        assert!(matches!(error, ConfigError::InvalidSocketUrl(_)));
    }

    #[test]
    fn from_env_defaults_local() {
        with_env(&cleared(), || {
            let config = ClientConfig::from_env().expect("default config");
            assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
            assert_eq!(config.socket_url, None);
            assert_eq!(
                config.request_timeout,
                Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)
            );
            assert_eq!(config.refresh_mode, RefreshCredentialMode::Explicit);
        });
    }

    #[test]
    fn from_env_reads_overrides() {
        let mut overrides = cleared();
        overrides.extend([
            (ENV_API_BASE_URL, Some("https://staging.huddle.app/")),
            (ENV_SOCKET_URL, Some("wss://rt.staging.huddle.app/ws")),
            (ENV_REFRESH_MODE, Some("cookie")),
            (ENV_REQUEST_TIMEOUT_MS, Some("5000")),
        ]);
        with_env(&overrides, || {
            let config = ClientConfig::from_env().expect("env config");
            assert_eq!(config.api_base_url, "https://staging.huddle.app");
            assert_eq!(
                config.socket_url.as_deref(),
                Some("wss://rt.staging.huddle.app/ws")
            );
            assert_eq!(config.refresh_mode, RefreshCredentialMode::TransportCookie);
            assert_eq!(config.request_timeout, Duration::from_millis(5_000));
        });
    }

    #[test]
    fn from_env_rejects_bad_values() {
        let mut overrides = cleared();
        overrides.push((ENV_REQUEST_TIMEOUT_MS, Some("0")));
        with_env(&overrides, || {
            let error = ClientConfig::from_env().expect_err("zero timeout");
            assert_eq!(error, ConfigError::InvalidTimeout("0".to_string()));
        });

        let mut overrides = cleared();
        overrides.push((ENV_REFRESH_MODE, Some("magic")));
        with_env(&overrides, || {
            let error = ClientConfig::from_env().expect_err("unknown mode");
            assert_eq!(error, ConfigError::InvalidRefreshMode("magic".to_string()));
        });
    }
}
