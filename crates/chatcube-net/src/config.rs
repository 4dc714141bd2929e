//! Service configuration.
//!
//! [`ServiceConfig`] can be built in code with chained `with_*` setters or
//! loaded from a TOML file:
//!
//! ```toml
//! base_url = "https://chat.example.org"
//! locale = "de"
//! ca_bundle = "/etc/chatcube/ca-bundle.pem"
//!
//! [retry]
//! max_attempts = 8
//! initial_delay_ms = 500
//!
//! [stream_reconnect]
//! initial_delay_ms = 0
//! ```
//!
//! Missing keys fall back to the defaults.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::dns::DnsConfig;
use crate::error::NetworkError;
use crate::http::RetryPolicy;

/// Backend used when no base URL is configured.
pub const DEFAULT_BASE_URL: &str = "https://test.chatcube.org/";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML document is malformed.
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field holds an unusable value.
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: &'static str, message: String },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            message: message.into(),
        }
    }
}

impl From<ConfigError> for NetworkError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Settings for [`HttpService`](crate::http::HttpService).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Backend root, always ending in `/`.
    pub base_url: String,
    /// Locale segment inserted between the base URL and `/api`.
    pub locale: String,
    /// Value of the `User-Agent` header.
    pub user_agent: String,
    /// Token sent as `Authorization: Token <token>`.
    pub auth_token: Option<String>,
    /// Headers attached to every request unless the request sets them itself.
    pub default_headers: BTreeMap<String, String>,
    /// PEM bundle of CA certificates to trust.
    pub ca_bundle: Option<PathBuf>,
    /// Verify the server certificate chain.
    pub verify_peer: bool,
    /// Connection establishment timeout.
    pub connect_timeout_secs: u64,
    /// Overall timeout for requests that do not set their own. Zero disables it.
    pub request_timeout_secs: u64,
    /// Redirect hops followed before giving up.
    pub max_redirects: usize,
    /// Silence after which the event stream is considered dead.
    pub stream_inactivity_secs: u64,
    /// Backend hostname resolution.
    pub dns: DnsConfig,
    /// Resubmission policy for requests.
    pub retry: RetryPolicy,
    /// Reconnect policy for the event stream.
    pub stream_reconnect: RetryPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            locale: "en".to_string(),
            user_agent: format!("ChatCube/{}", env!("CARGO_PKG_VERSION")),
            auth_token: None,
            default_headers: BTreeMap::new(),
            ca_bundle: None,
            verify_peer: true,
            connect_timeout_secs: 5,
            request_timeout_secs: 60,
            max_redirects: 5,
            stream_inactivity_secs: 30,
            dns: DnsConfig::default(),
            retry: RetryPolicy::default(),
            stream_reconnect: RetryPolicy::immediate(),
        }
    }
}

impl ServiceConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validated()
    }

    /// Read, parse, and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Check every field and normalize the base URL.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        self.base_url = normalize_base_url(&self.base_url)?;

        if self.locale.is_empty() || self.locale.contains('/') {
            return Err(ConfigError::invalid(
                "locale",
                format!("'{}' is not a path segment", self.locale),
            ));
        }
        if self.stream_inactivity_secs == 0 {
            return Err(ConfigError::invalid("stream_inactivity_secs", "must be positive"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid("retry.backoff_multiplier", "must be at least 1.0"));
        }
        if self.stream_reconnect.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "stream_reconnect.backoff_multiplier",
                "must be at least 1.0",
            ));
        }
        Ok(self)
    }

    /// Set the backend base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the locale segment.
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    /// Set the user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set the auth token.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Add a default header.
    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// Trust the CA certificates in a PEM bundle.
    pub fn with_ca_bundle(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_bundle = Some(path.into());
        self
    }

    /// Enable or disable certificate verification.
    pub fn with_verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    /// Set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Set the default overall request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the redirect limit.
    pub fn with_max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    /// Set the event stream inactivity window.
    pub fn with_stream_inactivity(mut self, window: Duration) -> Self {
        self.stream_inactivity_secs = window.as_secs().max(1);
        self
    }

    /// Use custom DNS servers.
    pub fn with_nameservers(mut self, nameservers: Vec<SocketAddr>) -> Self {
        self.dns.nameservers = nameservers;
        self
    }

    /// Set the request retry policy.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Set the event stream reconnect policy.
    pub fn with_stream_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.stream_reconnect = policy;
        self
    }

    /// Connection establishment timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Overall timeout for requests without their own, if any.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    /// Event stream inactivity window.
    pub fn stream_inactivity(&self) -> Duration {
        Duration::from_secs(self.stream_inactivity_secs)
    }

    /// Hostname of the backend.
    pub fn backend_host(&self) -> Result<String, ConfigError> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| ConfigError::invalid("base_url", e.to_string()))?;
        url.host_str()
            .map(|host| host.trim_start_matches('[').trim_end_matches(']').to_string())
            .ok_or_else(|| ConfigError::invalid("base_url", "missing host"))
    }
}

/// Check that `raw` is an absolute http(s) URL with a host and make it end
/// in `/`.
pub fn normalize_base_url(raw: &str) -> Result<String, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::invalid("base_url", e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::invalid(
            "base_url",
            format!("unsupported scheme '{}'", url.scheme()),
        ));
    }
    if url.host_str().is_none() {
        return Err(ConfigError::invalid("base_url", "missing host"));
    }

    let mut normalized = url.to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Ok(normalized)
}

/// Serde adapter storing a [`Duration`] as whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
