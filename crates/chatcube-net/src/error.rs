//! Error types for the transport core.
//!
//! Two layers are kept apart: [`NetworkError`] covers construction and
//! resolution problems surfaced to the embedding application, while
//! [`TransportError`] classifies why a single transfer attempt ended, which
//! is what the retry logic keys on.

use std::fmt;
use std::time::Duration;

/// Errors raised while configuring the service or resolving the backend host.
#[derive(Debug, Clone)]
pub enum NetworkError {
    /// The backend hostname could not be resolved.
    Resolution {
        /// The hostname that failed to resolve.
        host: String,
        /// The resolver's error message.
        message: String,
    },
    /// Invalid URL provided.
    InvalidUrl(String),
    /// TLS/SSL setup error.
    Tls(String),
    /// JSON serialization/deserialization error.
    Json(String),
    /// I/O error.
    Io(String),
    /// The HTTP client or runtime could not be built.
    Setup(String),
    /// Invalid configuration value.
    Config(String),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolution { host, message } => {
                write!(f, "Failed to resolve '{host}': {message}")
            }
            Self::InvalidUrl(msg) => write!(f, "Invalid URL: {msg}"),
            Self::Tls(msg) => write!(f, "TLS error: {msg}"),
            Self::Json(msg) => write!(f, "JSON error: {msg}"),
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
            Self::Setup(msg) => write!(f, "Transport setup error: {msg}"),
            Self::Config(msg) => write!(f, "Configuration error: {msg}"),
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<url::ParseError> for NetworkError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

impl From<serde_json::Error> for NetworkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        Self::Setup(err.to_string())
    }
}

/// Why a single transfer attempt ended without an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection could not be established or was lost.
    Connect(String),
    /// The overall transfer timeout elapsed.
    Timeout,
    /// Throughput stayed below the configured floor for a whole window.
    LowSpeed {
        /// Minimum acceptable bytes per second.
        bytes_per_sec: u64,
        /// Length of the measurement window.
        window: Duration,
    },
    /// Certificate or handshake failure.
    Tls(String),
    /// The exchange failed after connecting (bad framing, redirect loop, body error).
    Protocol(String),
    /// The caller raised the request's cancel flag.
    Cancelled,
    /// A local resource needed by the transfer was unavailable (upload file,
    /// client construction, malformed URL).
    Local(String),
}

impl TransportError {
    /// Whether the service should resubmit the request after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::Local(_))
    }

    /// Whether the error means the link to the backend is down.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Connect(_))
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(msg) => write!(f, "Connection error: {msg}"),
            Self::Timeout => write!(f, "Transfer timed out"),
            Self::LowSpeed {
                bytes_per_sec,
                window,
            } => write!(
                f,
                "Transfer slower than {bytes_per_sec} B/s for {}s",
                window.as_secs_f64()
            ),
            Self::Tls(msg) => write!(f, "TLS error: {msg}"),
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            Self::Cancelled => write!(f, "Transfer was cancelled"),
            Self::Local(msg) => write!(f, "Local error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if is_tls_failure(&err) {
            Self::Tls(err.to_string())
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else if err.is_redirect() {
            Self::Protocol("Too many redirects".to_string())
        } else if err.is_builder() {
            Self::Local(err.to_string())
        } else {
            Self::Protocol(err.to_string())
        }
    }
}

/// Whether a rustls error sits anywhere in `err`'s source chain.
///
/// Handshake failures reach reqwest wrapped in an `io::Error`, whose own
/// `source()` skips the payload, so the payload is checked explicitly.
fn is_tls_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if err.is::<rustls::Error>() {
            return true;
        }
        if let Some(io) = err.downcast_ref::<std::io::Error>()
            && io.get_ref().is_some_and(|inner| inner.is::<rustls::Error>())
        {
            return true;
        }
        current = err.source();
    }
    false
}

/// A specialized Result type for network operations.
pub type Result<T> = std::result::Result<T, NetworkError>;
