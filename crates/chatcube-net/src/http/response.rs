//! Completed responses and terminal failures.

use std::borrow::Cow;
use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::error::{NetworkError, TransportError};

/// The response to a request that reached the server.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    url: String,
    body: Bytes,
    json: Option<serde_json::Value>,
}

impl Response {
    /// Assemble a response, parsing the body as JSON when there is one.
    ///
    /// A body that is not JSON leaves [`json`](Self::json) empty; the raw
    /// bytes are always kept.
    pub(crate) fn new(status: u16, url: String, body: Bytes) -> Self {
        let json = if status > 0 && !body.is_empty() {
            match serde_json::from_slice(&body) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::debug!(
                        target: "chatcube_net::request",
                        %url,
                        error = %e,
                        "response body is not JSON"
                    );
                    None
                }
            }
        } else {
            None
        };

        Self {
            status,
            url,
            body,
            json,
        }
    }

    /// HTTP status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Whether the status counts as success (101–399).
    pub fn is_success(&self) -> bool {
        self.status > 100 && self.status < 400
    }

    /// URL after redirects.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Raw body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Parsed JSON document, if the body was JSON.
    pub fn json(&self) -> Option<&serde_json::Value> {
        self.json.as_ref()
    }

    /// Deserialize the body into `T`.
    pub fn json_as<T: DeserializeOwned>(&self) -> Result<T, NetworkError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Why a request ended without success.
///
/// Exactly one of `on_success`/`on_fail` fires per request, so each request
/// sees at most one `Failure`.
#[derive(Debug, Clone)]
pub enum Failure {
    /// The server answered with a status outside 101–399.
    Status(Response),
    /// The `before_submit` hook refused the request.
    Vetoed,
    /// Every attempt the retry policy allowed failed at the transport level.
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// The error of the final attempt.
        last_error: TransportError,
    },
    /// A transport failure that is not worth retrying.
    Transport(TransportError),
    /// The service shut down while the request was outstanding.
    Shutdown,
}

impl Failure {
    /// The server's response, for status failures.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Status(response) => Some(response),
            _ => None,
        }
    }

    /// The HTTP status, for status failures.
    pub fn status(&self) -> Option<u16> {
        self.response().map(Response::status)
    }

    /// Whether the failure came from the transport rather than the server.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. } | Self::Transport(_))
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(response) => write!(f, "HTTP {} from {}", response.status, response.url),
            Self::Vetoed => write!(f, "Request vetoed before submission"),
            Self::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "Gave up after {attempts} attempts: {last_error}"),
            Self::Transport(error) => write!(f, "{error}"),
            Self::Shutdown => write!(f, "Service shut down"),
        }
    }
}

impl std::error::Error for Failure {}
