//! One HTTP exchange and its callbacks.
//!
//! A [`Request`] is built by the caller, handed to
//! [`HttpService::submit`](super::HttpService::submit), and from then on owned
//! by the service. It is destroyed after its final callback; exactly one of
//! `on_success`/`on_fail` fires, always followed by `on_finally`.
//!
//! ```ignore
//! use chatcube_net::http::Request;
//!
//! let request = Request::post("/messages")
//!     .field("channel", "42")
//!     .field("text", "hello")
//!     .hourglass(true)
//!     .on_success(|response| println!("sent: {}", response.status()))
//!     .on_fail(|failure| eprintln!("not sent: {failure}"));
//! service.submit(request);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::NetworkError;
use crate::transport::{
    CancelFlag, FormPart, LowSpeedLimit, PinnedHost, TransferBody, TransferProgress, TransferSpec,
};

use super::response::{Failure, Response};

/// HTTP request methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// HTTP GET method.
    Get,
    /// HTTP POST method.
    Post,
    /// HTTP PUT method.
    Put,
    /// HTTP DELETE method.
    Delete,
    /// HTTP PATCH method.
    Patch,
    /// HTTP HEAD method.
    Head,
    /// HTTP OPTIONS method.
    Options,
}

impl HttpMethod {
    /// Convert to reqwest method.
    pub(crate) fn to_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Delete => reqwest::Method::DELETE,
            Self::Patch => reqwest::Method::PATCH,
            Self::Head => reqwest::Method::HEAD,
            Self::Options => reqwest::Method::OPTIONS,
        }
    }

    /// The method token as sent on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "PATCH" => Ok(Self::Patch),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            other => Err(NetworkError::Config(format!("unknown HTTP method '{other}'"))),
        }
    }
}

/// A local file to upload as a multipart field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    path: PathBuf,
    remote_name: Option<String>,
    extension: Option<String>,
}

impl UploadFile {
    /// Upload the file at `path` under its own file name.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            remote_name: None,
            extension: None,
        }
    }

    /// Announce the file to the server under `name`.
    pub fn remote_name(mut self, name: impl Into<String>) -> Self {
        self.remote_name = Some(name.into());
        self
    }

    /// Make sure the announced name ends in `.ext`.
    pub fn extension(mut self, ext: impl Into<String>) -> Self {
        self.extension = Some(ext.into());
        self
    }

    /// Local path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The filename announced to the server.
    pub fn file_name(&self) -> String {
        let base = match &self.remote_name {
            Some(name) => name.clone(),
            None => self
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string()),
        };
        match &self.extension {
            Some(ext) => append_extension(&base, ext),
            None => base,
        }
    }
}

/// Append `.ext` to `name` unless it already ends with it (ignoring case).
pub fn append_extension(name: &str, ext: &str) -> String {
    let ext = ext.trim_start_matches('.');
    if ext.is_empty() {
        return name.to_string();
    }
    let suffix = format!(".{}", ext.to_ascii_lowercase());
    if name.to_ascii_lowercase().ends_with(&suffix) {
        name.to_string()
    } else {
        format!("{name}.{ext}")
    }
}

/// Expand a request target into an absolute URL.
///
/// Absolute `http://`/`https://` targets pass through; anything else is taken
/// relative to the API root, `<base_url><locale>/api`.
pub fn expand_url(base_url: &str, locale: &str, target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        return target.to_string();
    }
    let separator = if target.starts_with('/') { "" } else { "/" };
    format!("{base_url}{locale}/api{separator}{target}")
}

type BeforeSubmitFn = Box<dyn FnMut(&Request) -> bool + Send>;
type ProgressFn = Box<dyn FnMut(&TransferProgress) + Send>;
type SuccessFn = Box<dyn FnOnce(&Response) + Send>;
type FailFn = Box<dyn FnOnce(&Failure) + Send>;
type FinallyFn = Box<dyn FnOnce() + Send>;

/// One HTTP exchange.
pub struct Request {
    method: HttpMethod,
    url: String,
    headers: BTreeMap<String, String>,
    query: Vec<(String, String)>,
    fields: BTreeMap<String, String>,
    uploads: BTreeMap<String, UploadFile>,
    timeout: Option<Duration>,
    low_speed: Option<LowSpeedLimit>,
    hourglass: bool,
    progress: bool,
    cancel: CancelFlag,
    before_submit: Option<BeforeSubmitFn>,
    on_progress: Option<ProgressFn>,
    on_success: Option<SuccessFn>,
    on_fail: Option<FailFn>,
    on_finally: Option<FinallyFn>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field("uploads", &self.uploads)
            .finish_non_exhaustive()
    }
}

impl Request {
    /// Create a request for `url`, relative to the API root or absolute.
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            query: Vec::new(),
            fields: BTreeMap::new(),
            uploads: BTreeMap::new(),
            timeout: None,
            low_speed: None,
            hourglass: false,
            progress: false,
            cancel: CancelFlag::new(),
            before_submit: None,
            on_progress: None,
            on_success: None,
            on_fail: None,
            on_finally: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    /// Create a POST request.
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    /// Create a PUT request.
    pub fn put(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, url)
    }

    /// Create a DELETE request.
    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, url)
    }

    /// Create a PATCH request.
    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Patch, url)
    }

    /// Set a header, replacing any previous value.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Append a query parameter.
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Set a post field.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Attach a file; the body becomes multipart.
    pub fn upload(mut self, field: impl Into<String>, file: UploadFile) -> Self {
        self.uploads.insert(field.into(), file);
        self
    }

    /// Set the overall timeout. `Duration::ZERO` disables it.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Abort when fewer than `bytes_per_sec` arrive on average over `window`.
    pub fn low_speed_limit(mut self, bytes_per_sec: u64, window: Duration) -> Self {
        self.low_speed = Some(LowSpeedLimit {
            bytes_per_sec,
            window,
        });
        self
    }

    /// Ask the host to show a busy indicator while this request is in flight.
    pub fn hourglass(mut self, enabled: bool) -> Self {
        self.hourglass = enabled;
        self
    }

    /// Report transfer progress to `on_progress`.
    pub fn progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    /// Share an existing cancel flag.
    pub fn with_cancel_flag(mut self, flag: CancelFlag) -> Self {
        self.cancel = flag;
        self
    }

    /// Inspect the request right before each hand-off to the transport.
    /// Returning `false` fails the request with [`Failure::Vetoed`].
    pub fn before_submit<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&Request) -> bool + Send + 'static,
    {
        self.before_submit = Some(Box::new(hook));
        self
    }

    /// Receive progress updates. Requires [`progress(true)`](Self::progress).
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&TransferProgress) + Send + 'static,
    {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// Called once with the response when the status is 101–399.
    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Response) + Send + 'static,
    {
        self.on_success = Some(Box::new(callback));
        self
    }

    /// Called once when the request ends without success.
    pub fn on_fail<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Failure) + Send + 'static,
    {
        self.on_fail = Some(Box::new(callback));
        self
    }

    /// Called once after `on_success` or `on_fail`.
    pub fn on_finally<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_finally = Some(Box::new(callback));
        self
    }

    /// HTTP method.
    pub fn method(&self) -> HttpMethod {
        self.method
    }

    /// Target as given, before expansion.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Value of header `name` (case-insensitive).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Post fields.
    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Attached files by field name.
    pub fn uploads(&self) -> &BTreeMap<String, UploadFile> {
        &self.uploads
    }

    /// A clone of the cancel flag; raise it to abort the transfer.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Whether this request wants the busy indicator.
    pub fn needs_hourglass(&self) -> bool {
        self.hourglass
    }

    /// Whether this request reports progress.
    pub fn needs_progress(&self) -> bool {
        self.progress
    }

    /// Set a header unless one with the same name (ignoring case) exists.
    pub(crate) fn set_default_header(&mut self, name: &str, value: &str) {
        if self.header_value(name).is_none() {
            self.headers.insert(name.to_string(), value.to_string());
        }
    }

    /// Set a header, replacing any case variant of it.
    pub(crate) fn set_header(&mut self, name: &str, value: String) {
        self.headers.retain(|key, _| !key.eq_ignore_ascii_case(name));
        self.headers.insert(name.to_string(), value);
    }

    /// Run the `before_submit` hook. Without a hook the request proceeds.
    pub(crate) fn run_before_submit(&mut self) -> bool {
        match self.before_submit.take() {
            Some(mut hook) => {
                let proceed = hook(self);
                self.before_submit = Some(hook);
                proceed
            }
            None => true,
        }
    }

    /// Absolute URL for this request, query included.
    pub(crate) fn effective_url(&self, base_url: &str, locale: &str) -> String {
        let mut url = expand_url(base_url, locale, &self.url);
        if !self.query.is_empty() {
            let encoded = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(&self.query)
                .finish();
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&encoded);
        }
        url
    }

    /// Describe one attempt of this request to the multiplexer.
    pub(crate) fn transfer_spec(
        &self,
        url: String,
        default_timeout: Option<Duration>,
        pin: Option<PinnedHost>,
    ) -> TransferSpec {
        let body = self.encode_body();
        if let TransferBody::Form(_) | TransferBody::Multipart(_) = &body {
            tracing::debug!(
                target: "chatcube_net::request",
                %url,
                fields = %self.loggable_fields(),
                files = self.uploads.len(),
                "post data"
            );
        }

        let timeout = match self.timeout {
            Some(timeout) if timeout.is_zero() => None,
            Some(timeout) => Some(timeout),
            None => default_timeout,
        };

        TransferSpec {
            method: self.method,
            url,
            headers: self
                .headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            body,
            timeout,
            low_speed: self.low_speed,
            report_progress: self.progress,
            cancel: self.cancel.clone(),
            pin,
        }
    }

    fn encode_body(&self) -> TransferBody {
        if !self.uploads.is_empty() {
            let mut parts: Vec<FormPart> = self
                .fields
                .iter()
                .map(|(name, value)| FormPart::Text {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect();
            parts.extend(self.uploads.iter().map(|(name, file)| FormPart::File {
                name: name.clone(),
                path: file.path.clone(),
                file_name: file.file_name(),
            }));
            TransferBody::Multipart(parts)
        } else if !self.fields.is_empty() {
            TransferBody::Form(
                url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(&self.fields)
                    .finish(),
            )
        } else if self.method == HttpMethod::Post {
            TransferBody::Empty
        } else {
            TransferBody::None
        }
    }

    fn loggable_fields(&self) -> String {
        if self.fields.contains_key("password") {
            return "<redacted>".to_string();
        }
        self.fields
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    pub(crate) fn report_progress(&mut self, progress: &TransferProgress) {
        if !self.progress {
            return;
        }
        if let Some(callback) = self.on_progress.as_mut() {
            callback(progress);
        }
    }

    /// Fire the terminal callbacks and consume the request.
    pub(crate) fn finish(mut self, outcome: Result<Response, Failure>) {
        match outcome {
            Ok(response) => {
                if let Some(callback) = self.on_success.take() {
                    callback(&response);
                }
            }
            Err(failure) => {
                if let Some(callback) = self.on_fail.take() {
                    callback(&failure);
                }
            }
        }
        if let Some(callback) = self.on_finally.take() {
            callback();
        }
    }

    /// Route a completed response by status.
    pub(crate) fn complete(self, response: Response) {
        if response.is_success() {
            self.finish(Ok(response));
        } else {
            self.finish(Err(Failure::Status(response)));
        }
    }
}
