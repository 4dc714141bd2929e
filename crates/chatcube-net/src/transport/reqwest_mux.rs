//! Multiplexer backed by reqwest on a private tokio runtime.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use futures_util::Stream;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use tokio::io::AsyncReadExt;
use tokio::runtime::{Handle, Runtime};
use tokio::task::AbortHandle;

use super::{
    CancelFlag, Completed, FormPart, HandleRegistry, LowSpeedLimit, Multiplexer, PinnedHost,
    TransferBody, TransferEvent, TransferHandle, TransferId, TransferProgress, TransferSpec,
};
use crate::config::ServiceConfig;
use crate::error::{Result, TransportError};
use crate::tls::Certificate;

/// Connection-level settings shared by every transfer.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// Redirect hops to follow. Zero disables redirects.
    pub max_redirects: usize,
    /// CA certificates to trust instead of the built-in roots.
    pub root_certificates: Vec<Certificate>,
    /// Verify the server certificate chain.
    pub verify_peer: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_redirects: 5,
            root_certificates: Vec::new(),
            verify_peer: true,
        }
    }
}

impl TransportConfig {
    /// Derive transport settings from the service configuration, loading the
    /// CA bundle if one is configured.
    pub fn from_service(config: &ServiceConfig) -> Result<Self> {
        let root_certificates = match &config.ca_bundle {
            Some(path) => Certificate::from_pem_bundle_file(path)?,
            None => Vec::new(),
        };
        Ok(Self {
            connect_timeout: config.connect_timeout(),
            max_redirects: config.max_redirects,
            root_certificates,
            verify_peer: config.verify_peer,
        })
    }
}

/// Upload files are read from disk in pieces of this size.
const UPLOAD_CHUNK: usize = 64 * 1024;

/// How often cancellation and stalls are checked while the request is sent
/// and the response headers are awaited.
const WATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Runs each transfer as a task on its own runtime and reports back through a
/// channel that [`perform`](Multiplexer::perform) drains.
///
/// Clients are built lazily. Each pinned host keeps one client for its
/// current address, so every transfer to the backend reuses the address the
/// service resolved; a new address replaces the old client and its pool.
pub struct ReqwestMultiplexer {
    runtime: Arc<Runtime>,
    config: TransportConfig,
    roots: Vec<reqwest::Certificate>,
    unpinned: Option<reqwest::Client>,
    pinned: HashMap<String, (SocketAddr, reqwest::Client)>,
    registry: HandleRegistry,
    tasks: HashMap<TransferId, AbortHandle>,
    events_tx: Sender<TransferEvent>,
    events_rx: Receiver<TransferEvent>,
}

impl std::fmt::Debug for ReqwestMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestMultiplexer")
            .field("config", &self.config)
            .field("pinned", &self.pinned.len())
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl ReqwestMultiplexer {
    /// Create a multiplexer with its own runtime.
    pub fn new(config: TransportConfig) -> Result<Self> {
        let runtime = Arc::new(crate::runtime::build()?);
        Self::with_runtime(config, runtime)
    }

    /// Create a multiplexer that spawns onto an existing runtime.
    pub fn with_runtime(config: TransportConfig, runtime: Arc<Runtime>) -> Result<Self> {
        let roots = config
            .root_certificates
            .iter()
            .map(Certificate::to_reqwest)
            .collect::<Result<Vec<_>>>()?;
        let (events_tx, events_rx) = crossbeam_channel::unbounded();

        Ok(Self {
            runtime,
            config,
            roots,
            unpinned: None,
            pinned: HashMap::new(),
            registry: HandleRegistry::new(),
            tasks: HashMap::new(),
            events_tx,
            events_rx,
        })
    }

    /// Handle of the runtime transfers run on.
    pub fn runtime_handle(&self) -> Handle {
        self.runtime.handle().clone()
    }

    fn client_for(&mut self, pin: Option<&PinnedHost>) -> std::result::Result<reqwest::Client, TransportError> {
        let Some(pin) = pin else {
            if let Some(client) = &self.unpinned {
                return Ok(client.clone());
            }
            let client = self.build_client(None)?;
            self.unpinned = Some(client.clone());
            return Ok(client);
        };

        if let Some((addr, client)) = self.pinned.get(&pin.host)
            && *addr == pin.addr
        {
            return Ok(client.clone());
        }

        let client = self.build_client(Some(pin))?;
        if let Some((old, _)) = self
            .pinned
            .insert(pin.host.clone(), (pin.addr, client.clone()))
        {
            tracing::debug!(
                target: "chatcube_net::transport",
                host = %pin.host,
                %old,
                new = %pin.addr,
                "backend address changed, replacing client"
            );
        }
        Ok(client)
    }

    fn build_client(&self, pin: Option<&PinnedHost>) -> std::result::Result<reqwest::Client, TransportError> {
        let redirect = if self.config.max_redirects == 0 {
            reqwest::redirect::Policy::none()
        } else {
            reqwest::redirect::Policy::limited(self.config.max_redirects)
        };
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .redirect(redirect);

        if !self.roots.is_empty() {
            builder = builder.tls_built_in_root_certs(false);
            for cert in &self.roots {
                builder = builder.add_root_certificate(cert.clone());
            }
        }
        if !self.config.verify_peer {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(pin) = pin {
            builder = builder.resolve(&pin.host, pin.addr);
        }

        let client = builder.build().map_err(|e| TransportError::Local(e.to_string()))?;
        tracing::debug!(
            target: "chatcube_net::transport",
            pinned = ?pin,
            "built HTTP client"
        );
        Ok(client)
    }
}

impl Multiplexer for ReqwestMultiplexer {
    fn add(&mut self, spec: TransferSpec) -> std::result::Result<TransferHandle, TransportError> {
        let client = self.client_for(spec.pin.as_ref())?;
        let handle = self.registry.acquire();
        let id = handle.id();

        tracing::debug!(
            target: "chatcube_net::transport",
            %id,
            method = %spec.method,
            url = %spec.url,
            "starting transfer"
        );

        let events = self.events_tx.clone();
        let task = self.runtime.spawn(run_transfer(client, id, spec, events));
        self.tasks.insert(id, task.abort_handle());
        Ok(handle)
    }

    fn perform(&mut self) -> Vec<TransferEvent> {
        for id in self.registry.reap() {
            if let Some(task) = self.tasks.remove(&id) {
                task.abort();
            }
        }

        let events: Vec<TransferEvent> = self.events_rx.try_iter().collect();
        for event in &events {
            if let TransferEvent::Done { id, .. } = event {
                self.tasks.remove(id);
            }
        }
        events
    }

    fn live_transfers(&self) -> usize {
        self.registry.live()
    }
}

impl Drop for ReqwestMultiplexer {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

async fn run_transfer(
    client: reqwest::Client,
    id: TransferId,
    spec: TransferSpec,
    events: Sender<TransferEvent>,
) {
    let result = perform_transfer(&client, id, &spec, &events).await;
    if let Err(error) = &result {
        tracing::debug!(
            target: "chatcube_net::transport",
            %id,
            %error,
            "transfer failed"
        );
    }
    // The multiplexer may have been dropped; nobody is left to tell.
    let _ = events.send(TransferEvent::Done { id, result });
}

async fn perform_transfer(
    client: &reqwest::Client,
    id: TransferId,
    spec: &TransferSpec,
    events: &Sender<TransferEvent>,
) -> std::result::Result<Completed, TransportError> {
    let mut request = client.request(spec.method.to_reqwest(), &spec.url);

    for (name, value) in &spec.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => request = request.header(name, value),
            _ => tracing::warn!(
                target: "chatcube_net::transport",
                %id,
                header = %name,
                "skipping invalid header"
            ),
        }
    }
    if let Some(timeout) = spec.timeout {
        request = request.timeout(timeout);
    }

    let mut uploaded = None;
    request = match &spec.body {
        TransferBody::None => request,
        TransferBody::Empty => request.body(Vec::<u8>::new()),
        TransferBody::Form(encoded) => request
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(encoded.clone()),
        TransferBody::Multipart(parts) => {
            let (form, sent) = build_form(id, spec, parts, events).await?;
            uploaded = sent;
            request.multipart(form)
        }
    };

    if spec.cancel.is_cancelled() {
        return Err(TransportError::Cancelled);
    }

    let mut stall = spec.low_speed.map(StallDetector::new);
    let mut response = {
        let send = request.send();
        tokio::pin!(send);
        let mut watch = tokio::time::interval(WATCH_INTERVAL);
        let mut counted = 0;
        loop {
            tokio::select! {
                result = &mut send => {
                    break result.map_err(|err| {
                        // A cancelled upload surfaces as a body error.
                        if spec.cancel.is_cancelled() {
                            TransportError::Cancelled
                        } else {
                            TransportError::from(err)
                        }
                    })?;
                }
                _ = watch.tick() => {
                    if spec.cancel.is_cancelled() {
                        return Err(TransportError::Cancelled);
                    }
                    if let Some(detector) = stall.as_mut() {
                        let sent = uploaded
                            .as_ref()
                            .map_or(0, |sent: &Arc<AtomicU64>| sent.load(Ordering::Relaxed));
                        detector.record(sent.saturating_sub(counted));
                        counted = sent;
                        detector.check()?;
                    }
                }
            }
        }
    };
    let status = response.status().as_u16();
    let effective_url = response.url().to_string();
    let total = response.content_length();

    let mut received: u64 = 0;

    loop {
        if spec.cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let chunk = match stall.as_mut() {
            Some(detector) => {
                match tokio::time::timeout(detector.remaining(), response.chunk()).await {
                    Ok(chunk) => chunk?,
                    Err(_) => {
                        detector.check()?;
                        continue;
                    }
                }
            }
            None => response.chunk().await?,
        };
        let Some(chunk) = chunk else {
            break;
        };

        received += chunk.len() as u64;
        if let Some(detector) = stall.as_mut() {
            detector.record(chunk.len() as u64);
            detector.check()?;
        }

        if events.send(TransferEvent::Data { id, chunk }).is_err() {
            return Err(TransportError::Cancelled);
        }
        // Uploads report the bytes they sent, not the reply.
        if spec.report_progress && uploaded.is_none() {
            let progress = TransferProgress::new(received, total);
            let _ = events.send(TransferEvent::Progress { id, progress });
        }
    }

    Ok(Completed {
        status,
        effective_url,
    })
}

fn unreadable(path: &Path, err: std::io::Error) -> TransportError {
    TransportError::Local(format!("cannot read '{}': {err}", path.display()))
}

/// Build the multipart form, streaming every file from disk through one
/// shared [`UploadMeter`]. Returns the meter's byte count when the form
/// carries files.
async fn build_form(
    id: TransferId,
    spec: &TransferSpec,
    parts: &[FormPart],
    events: &Sender<TransferEvent>,
) -> std::result::Result<(reqwest::multipart::Form, Option<Arc<AtomicU64>>), TransportError> {
    let mut total = 0;
    let mut has_files = false;
    for part in parts {
        if let FormPart::File { path, .. } = part {
            let metadata = tokio::fs::metadata(path)
                .await
                .map_err(|e| unreadable(path, e))?;
            total += metadata.len();
            has_files = true;
        }
    }

    let meter = UploadMeter {
        id,
        sent: Arc::new(AtomicU64::new(0)),
        total,
        cancel: spec.cancel.clone(),
        events: spec.report_progress.then(|| events.clone()),
    };

    let mut form = reqwest::multipart::Form::new();
    for part in parts {
        form = match part {
            FormPart::Text { name, value } => form.text(name.clone(), value.clone()),
            FormPart::File {
                name,
                path,
                file_name,
            } => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| unreadable(path, e))?;
                let length = file
                    .metadata()
                    .await
                    .map_err(|e| unreadable(path, e))?
                    .len();
                let body = reqwest::Body::wrap_stream(file_chunks(file, meter.clone()));
                let part = reqwest::multipart::Part::stream_with_length(body, length)
                    .file_name(file_name.clone());
                form.part(name.clone(), part)
            }
        };
    }
    Ok((form, has_files.then_some(meter.sent)))
}

/// Counts upload bytes as the connection takes them and reports progress.
#[derive(Clone)]
struct UploadMeter {
    id: TransferId,
    sent: Arc<AtomicU64>,
    total: u64,
    cancel: CancelFlag,
    events: Option<Sender<TransferEvent>>,
}

impl UploadMeter {
    fn advance(&self, bytes: u64) {
        let sent = self.sent.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if let Some(events) = &self.events {
            let progress = TransferProgress::new(sent, Some(self.total));
            let _ = events.send(TransferEvent::Progress { id: self.id, progress });
        }
    }
}

/// Read `file` in [`UPLOAD_CHUNK`] pieces, stopping with an error as soon as
/// the transfer is cancelled.
fn file_chunks(
    file: tokio::fs::File,
    meter: UploadMeter,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    futures_util::stream::try_unfold((file, meter), |(mut file, meter)| async move {
        if meter.cancel.is_cancelled() {
            return Err(std::io::Error::other("upload cancelled"));
        }
        let mut buf = vec![0; UPLOAD_CHUNK];
        let read = file.read(&mut buf).await?;
        if read == 0 {
            return Ok(None);
        }
        buf.truncate(read);
        meter.advance(read as u64);
        Ok(Some((Bytes::from(buf), (file, meter))))
    })
}

/// Aborts a transfer whose throughput stays under the floor for a window.
struct StallDetector {
    limit: LowSpeedLimit,
    window_start: Instant,
    window_bytes: u64,
}

impl StallDetector {
    fn new(limit: LowSpeedLimit) -> Self {
        Self {
            limit,
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    fn remaining(&self) -> Duration {
        self.limit.window.saturating_sub(self.window_start.elapsed())
    }

    fn record(&mut self, bytes: u64) {
        self.window_bytes += bytes;
    }

    fn check(&mut self) -> std::result::Result<(), TransportError> {
        if self.window_start.elapsed() < self.limit.window {
            return Ok(());
        }
        if self.window_bytes < self.limit.min_bytes_per_window() {
            return Err(TransportError::LowSpeed {
                bytes_per_sec: self.limit.bytes_per_sec,
                window: self.limit.window,
            });
        }
        self.window_start = Instant::now();
        self.window_bytes = 0;
        Ok(())
    }
}
