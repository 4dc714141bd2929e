//! The dispatch loop.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::task::Poll;
use std::time::Instant;

use bytes::BytesMut;
use crossbeam_channel::{Receiver, Sender};
use url::Url;

use crate::config::ServiceConfig;
use crate::dns::{DnsResolver, HostResolver};
use crate::error::{Result, TransportError};
use crate::sse::{EventStream, StreamRecord};
use crate::thread_check::ThreadAffinity;
use crate::transport::{
    Completed, Multiplexer, PinnedHost, ReqwestMultiplexer, TransferEvent, TransferHandle,
    TransferId, TransferProgress, TransferSpec, TransportConfig,
};

use super::request::Request;
use super::response::{Failure, Response};

type EventsHandler = Box<dyn FnMut(&StreamRecord) + Send>;

/// A request with a live transfer.
struct InFlight {
    request: Request,
    handle: TransferHandle,
    attempts: u32,
    body: BytesMut,
    /// Bytes announced by the last progress report.
    reported: u64,
}

/// A request waiting for the link to come up or for its backoff to expire.
struct Pending {
    request: Request,
    attempts: u32,
    not_before: Instant,
}

enum Command {
    Submit(Request),
    SetAuthToken(Option<String>),
    StartEventStream {
        channel: String,
        resume_from: Option<String>,
    },
    StopEventStream,
}

/// Cloneable, thread-safe access to an [`HttpService`].
///
/// Commands are queued and applied at the start of the service's next
/// `process()` call, on the service's own thread.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    commands: Sender<Command>,
}

impl ServiceHandle {
    /// Queue a request. Gives the request back if the service is gone.
    pub fn submit(&self, request: Request) -> std::result::Result<(), Request> {
        match self.commands.send(Command::Submit(request)) {
            Err(err) => match err.into_inner() {
                Command::Submit(request) => Err(request),
                _ => Ok(()),
            },
            Ok(()) => Ok(()),
        }
    }

    /// Queue an auth token change. Returns `false` if the service is gone.
    pub fn set_auth_token(&self, token: Option<String>) -> bool {
        self.commands.send(Command::SetAuthToken(token)).is_ok()
    }

    /// Queue a subscription start. Returns `false` if the service is gone.
    pub fn start_event_stream(&self, channel: impl Into<String>, resume_from: Option<String>) -> bool {
        self.commands
            .send(Command::StartEventStream {
                channel: channel.into(),
                resume_from,
            })
            .is_ok()
    }

    /// Queue a subscription stop. Returns `false` if the service is gone.
    pub fn stop_event_stream(&self) -> bool {
        self.commands.send(Command::StopEventStream).is_ok()
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submit(request) => f.debug_tuple("Submit").field(request).finish(),
            Self::SetAuthToken(token) => f
                .debug_tuple("SetAuthToken")
                .field(&token.as_ref().map(|_| "<token>"))
                .finish(),
            Self::StartEventStream { channel, .. } => f
                .debug_struct("StartEventStream")
                .field("channel", channel)
                .finish_non_exhaustive(),
            Self::StopEventStream => f.write_str("StopEventStream"),
        }
    }
}

/// Single-threaded HTTP service driven by [`process`](Self::process).
///
/// The service owns every submitted [`Request`] until its final callback and
/// the event stream's connection. Nothing happens between `process` calls:
/// callbacks fire only from `process`, `submit` (for vetoed requests), and
/// `shutdown`, all on the thread that created the service.
///
/// ```ignore
/// use chatcube_net::{HttpService, Request, ServiceConfig};
///
/// let mut service = HttpService::new(ServiceConfig::load("chatcube.toml")?)?;
/// service.set_events_handler(|record| println!("{}: {:?}", record.id, record.text()));
/// service.start_event_stream("42", None);
/// service.submit(Request::get("/ping").on_success(|r| println!("pong {}", r.status())));
///
/// loop {
///     service.process();
///     std::thread::sleep(std::time::Duration::from_millis(50));
/// }
/// ```
pub struct HttpService<M: Multiplexer = ReqwestMultiplexer> {
    config: ServiceConfig,
    host: String,
    mux: M,
    resolver: HostResolver,
    in_flight: HashMap<TransferId, InFlight>,
    pending: VecDeque<Pending>,
    stream: EventStream,
    stream_transfer: Option<TransferHandle>,
    events_handler: Option<EventsHandler>,
    commands_tx: Sender<Command>,
    commands_rx: Receiver<Command>,
    hourglass: usize,
    affinity: ThreadAffinity,
    shut_down: bool,
}

impl<M: Multiplexer> std::fmt::Debug for HttpService<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpService")
            .field("host", &self.host)
            .field("online", &self.resolver.is_online())
            .field("in_flight", &self.in_flight.len())
            .field("pending", &self.pending.len())
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl HttpService<ReqwestMultiplexer> {
    /// Build a service with the reqwest multiplexer and hickory DNS.
    pub fn new(config: ServiceConfig) -> Result<Self> {
        let config = config.validated()?;
        let mux = ReqwestMultiplexer::new(TransportConfig::from_service(&config)?)?;
        let dns = DnsResolver::new(&config.dns, mux.runtime_handle())?;
        Self::with_parts(config, mux, HostResolver::new(dns))
    }
}

impl<M: Multiplexer> HttpService<M> {
    /// Build a service from explicit collaborators.
    pub fn with_parts(config: ServiceConfig, mux: M, resolver: HostResolver) -> Result<Self> {
        let config = config.validated()?;
        let host = config.backend_host()?;
        let stream = EventStream::new(config.stream_inactivity(), config.stream_reconnect.clone());
        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();

        Ok(Self {
            config,
            host,
            mux,
            resolver,
            in_flight: HashMap::new(),
            pending: VecDeque::new(),
            stream,
            stream_transfer: None,
            events_handler: None,
            commands_tx,
            commands_rx,
            hourglass: 0,
            affinity: ThreadAffinity::current(),
            shut_down: false,
        })
    }

    /// Point the service at another backend. No I/O happens here; a new host
    /// is resolved on the next `process`.
    pub fn init(&mut self, base_url: &str, locale: &str, user_agent: &str) -> Result<()> {
        self.affinity.debug_assert_same_thread("init");
        let config = ServiceConfig {
            base_url: base_url.to_string(),
            locale: locale.to_string(),
            user_agent: user_agent.to_string(),
            ..self.config.clone()
        }
        .validated()?;
        let host = config.backend_host()?;

        if host != self.host {
            self.resolver.mark_offline(&self.host);
            self.host = host;
        }
        self.config = config;
        Ok(())
    }

    /// Set or clear the token sent as `Authorization: Token <token>`.
    pub fn set_auth_token(&mut self, token: Option<String>) {
        self.affinity.debug_assert_same_thread("set_auth_token");
        self.config.auth_token = token.filter(|token| !token.is_empty());
    }

    /// Receive every validated event-stream record.
    pub fn set_events_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&StreamRecord) + Send + 'static,
    {
        self.events_handler = Some(Box::new(handler));
    }

    /// A handle for reaching the service from callbacks or other threads.
    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            commands: self.commands_tx.clone(),
        }
    }

    /// Take ownership of `request` and send it as soon as the link is up.
    pub fn submit(&mut self, request: Request) {
        self.affinity.debug_assert_same_thread("submit");
        if self.shut_down {
            request.finish(Err(Failure::Shutdown));
            return;
        }

        if self.resolver.is_online() {
            self.dispatch(request, 0, Instant::now());
        } else {
            tracing::debug!(
                target: "chatcube_net::service",
                url = request.url(),
                "offline, request queued"
            );
            self.pending.push_back(Pending {
                request,
                attempts: 0,
                not_before: Instant::now(),
            });
        }
    }

    /// Subscribe to `channel`. The connection opens on the next `process`.
    pub fn start_event_stream(&mut self, channel: impl Into<String>, resume_from: Option<String>) {
        self.affinity.debug_assert_same_thread("start_event_stream");
        let channel = channel.into();
        tracing::info!(
            target: "chatcube_net::sse",
            channel = %channel,
            resume_from = resume_from.as_deref().unwrap_or_default(),
            "starting event stream"
        );
        self.stream_transfer = None;
        self.stream.start(channel, resume_from, Instant::now());
    }

    /// Close the subscription without reconnecting.
    pub fn stop_event_stream(&mut self) {
        self.affinity.debug_assert_same_thread("stop_event_stream");
        if self.stream.is_started() {
            tracing::info!(target: "chatcube_net::sse", "stopping event stream");
        }
        self.stream.stop();
        self.stream_transfer = None;
    }

    /// Run one tick: apply queued commands, gate on resolution, flush due
    /// requests, arm the stream, drive the multiplexer, dispatch completions,
    /// and check the stream's liveness.
    pub fn process(&mut self) {
        self.affinity.debug_assert_same_thread("process");
        if self.shut_down {
            self.refuse_queued_submissions();
            return;
        }

        self.drain_commands();
        let now = Instant::now();

        // A lookup started by the watchdog finishes while traffic keeps
        // flowing to the cached address.
        if (!self.resolver.is_online() || self.resolver.is_resolving())
            && self.resolver.resolve(&self.host).is_pending()
        {
            tracing::trace!(target: "chatcube_net::dns", host = %self.host, "resolution in progress");
        }
        if !self.resolver.is_online() {
            return;
        }

        self.flush_pending(now);

        let mut armed = false;
        if self.stream_transfer.is_none() && self.stream.is_due(now) {
            armed = self.arm_stream(now);
        }

        for event in self.mux.perform() {
            self.handle_event(event, now);
        }

        if self.resolver.is_online() {
            if self.stream_transfer.is_none() && self.stream.is_due(now) {
                armed |= self.arm_stream(now);
            }
            self.flush_pending(now);
        }

        self.check_stream(now, armed);
    }

    /// Whether the event stream is up and data arrived recently.
    pub fn connected(&self) -> bool {
        self.stream.is_started()
            && self.stream_transfer.is_some()
            && self.stream.is_receiving(Instant::now())
    }

    /// Whether the backend host is currently resolved.
    pub fn is_online(&self) -> bool {
        self.resolver.is_online()
    }

    /// Whether any in-flight request asked for the busy indicator.
    pub fn hourglass_active(&self) -> bool {
        self.hourglass > 0
    }

    /// Requests with a live transfer.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Requests waiting for the link or a backoff deadline.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Time of the last validated event-stream record.
    pub fn resume_cursor(&self) -> Option<&str> {
        self.stream.cursor()
    }

    /// Current configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The multiplexer.
    pub fn multiplexer(&self) -> &M {
        &self.mux
    }

    /// End every outstanding request with [`Failure::Shutdown`] and close the
    /// event stream. Later submissions fail immediately.
    pub fn shutdown(&mut self) {
        self.affinity.debug_assert_same_thread("shutdown");
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if !self.shut_down {
            tracing::info!(
                target: "chatcube_net::service",
                in_flight = self.in_flight.len(),
                pending = self.pending.len(),
                "shutting down"
            );
        }
        self.shut_down = true;
        self.stream.stop();
        self.stream_transfer = None;
        self.hourglass = 0;

        let mut in_flight: Vec<(TransferId, InFlight)> = self.in_flight.drain().collect();
        in_flight.sort_by_key(|(id, _)| *id);
        for (_, flight) in in_flight {
            drop(flight.handle);
            flight.request.finish(Err(Failure::Shutdown));
        }

        for entry in std::mem::take(&mut self.pending) {
            entry.request.finish(Err(Failure::Shutdown));
        }

        self.refuse_queued_submissions();
    }

    /// Fail requests that handles queued after shutdown; other commands no
    /// longer apply.
    fn refuse_queued_submissions(&mut self) {
        while let Ok(command) = self.commands_rx.try_recv() {
            if let Command::Submit(request) = command {
                request.finish(Err(Failure::Shutdown));
            }
        }
    }

    fn drain_commands(&mut self) {
        let commands: Vec<Command> = self.commands_rx.try_iter().collect();
        for command in commands {
            match command {
                Command::Submit(request) => self.submit(request),
                Command::SetAuthToken(token) => self.set_auth_token(token),
                Command::StartEventStream {
                    channel,
                    resume_from,
                } => self.start_event_stream(channel, resume_from),
                Command::StopEventStream => self.stop_event_stream(),
            }
        }
    }

    fn flush_pending(&mut self, now: Instant) {
        if self.pending.is_empty() {
            return;
        }

        let queue = std::mem::take(&mut self.pending);
        let mut waiting = VecDeque::new();
        for entry in queue {
            if !self.resolver.is_online() || entry.not_before > now {
                waiting.push_back(entry);
            } else {
                self.dispatch(entry.request, entry.attempts, now);
            }
        }
        // Refused hand-offs were requeued by `dispatch`; keep them behind the
        // requests that were already waiting.
        waiting.extend(self.pending.drain(..));
        self.pending = waiting;
    }

    /// Attach headers, run the veto hook, and hand the request off.
    fn dispatch(&mut self, mut request: Request, attempts: u32, now: Instant) {
        for (name, value) in &self.config.default_headers {
            request.set_default_header(name, value);
        }
        request.set_default_header("User-Agent", &self.config.user_agent);
        if let Some(token) = &self.config.auth_token {
            request.set_header("Authorization", format!("Token {token}"));
        }

        let url = request.effective_url(&self.config.base_url, &self.config.locale);
        if !request.run_before_submit() {
            tracing::debug!(target: "chatcube_net::service", %url, "request vetoed");
            request.finish(Err(Failure::Vetoed));
            return;
        }

        let pin = self.pin_for(&url);
        let spec = request.transfer_spec(url.clone(), self.config.request_timeout(), pin);
        let attempt = attempts + 1;

        match self.mux.add(spec) {
            Ok(handle) => {
                tracing::debug!(
                    target: "chatcube_net::service",
                    id = %handle.id(),
                    method = %request.method(),
                    %url,
                    attempt,
                    "request submitted"
                );
                if request.needs_hourglass() {
                    self.hourglass += 1;
                }
                self.in_flight.insert(
                    handle.id(),
                    InFlight {
                        request,
                        handle,
                        attempts: attempt,
                        body: BytesMut::new(),
                        reported: 0,
                    },
                );
            }
            Err(error) => {
                tracing::warn!(
                    target: "chatcube_net::service",
                    %url,
                    %error,
                    "multiplexer refused transfer"
                );
                self.retry_or_fail(request, attempt, error, now);
            }
        }
    }

    fn retry_or_fail(&mut self, request: Request, attempts: u32, error: TransportError, now: Instant) {
        if !error.is_retryable() {
            tracing::debug!(
                target: "chatcube_net::service",
                url = request.url(),
                %error,
                "request failed"
            );
            request.finish(Err(Failure::Transport(error)));
            return;
        }

        match self.config.retry.next_delay(attempts) {
            Some(delay) => {
                tracing::warn!(
                    target: "chatcube_net::service",
                    url = request.url(),
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "transfer failed, resubmitting"
                );
                self.pending.push_back(Pending {
                    request,
                    attempts,
                    not_before: now + delay,
                });
            }
            None => {
                tracing::warn!(
                    target: "chatcube_net::service",
                    url = request.url(),
                    attempts,
                    %error,
                    "transfer failed, giving up"
                );
                request.finish(Err(Failure::RetriesExhausted {
                    attempts,
                    last_error: error,
                }));
            }
        }
    }

    /// Reuse the resolved backend address for URLs on the backend host.
    fn pin_for(&self, url: &str) -> Option<PinnedHost> {
        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        if host != self.host || literal.parse::<IpAddr>().is_ok() {
            return None;
        }
        let ip = self.resolver.cached(host)?;
        let port = parsed.port_or_known_default()?;
        Some(PinnedHost {
            host: host.to_string(),
            addr: SocketAddr::new(ip, port),
        })
    }

    fn handle_event(&mut self, event: TransferEvent, now: Instant) {
        let id = event.id();
        if self
            .stream_transfer
            .as_ref()
            .is_some_and(|handle| handle.id() == id)
        {
            self.handle_stream_event(event, now);
            return;
        }

        match event {
            TransferEvent::Data { id, chunk } => match self.in_flight.get_mut(&id) {
                Some(flight) => flight.body.extend_from_slice(&chunk),
                None => tracing::trace!(
                    target: "chatcube_net::service",
                    %id,
                    "data for released transfer"
                ),
            },
            TransferEvent::Progress { id, progress } => {
                if let Some(flight) = self.in_flight.get_mut(&id) {
                    flight.reported = progress.bytes_transferred;
                    flight.request.report_progress(&progress);
                }
            }
            TransferEvent::Done { id, result } => self.complete(id, result, now),
        }
    }

    fn complete(&mut self, id: TransferId, result: std::result::Result<Completed, TransportError>, now: Instant) {
        let Some(flight) = self.in_flight.remove(&id) else {
            tracing::trace!(
                target: "chatcube_net::service",
                %id,
                "completion for released transfer"
            );
            return;
        };
        let InFlight {
            mut request,
            handle,
            attempts,
            body,
            reported,
        } = flight;
        drop(handle);
        if request.needs_hourglass() {
            self.hourglass = self.hourglass.saturating_sub(1);
        }

        match result {
            Ok(Completed {
                status,
                effective_url,
            }) => {
                tracing::debug!(
                    target: "chatcube_net::service",
                    %id,
                    status,
                    url = %effective_url,
                    bytes = body.len(),
                    "request finished"
                );
                // Uploads report the bytes sent; everything else the bytes received.
                let transferred = reported.max(body.len() as u64);
                request.report_progress(&TransferProgress::finished(transferred));
                request.complete(Response::new(status, effective_url, body.freeze()));
            }
            Err(error) => {
                if error.is_connection_failure() {
                    self.resolver.mark_offline(&self.host);
                }
                self.retry_or_fail(request, attempts, error, now);
            }
        }
    }

    fn handle_stream_event(&mut self, event: TransferEvent, now: Instant) {
        match event {
            TransferEvent::Data { chunk, .. } => {
                let records = self.stream.feed(&chunk, now);
                if records.is_empty() {
                    return;
                }
                match self.events_handler.as_mut() {
                    Some(handler) => records.iter().for_each(|record| handler(record)),
                    None => tracing::warn!(
                        target: "chatcube_net::sse",
                        count = records.len(),
                        "no events handler, dropping records"
                    ),
                }
            }
            TransferEvent::Progress { .. } => {}
            TransferEvent::Done { result, .. } => {
                self.stream_transfer = None;
                match &result {
                    Ok(completed) => tracing::info!(
                        target: "chatcube_net::sse",
                        status = completed.status,
                        "event stream closed"
                    ),
                    Err(error) => {
                        tracing::warn!(target: "chatcube_net::sse", %error, "event stream dropped");
                        if error.is_connection_failure() {
                            self.resolver.mark_offline(&self.host);
                        }
                    }
                }
                if let Some(delay) = self.stream.on_disconnected(now) {
                    tracing::debug!(
                        target: "chatcube_net::sse",
                        delay_ms = delay.as_millis() as u64,
                        "event stream reconnect scheduled"
                    );
                }
            }
        }
    }

    fn arm_stream(&mut self, now: Instant) -> bool {
        let Some(url) = self.stream.subscribe_url(&self.config.base_url) else {
            return false;
        };

        let mut spec = TransferSpec::get(url.clone());
        spec.headers.push(("Accept".to_string(), "text/event-stream".to_string()));
        spec.headers.push(("User-Agent".to_string(), self.config.user_agent.clone()));
        for (name, value) in &self.config.default_headers {
            spec.headers.push((name.clone(), value.clone()));
        }
        if let Some(token) = &self.config.auth_token {
            spec.headers.push(("Authorization".to_string(), format!("Token {token}")));
        }
        spec.pin = self.pin_for(&url);

        match self.mux.add(spec) {
            Ok(handle) => {
                tracing::debug!(target: "chatcube_net::sse", id = %handle.id(), %url, "event stream armed");
                self.stream.on_armed(now);
                self.stream_transfer = Some(handle);
                true
            }
            Err(error) => {
                tracing::warn!(target: "chatcube_net::sse", %url, %error, "cannot arm event stream");
                self.stream.on_disconnected(now);
                false
            }
        }
    }

    /// Restart a stream that has gone quiet for longer than the window.
    fn check_stream(&mut self, now: Instant, armed_this_tick: bool) {
        if armed_this_tick
            || !self.stream.is_started()
            || self.stream_transfer.is_none()
            || self.stream.is_active(now)
        {
            return;
        }

        tracing::warn!(
            target: "chatcube_net::sse",
            channel = self.stream.channel().unwrap_or_default(),
            "event stream inactive, restarting"
        );
        self.stream_transfer = None;
        self.stream.schedule_reconnect(now);
        // A pending lookup leaves the stream due; it is armed by a later tick.
        if let Poll::Ready(Ok(_)) = self.resolver.resolve(&self.host) {
            self.arm_stream(now);
        }
    }
}

impl<M: Multiplexer> Drop for HttpService<M> {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}
