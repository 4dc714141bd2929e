//! State of the long-lived subscription.

use std::time::{Duration, Instant};

use crate::http::RetryPolicy;

use super::parser::SseParser;
use super::record::StreamRecord;

/// The realtime event stream of one channel.
///
/// `EventStream` holds everything that must survive a reconnect: the channel,
/// the resume cursor, and the reconnect schedule. The service owns the
/// transport handle and tells the stream when it was armed, when bytes
/// arrived, and when the connection dropped.
#[derive(Debug)]
pub struct EventStream {
    channel: Option<String>,
    cursor: Option<String>,
    parser: SseParser,
    started: bool,
    inactivity: Duration,
    reconnect: RetryPolicy,
    reconnects: u32,
    reconnect_at: Option<Instant>,
    last_activity: Instant,
    last_receive: Option<Instant>,
}

impl EventStream {
    /// Create a stopped stream.
    pub fn new(inactivity: Duration, reconnect: RetryPolicy) -> Self {
        Self {
            channel: None,
            cursor: None,
            parser: SseParser::new(),
            started: false,
            inactivity,
            reconnect,
            reconnects: 0,
            reconnect_at: None,
            last_activity: Instant::now(),
            last_receive: None,
        }
    }

    /// Subscribe to `channel`, resuming after `resume_from` if given.
    ///
    /// The stream becomes due for arming immediately.
    pub fn start(&mut self, channel: impl Into<String>, resume_from: Option<String>, now: Instant) {
        self.channel = Some(channel.into());
        self.cursor = resume_from;
        self.started = true;
        self.reconnects = 0;
        self.reconnect_at = Some(now);
        self.last_receive = None;
        self.parser.reset();
    }

    /// Stop the subscription. The cursor is kept.
    pub fn stop(&mut self) {
        self.started = false;
        self.reconnect_at = None;
        self.parser.reset();
    }

    /// Whether the stream should be connected.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Subscribed channel.
    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    /// Time of the last validated record.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// The subscribe URL, `<base>ev/<channel>` plus the cursor as `time`.
    pub fn subscribe_url(&self, base_url: &str) -> Option<String> {
        let channel = self.channel.as_deref()?;
        let mut url = format!("{base_url}ev/{channel}");
        if let Some(cursor) = &self.cursor {
            url.push_str("?time=");
            url.extend(url::form_urlencoded::byte_serialize(cursor.as_bytes()));
        }
        Some(url)
    }

    /// Whether a new connection should be opened now.
    pub fn is_due(&self, now: Instant) -> bool {
        self.started && self.reconnect_at.is_some_and(|at| now >= at)
    }

    /// Make a started stream due again at `at`, outside the reconnect policy.
    pub fn schedule_reconnect(&mut self, at: Instant) {
        if self.started {
            self.reconnect_at = Some(at);
        }
    }

    /// Record that a connection was just opened.
    pub fn on_armed(&mut self, now: Instant) {
        self.reconnect_at = None;
        self.last_activity = now;
        self.parser.reset();
    }

    /// Record that the connection ended and schedule the next one.
    ///
    /// Returns the delay before reconnecting, or `None` when the stream is
    /// stopped, either already or because the reconnect policy gave up.
    pub fn on_disconnected(&mut self, now: Instant) -> Option<Duration> {
        if !self.started {
            return None;
        }
        self.reconnects = self.reconnects.saturating_add(1);
        match self.reconnect.next_delay(self.reconnects) {
            Some(delay) => {
                self.reconnect_at = Some(now + delay);
                Some(delay)
            }
            None => {
                tracing::warn!(
                    target: "chatcube_net::sse",
                    channel = self.channel.as_deref().unwrap_or_default(),
                    attempts = self.reconnects,
                    "event stream reconnects exhausted, stopping"
                );
                self.stop();
                None
            }
        }
    }

    /// Consume body bytes and return the records they complete.
    ///
    /// Malformed records are logged and skipped without moving the cursor.
    pub fn feed(&mut self, chunk: &[u8], now: Instant) -> Vec<StreamRecord> {
        self.last_activity = now;
        self.last_receive = Some(now);
        self.reconnects = 0;

        let mut records = Vec::new();
        for raw in self.parser.feed(chunk) {
            match StreamRecord::parse(&raw) {
                Ok(record) => {
                    self.cursor = Some(record.time.clone());
                    records.push(record);
                }
                Err(error) => {
                    tracing::warn!(
                        target: "chatcube_net::sse",
                        %error,
                        raw = %raw,
                        "dropping malformed record"
                    );
                }
            }
        }
        records
    }

    /// Whether the connection showed any sign of life within the window.
    pub fn is_active(&self, now: Instant) -> bool {
        now.duration_since(self.last_activity) < self.inactivity
    }

    /// Whether bytes arrived within the window.
    pub fn is_receiving(&self, now: Instant) -> bool {
        self.last_receive
            .is_some_and(|at| now.duration_since(at) < self.inactivity)
    }
}
