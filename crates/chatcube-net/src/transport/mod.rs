//! The multiplexer boundary.
//!
//! A [`Multiplexer`] holds many concurrent transfers and is driven one
//! non-blocking step at a time by [`perform`](Multiplexer::perform). Each
//! transfer is described by a [`TransferSpec`] and owned by the
//! [`TransferHandle`] returned from [`add`](Multiplexer::add); dropping the
//! handle tears the transfer down. Everything the transfer produces comes back
//! as [`TransferEvent`]s from `perform`, so no user code ever runs on a
//! transport thread.

mod reqwest_mux;
mod scripted;

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};

use crate::error::TransportError;
use crate::http::HttpMethod;

pub use reqwest_mux::{ReqwestMultiplexer, TransportConfig};
pub use scripted::{ScriptedMultiplexer, ScriptedTransfer};

/// Identifier of one transfer, unique within its multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u64);

impl TransferId {
    /// The raw value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Ownership of one live transfer.
///
/// Dropping the handle releases the transfer: the multiplexer notices on its
/// next `perform` and aborts whatever is still in progress.
#[derive(Debug)]
pub struct TransferHandle {
    id: TransferId,
    release: Sender<TransferId>,
}

impl TransferHandle {
    /// The transfer this handle owns.
    pub fn id(&self) -> TransferId {
        self.id
    }
}

impl Drop for TransferHandle {
    fn drop(&mut self) {
        // The registry may already be gone during teardown.
        let _ = self.release.send(self.id);
    }
}

/// Hands out [`TransferHandle`]s and tracks which are still alive.
#[derive(Debug)]
pub struct HandleRegistry {
    next_id: u64,
    live: std::collections::HashSet<TransferId>,
    release_tx: Sender<TransferId>,
    release_rx: Receiver<TransferId>,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        Self {
            next_id: 1,
            live: std::collections::HashSet::new(),
            release_tx,
            release_rx,
        }
    }

    /// Issue a handle for a new transfer.
    pub fn acquire(&mut self) -> TransferHandle {
        let id = TransferId(self.next_id);
        self.next_id += 1;
        self.live.insert(id);
        TransferHandle {
            id,
            release: self.release_tx.clone(),
        }
    }

    /// Collect the transfers whose handles were dropped since the last call.
    pub fn reap(&mut self) -> Vec<TransferId> {
        let released: Vec<TransferId> = self.release_rx.try_iter().collect();
        for id in &released {
            self.live.remove(id);
        }
        released
    }

    /// Whether `id` still has a live handle, as of the last `reap`.
    pub fn is_live(&self, id: TransferId) -> bool {
        self.live.contains(&id)
    }

    /// Number of live handles, as of the last `reap`.
    pub fn live(&self) -> usize {
        self.live.len()
    }
}

/// Cooperative cancellation shared between a request and its transfers.
///
/// The multiplexer checks the flag at every progress point; raising it ends
/// the transfer with [`TransportError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create a lowered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the flag is raised.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Abort threshold for stalled transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowSpeedLimit {
    /// Minimum average throughput over a window.
    pub bytes_per_sec: u64,
    /// Length of the measurement window.
    pub window: Duration,
}

impl LowSpeedLimit {
    /// Bytes that must arrive within one window.
    pub fn min_bytes_per_window(&self) -> u64 {
        let bytes = u128::from(self.bytes_per_sec)
            .saturating_mul(self.window.as_nanos())
            .div_ceil(1_000_000_000);
        u64::try_from(bytes).unwrap_or(u64::MAX)
    }
}

/// Route a hostname to an already-resolved address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PinnedHost {
    /// Hostname as it appears in the URL.
    pub host: String,
    /// Address to connect to instead of looking the host up again.
    pub addr: SocketAddr,
}

/// One part of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormPart {
    /// A plain text field.
    Text {
        /// Field name.
        name: String,
        /// Field value.
        value: String,
    },
    /// A file read from disk when the transfer starts.
    File {
        /// Field name.
        name: String,
        /// Local path.
        path: PathBuf,
        /// Filename announced to the server.
        file_name: String,
    },
}

/// Request body of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransferBody {
    /// No body.
    #[default]
    None,
    /// An explicit zero-length body.
    Empty,
    /// `application/x-www-form-urlencoded` fields, already encoded.
    Form(String),
    /// `multipart/form-data` parts.
    Multipart(Vec<FormPart>),
}

/// Everything a multiplexer needs to run one transfer.
#[derive(Debug, Clone)]
pub struct TransferSpec {
    /// HTTP method.
    pub method: HttpMethod,
    /// Absolute URL.
    pub url: String,
    /// Header lines in send order.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: TransferBody,
    /// Overall timeout. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Stall detection.
    pub low_speed: Option<LowSpeedLimit>,
    /// Emit [`TransferEvent::Progress`] after every chunk: uploaded file
    /// bytes for multipart uploads, response bytes otherwise.
    pub report_progress: bool,
    /// Cancellation checked at every progress point.
    pub cancel: CancelFlag,
    /// Pre-resolved address for the URL's host.
    pub pin: Option<PinnedHost>,
}

impl TransferSpec {
    /// A GET of `url` with no limits.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            body: TransferBody::None,
            timeout: None,
            low_speed: None,
            report_progress: false,
            cancel: CancelFlag::new(),
            pin: None,
        }
    }

    /// Value of the first header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Transfer progress information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferProgress {
    /// Bytes sent (uploads) or received so far.
    pub bytes_transferred: u64,
    /// Expected total, if the server announced it.
    pub total_bytes: Option<u64>,
    /// The transfer has finished.
    pub done: bool,
}

impl TransferProgress {
    /// Progress of a running transfer.
    pub fn new(bytes_transferred: u64, total_bytes: Option<u64>) -> Self {
        Self {
            bytes_transferred,
            total_bytes,
            done: false,
        }
    }

    /// Progress of a finished transfer.
    pub fn finished(bytes_transferred: u64) -> Self {
        Self {
            bytes_transferred,
            total_bytes: Some(bytes_transferred),
            done: true,
        }
    }

    /// Completion percentage.
    ///
    /// Capped at 99 while the transfer runs so that 100 is only reported once
    /// it has actually finished. `None` when the total is unknown.
    pub fn percent(&self) -> Option<u8> {
        if self.done {
            return Some(100);
        }
        let total = self.total_bytes.filter(|total| *total > 0)?;
        let percent = self.bytes_transferred.saturating_mul(100) / total;
        Some(percent.min(99) as u8)
    }
}

/// How a transfer that reached the server ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    /// HTTP status code.
    pub status: u16,
    /// URL after redirects.
    pub effective_url: String,
}

/// Something a transfer reported during `perform`.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A chunk of the response body.
    Data {
        /// Source transfer.
        id: TransferId,
        /// The bytes, in arrival order.
        chunk: Bytes,
    },
    /// Progress after a chunk, only for transfers that asked for it.
    Progress {
        /// Source transfer.
        id: TransferId,
        /// Progress so far.
        progress: TransferProgress,
    },
    /// The transfer finished; no more events follow for it.
    Done {
        /// Source transfer.
        id: TransferId,
        /// Response status or the transport failure.
        result: Result<Completed, TransportError>,
    },
}

impl TransferEvent {
    /// The transfer this event belongs to.
    pub fn id(&self) -> TransferId {
        match self {
            Self::Data { id, .. } | Self::Progress { id, .. } | Self::Done { id, .. } => *id,
        }
    }
}

/// A poll-driven engine running many transfers at once.
pub trait Multiplexer {
    /// Start a transfer. The transfer lives as long as the returned handle.
    fn add(&mut self, spec: TransferSpec) -> Result<TransferHandle, TransportError>;

    /// Advance every transfer without blocking and collect what happened.
    ///
    /// Events are returned in arrival order per transfer. Events of transfers
    /// whose handle was dropped may still appear and should be ignored.
    fn perform(&mut self) -> Vec<TransferEvent>;

    /// Number of transfers whose handle has not been released.
    fn live_transfers(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_drop_releases() {
        let mut registry = HandleRegistry::new();
        let first = registry.acquire();
        let second = registry.acquire();
        assert_ne!(first.id(), second.id());
        assert_eq!(registry.live(), 2);

        let first_id = first.id();
        drop(first);
        assert_eq!(registry.reap(), vec![first_id]);
        assert_eq!(registry.live(), 1);
        assert!(!registry.is_live(first_id));
        assert!(registry.is_live(second.id()));
    }

    #[test]
    fn test_progress_percent_capped() {
        assert_eq!(TransferProgress::new(50, Some(200)).percent(), Some(25));
        assert_eq!(TransferProgress::new(200, Some(200)).percent(), Some(99));
        assert_eq!(TransferProgress::new(10, None).percent(), None);
        assert_eq!(TransferProgress::new(10, Some(0)).percent(), None);
        assert_eq!(TransferProgress::finished(0).percent(), Some(100));
    }

    #[test]
    fn test_low_speed_window_keeps_fractions() {
        let limit = |window| LowSpeedLimit {
            bytes_per_sec: 100,
            window,
        };
        assert_eq!(limit(Duration::from_millis(500)).min_bytes_per_window(), 50);
        assert_eq!(limit(Duration::from_millis(1900)).min_bytes_per_window(), 190);
        assert_eq!(limit(Duration::from_secs(10)).min_bytes_per_window(), 1000);
    }

    #[test]
    fn test_cancel_flag_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_spec_header_lookup() {
        let mut spec = TransferSpec::get("https://chat.example/");
        spec.headers.push(("Authorization".into(), "Token t".into()));
        assert_eq!(spec.header("authorization"), Some("Token t"));
        assert_eq!(spec.header("Accept"), None);
    }
}
