//! A deterministic in-memory multiplexer.
//!
//! [`ScriptedMultiplexer`] never touches the network. Every added transfer is
//! recorded, and its outcome is whatever the test scripts through a cloned
//! handle of the same multiplexer: data chunks, a completion status, or a
//! transport error. Scripted events are delivered on the next `perform`.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::{
    Completed, HandleRegistry, Multiplexer, TransferEvent, TransferHandle, TransferId,
    TransferProgress, TransferSpec,
};
use crate::error::TransportError;

/// A transfer as it was handed to the multiplexer.
#[derive(Debug, Clone)]
pub struct ScriptedTransfer {
    /// Identifier issued on `add`.
    pub id: TransferId,
    /// The transfer description the service built.
    pub spec: TransferSpec,
}

#[derive(Debug, Default)]
struct Inner {
    registry: HandleRegistry,
    history: Vec<ScriptedTransfer>,
    received: std::collections::HashMap<TransferId, u64>,
    queued: Vec<TransferEvent>,
    refuse_next: Option<TransportError>,
    perform_calls: usize,
}

impl Inner {
    fn spec(&self, id: TransferId) -> Option<&TransferSpec> {
        self.history.iter().find(|t| t.id == id).map(|t| &t.spec)
    }
}

/// Multiplexer whose transfers are driven by the test.
///
/// Clones share state, so a test keeps one clone and hands the other to the
/// service.
#[derive(Debug, Clone, Default)]
pub struct ScriptedMultiplexer {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedMultiplexer {
    /// Create an empty multiplexer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transfer ever added, oldest first.
    pub fn transfers(&self) -> Vec<ScriptedTransfer> {
        self.inner.lock().history.clone()
    }

    /// Transfers whose handle is still held.
    pub fn live(&self) -> Vec<ScriptedTransfer> {
        let mut inner = self.inner.lock();
        inner.registry.reap();
        let live: Vec<ScriptedTransfer> = inner
            .history
            .iter()
            .filter(|t| inner.registry.is_live(t.id))
            .cloned()
            .collect();
        live
    }

    /// The most recent transfer whose URL contains `fragment`.
    pub fn last_to(&self, fragment: &str) -> Option<ScriptedTransfer> {
        self.inner
            .lock()
            .history
            .iter()
            .rev()
            .find(|t| t.spec.url.contains(fragment))
            .cloned()
    }

    /// Number of transfers added so far.
    pub fn added(&self) -> usize {
        self.inner.lock().history.len()
    }

    /// Number of `perform` calls so far.
    pub fn perform_calls(&self) -> usize {
        self.inner.lock().perform_calls
    }

    /// Deliver a body chunk for `id`.
    pub fn push_data(&self, id: TransferId, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        let mut inner = self.inner.lock();
        let received = inner.received.entry(id).or_default();
        *received += chunk.len() as u64;
        let received = *received;

        inner.queued.push(TransferEvent::Data { id, chunk });
        if inner.spec(id).is_some_and(|spec| spec.report_progress) {
            inner.queued.push(TransferEvent::Progress {
                id,
                progress: TransferProgress::new(received, None),
            });
        }
    }

    /// Finish `id` with an HTTP status.
    pub fn complete(&self, id: TransferId, status: u16) {
        let mut inner = self.inner.lock();
        let effective_url = inner
            .spec(id)
            .map(|spec| spec.url.clone())
            .unwrap_or_default();
        inner.queued.push(TransferEvent::Done {
            id,
            result: Ok(Completed {
                status,
                effective_url,
            }),
        });
    }

    /// Deliver `body` and finish `id` with `status`.
    pub fn respond(&self, id: TransferId, status: u16, body: impl Into<Bytes>) {
        let body = body.into();
        if !body.is_empty() {
            self.push_data(id, body);
        }
        self.complete(id, status);
    }

    /// Finish `id` with a transport error.
    pub fn fail(&self, id: TransferId, error: TransportError) {
        self.inner.lock().queued.push(TransferEvent::Done {
            id,
            result: Err(error),
        });
    }

    /// Make the next `add` fail with `error`.
    pub fn refuse_next(&self, error: TransportError) {
        self.inner.lock().refuse_next = Some(error);
    }
}

impl Multiplexer for ScriptedMultiplexer {
    fn add(&mut self, spec: TransferSpec) -> Result<TransferHandle, TransportError> {
        let mut inner = self.inner.lock();
        if let Some(error) = inner.refuse_next.take() {
            return Err(error);
        }
        let handle = inner.registry.acquire();
        inner.history.push(ScriptedTransfer {
            id: handle.id(),
            spec,
        });
        Ok(handle)
    }

    fn perform(&mut self) -> Vec<TransferEvent> {
        let mut inner = self.inner.lock();
        inner.perform_calls += 1;
        inner.registry.reap();
        std::mem::take(&mut inner.queued)
    }

    fn live_transfers(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.registry.reap();
        inner.registry.live()
    }
}
