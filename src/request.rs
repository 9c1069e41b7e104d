//! # Request Module
//!
//! Every posted operation — send, synchronous send, receive, collective —
//! is tracked by a request. The engine side holds a [`RequestCell`]; the
//! caller holds a [`RequestHandle`] sharing the same cell. Completion is
//! signalled through a notify so any number of waiters can block on it.
//!
//! Status advances monotonically:
//!
//! ```text
//! New ──▶ Ready ──▶ Finished
//!  └──────▶ Cancelled
//! ```
//!
//! `Finished` and `Cancelled` are terminal; once reached, status never
//! changes again. Cancellation is idempotent and purely local: a cancelled
//! send may still put its bytes on the wire, and a cancelled receive's
//! eventual match is discarded by the dispatcher.

use crate::error::MpiError;
use crate::serializer::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

/// Monotonically increasing request identifier, unique per engine.
pub type RequestId = u64;

/// What kind of operation a request tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Send,
    SyncSend,
    Recv,
    Collective,
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    New,
    Ready,
    Finished,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Finished | RequestStatus::Cancelled)
    }
}

#[derive(Debug)]
struct CellState {
    status: RequestStatus,
    payload: Option<Value>,
}

/// Shared completion state of one request.
#[derive(Debug)]
pub(crate) struct RequestCell {
    state: Mutex<CellState>,
    complete: Notify,
}

impl RequestCell {
    pub fn new() -> Self {
        RequestCell {
            state: Mutex::new(CellState {
                status: RequestStatus::New,
                payload: None,
            }),
            complete: Notify::new(),
        }
    }

    /// Pre-completed cell, used for buffered sends that finish at posting
    /// time.
    pub fn ready(payload: Option<Value>) -> Self {
        RequestCell {
            state: Mutex::new(CellState {
                status: RequestStatus::Ready,
                payload,
            }),
            complete: Notify::new(),
        }
    }

    /// Attach the payload and advance to `Ready`. No-op once terminal or
    /// cancelled.
    pub fn mark_ready(&self, payload: Option<Value>) {
        {
            let mut state = self.state.lock();
            if state.status != RequestStatus::New {
                return;
            }
            state.status = RequestStatus::Ready;
            state.payload = payload;
        }
        self.complete.notify_waiters();
    }

    /// Cancel the request. Idempotent; returns whether this call performed
    /// the transition.
    pub fn cancel(&self) -> bool {
        let transitioned = {
            let mut state = self.state.lock();
            if state.status.is_terminal() || state.status == RequestStatus::Ready {
                false
            } else {
                state.status = RequestStatus::Cancelled;
                true
            }
        };
        if transitioned {
            self.complete.notify_waiters();
        }
        transitioned
    }

    pub fn status(&self) -> RequestStatus {
        self.state.lock().status
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == RequestStatus::Cancelled
    }

    /// Wait until the cell leaves `New`, then return its payload.
    pub async fn wait(&self) -> Result<Value, MpiError> {
        loop {
            // Register interest before inspecting state so a completion
            // racing with this check cannot be missed.
            let mut notified = std::pin::pin!(self.complete.notified());
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                match state.status {
                    RequestStatus::Ready | RequestStatus::Finished => {
                        state.status = RequestStatus::Finished;
                        return Ok(state.payload.clone().unwrap_or(Value::None));
                    }
                    RequestStatus::Cancelled => return Err(MpiError::Cancelled),
                    RequestStatus::New => {}
                }
            }
            notified.await;
        }
    }

    /// Non-blocking completion check.
    pub fn test(&self) -> bool {
        matches!(
            self.status(),
            RequestStatus::Ready | RequestStatus::Finished
        )
    }
}

/// Caller-side handle to a posted operation.
#[derive(Clone)]
pub struct RequestHandle {
    pub(crate) id: RequestId,
    pub(crate) kind: RequestKind,
    pub(crate) cell: Arc<RequestCell>,
    pub(crate) engine: Arc<crate::engine::EngineShared>,
}

impl RequestHandle {
    /// Identifier of the underlying request.
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Block until the request completes. Receives resolve to the received
    /// payload; sends and collectives without local data resolve to
    /// [`Value::None`]. Fails with [`MpiError::Cancelled`] if the request
    /// was cancelled.
    pub async fn wait(&self) -> Result<Value, MpiError> {
        self.cell.wait().await
    }

    /// Non-blocking check whether `wait` would return immediately with a
    /// value.
    pub fn test(&self) -> bool {
        self.cell.test()
    }

    /// Cancel the request locally. Safe to call repeatedly.
    pub fn cancel(&self) {
        if self.cell.cancel() {
            // Let the dispatcher drop any queued matcher entries.
            let _ = self.engine.post(crate::engine::Event::Cancel(self.id));
        }
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.cell.status())
            .finish()
    }
}

/// Wait until any request in the list completes; returns its index and
/// payload. The completed handle stays in the list — removal is the
/// caller's responsibility.
pub async fn waitany(requests: &[RequestHandle]) -> Result<(usize, Value), MpiError> {
    if requests.is_empty() {
        return Err(MpiError::Mpi("waitany on an empty request list".into()));
    }
    let futures: Vec<_> = requests.iter().map(|r| Box::pin(r.wait())).collect();
    let (result, index, _) = futures::future::select_all(futures).await;
    result.map(|value| (index, value))
}

/// Wait until every request in the list completes; returns the payloads in
/// list order.
pub async fn waitall(requests: &[RequestHandle]) -> Result<Vec<Value>, MpiError> {
    futures::future::try_join_all(requests.iter().map(|r| r.wait())).await
}

/// Non-blocking: index of the first completed request, if any.
pub fn testany(requests: &[RequestHandle]) -> Option<usize> {
    requests.iter().position(|r| r.test())
}

/// Non-blocking: whether every request has completed.
pub fn testall(requests: &[RequestHandle]) -> bool {
    requests.iter().all(|r| r.test())
}

/// Dispatcher-owned table of outstanding requests.
#[derive(Default)]
pub(crate) struct RequestTable {
    entries: HashMap<RequestId, Arc<RequestCell>>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: RequestId, cell: Arc<RequestCell>) {
        self.entries.insert(id, cell);
    }

    /// Complete a request and drop it from the table.
    pub fn mark_ready(&mut self, id: RequestId, payload: Option<Value>) {
        if let Some(cell) = self.entries.remove(&id) {
            cell.mark_ready(payload);
        }
    }

    /// Cancel a request and drop it from the table. Idempotent.
    pub fn cancel(&mut self, id: RequestId) {
        if let Some(cell) = self.entries.remove(&id) {
            cell.cancel();
        }
    }

    pub fn remove(&mut self, id: RequestId) -> Option<Arc<RequestCell>> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Current `(id, status)` pairs, unordered.
    pub fn snapshot(&self) -> Vec<(RequestId, RequestStatus)> {
        self.entries
            .iter()
            .map(|(id, cell)| (*id, cell.status()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_payload() {
        let cell = Arc::new(RequestCell::new());
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait().await })
        };
        cell.mark_ready(Some(Value::Int(7)));
        assert_eq!(waiter.await.unwrap().unwrap(), Value::Int(7));
        assert_eq!(cell.status(), RequestStatus::Finished);
    }

    #[tokio::test]
    async fn test_wait_on_cancelled_fails() {
        let cell = RequestCell::new();
        assert!(cell.cancel());
        assert!(!cell.cancel()); // idempotent
        assert!(matches!(cell.wait().await, Err(MpiError::Cancelled)));
    }

    #[tokio::test]
    async fn test_ready_is_not_cancellable() {
        let cell = RequestCell::new();
        cell.mark_ready(Some(Value::Int(1)));
        assert!(!cell.cancel());
        assert_eq!(cell.wait().await.unwrap(), Value::Int(1));
    }

    #[test]
    fn test_table_lifecycle() {
        let mut table = RequestTable::new();
        let cell = Arc::new(RequestCell::new());
        table.insert(1, cell.clone());
        assert_eq!(table.len(), 1);
        assert_eq!(table.snapshot(), vec![(1, RequestStatus::New)]);

        table.mark_ready(1, Some(Value::Int(3)));
        assert_eq!(table.len(), 0);
        assert!(cell.test());

        // Cancelling an unknown id is a no-op.
        table.cancel(99);
    }
}
