//! Correlation proxy - matches worker responses back to HTTP callers.
//!
//! Every dispatched request becomes a `PendingCall` in a DashMap keyed by
//! request id. The single stdout reader hands each framed message to
//! `on_framed_message`, which removes the matching entry and completes its
//! oneshot. Timeouts, worker exit and caller abandonment remove entries the
//! same way, so whichever happens first wins and a call is never resolved
//! twice.
//!
//! A per-call serial distinguishes a call from an earlier one that used the
//! same id; timers and guards only ever remove the entry they created.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::{Stream, StreamExt};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::bridge::protocol::{Message, Request, RequestId};
use crate::process::WorkerLink;

/// How a dispatched request ended.
#[derive(Debug)]
pub enum Outcome {
    /// The worker answered; the message is relayed as-is.
    Resolved(Message),
    TimedOut,
    WorkerDown,
    /// The caller's id is already in flight.
    DuplicateId,
}

struct PendingCall {
    serial: u64,
    created_at: Instant,
    completion: oneshot::Sender<Outcome>,
    timer: Option<AbortHandle>,
}

impl PendingCall {
    fn resolve(self, outcome: Outcome) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // Receiver gone means the caller already stopped waiting.
        let _ = self.completion.send(outcome);
    }
}

pub struct CorrelationProxy {
    worker: Arc<dyn WorkerLink>,
    pending: DashMap<RequestId, PendingCall>,
    next_serial: AtomicU64,
    /// Worker stdout hit EOF; no response can arrive any more.
    output_closed: AtomicBool,
}

impl CorrelationProxy {
    pub fn new(worker: Arc<dyn WorkerLink>) -> Self {
        Self {
            worker,
            pending: DashMap::new(),
            next_serial: AtomicU64::new(0),
            output_closed: AtomicBool::new(false),
        }
    }

    /// Send a request to the worker and return a handle to its outcome.
    ///
    /// Requests without an id get a generated one on the wire; the handle
    /// still reports the caller's original (absent) id.
    pub async fn dispatch(self: &Arc<Self>, mut request: Request, timeout: Duration) -> DispatchHandle {
        let caller_id = request.id.clone();

        let state = self.worker.state();
        if !state.is_running() {
            tracing::debug!(%state, method = %request.method, "Rejecting request, worker not running");
            return DispatchHandle::ready(caller_id, Outcome::WorkerDown);
        }
        if self.output_closed.load(Ordering::Acquire) {
            tracing::debug!(method = %request.method, "Rejecting request, worker stdout closed");
            return DispatchHandle::ready(caller_id, Outcome::WorkerDown);
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let call = PendingCall {
            serial,
            created_at: Instant::now(),
            completion: tx,
            timer: None,
        };

        let id = match caller_id.clone() {
            Some(id) => match self.pending.entry(id.clone()) {
                Entry::Occupied(_) => {
                    tracing::warn!(%id, "Rejecting request, id already pending");
                    return DispatchHandle::ready(caller_id, Outcome::DuplicateId);
                }
                Entry::Vacant(slot) => {
                    slot.insert(call);
                    id
                }
            },
            None => loop {
                let id = RequestId::generate();
                if let Entry::Vacant(slot) = self.pending.entry(id.clone()) {
                    slot.insert(call);
                    tracing::debug!(%id, "Assigned request id");
                    break id;
                }
            },
        };
        request.id = Some(id.clone());

        let guard = PendingGuard {
            call: Some((id.clone(), serial)),
            proxy: Arc::clone(self),
        };

        let timer = tokio::spawn(expire_after(Arc::downgrade(self), id.clone(), serial, timeout));
        if let Some(mut call) = self.pending.get_mut(&id)
            && call.serial == serial
        {
            call.timer = Some(timer.abort_handle());
        }

        tracing::debug!(%id, method = %request.method, "Dispatching request");
        if let Err(e) = self.worker.write(request).await {
            tracing::warn!(%id, error = %e, "Failed to write request to worker");
            self.complete(&id, serial, Outcome::WorkerDown);
        }

        DispatchHandle {
            id: caller_id,
            state: Dispatch::Pending { receiver: rx, guard },
        }
    }

    /// Route one message from the worker's stdout.
    pub fn on_framed_message(&self, message: Message) {
        if !message.is_response() {
            tracing::debug!(kind = ?message.kind(), "Ignoring non-response worker message");
            return;
        }
        let Some(id) = message.id().cloned() else {
            tracing::debug!(kind = ?message.kind(), "Ignoring worker response without id");
            return;
        };

        match self.pending.remove(&id) {
            Some((_, call)) => {
                tracing::debug!(
                    %id,
                    elapsed_ms = call.created_at.elapsed().as_millis() as u64,
                    "Request resolved"
                );
                call.resolve(Outcome::Resolved(message));
            }
            None => {
                tracing::debug!(%id, "Dropping response for unknown or expired request");
            }
        }
    }

    /// Resolve every pending call with `WorkerDown`.
    pub fn fail_all(&self) {
        let ids: Vec<RequestId> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        if ids.is_empty() {
            return;
        }

        tracing::warn!(count = ids.len(), "Failing pending requests, worker down");
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                call.resolve(Outcome::WorkerDown);
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Demultiplex the worker's framed stdout until it closes.
    ///
    /// Exactly one reader may run per worker.
    pub async fn run_reader<S>(self: Arc<Self>, mut messages: S)
    where
        S: Stream<Item = Result<Message, io::Error>> + Unpin,
    {
        while let Some(item) = messages.next().await {
            match item {
                Ok(message) => self.on_framed_message(message),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read worker stdout");
                    break;
                }
            }
        }

        tracing::info!("Worker stdout closed");
        self.output_closed.store(true, Ordering::Release);
        self.fail_all();
    }

    fn complete(&self, id: &RequestId, serial: u64, outcome: Outcome) {
        if let Some((_, call)) = self.pending.remove_if(id, |_, call| call.serial == serial) {
            call.resolve(outcome);
        }
    }

    fn expire(&self, id: &RequestId, serial: u64) {
        if let Some((_, mut call)) = self.pending.remove_if(id, |_, call| call.serial == serial) {
            tracing::warn!(
                %id,
                elapsed_ms = call.created_at.elapsed().as_millis() as u64,
                "Request timed out"
            );
            // Running on the timer task itself.
            call.timer = None;
            call.resolve(Outcome::TimedOut);
        }
    }

    fn abandon(&self, id: &RequestId, serial: u64) {
        if let Some((_, call)) = self.pending.remove_if(id, |_, call| call.serial == serial) {
            tracing::debug!(%id, "Caller went away, dropping pending request");
            if let Some(timer) = call.timer {
                timer.abort();
            }
        }
    }
}

async fn expire_after(proxy: Weak<CorrelationProxy>, id: RequestId, serial: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    if let Some(proxy) = proxy.upgrade() {
        proxy.expire(&id, serial);
    }
}

/// Removes the pending call if its handle is dropped before resolving.
struct PendingGuard {
    call: Option<(RequestId, u64)>,
    proxy: Arc<CorrelationProxy>,
}

impl PendingGuard {
    fn disarm(&mut self) {
        self.call = None;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Some((id, serial)) = self.call.take() {
            self.proxy.abandon(&id, serial);
        }
    }
}

enum Dispatch {
    Ready(Outcome),
    Pending {
        receiver: oneshot::Receiver<Outcome>,
        guard: PendingGuard,
    },
}

/// Handle to a dispatched request.
///
/// Dropping it before `outcome()` completes forgets the request.
pub struct DispatchHandle {
    id: Option<RequestId>,
    state: Dispatch,
}

impl DispatchHandle {
    fn ready(id: Option<RequestId>, outcome: Outcome) -> Self {
        Self {
            id,
            state: Dispatch::Ready(outcome),
        }
    }

    /// The id the caller supplied, if any.
    pub fn id(&self) -> Option<&RequestId> {
        self.id.as_ref()
    }

    pub async fn outcome(self) -> Outcome {
        match self.state {
            Dispatch::Ready(outcome) => outcome,
            Dispatch::Pending { receiver, mut guard } => {
                let outcome = receiver.await.unwrap_or(Outcome::WorkerDown);
                guard.disarm();
                outcome
            }
        }
    }
}
