//! In-process worker double for proxy, service and router tests.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;

use crate::bridge::protocol::{Message, Request};
use crate::health::{WorkerExit, WorkerState};
use crate::process::{ExitHandler, WorkerError, WorkerLink};

pub(crate) struct MockWorker {
    state: Mutex<WorkerState>,
    fail_writes: AtomicBool,
    written: mpsc::UnboundedSender<Request>,
    exit_hooks: Mutex<Vec<ExitHandler>>,
    exit: Mutex<Option<WorkerExit>>,
    stops: AtomicUsize,
}

impl MockWorker {
    /// A running worker plus the stream of requests written to its stdin.
    pub fn running() -> (Arc<Self>, mpsc::UnboundedReceiver<Request>) {
        let (written, rx) = mpsc::unbounded_channel();
        let worker = Arc::new(Self {
            state: Mutex::new(WorkerState::Running),
            fail_writes: AtomicBool::new(false),
            written,
            exit_hooks: Mutex::new(Vec::new()),
            exit: Mutex::new(None),
            stops: AtomicUsize::new(0),
        });
        (worker, rx)
    }

    pub fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Simulate process termination.
    pub fn exit(&self, exit: WorkerExit) {
        self.set_state(WorkerState::Exited(exit));
        *self.exit.lock().unwrap() = Some(exit);
        let hooks = std::mem::take(&mut *self.exit_hooks.lock().unwrap());
        for hook in hooks {
            hook(exit);
        }
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerLink for MockWorker {
    fn state(&self) -> WorkerState {
        *self.state.lock().unwrap()
    }

    async fn write(&self, request: Request) -> Result<(), WorkerError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin closed").into());
        }
        if !self.state().is_running() {
            return Err(WorkerError::WorkerDown);
        }
        let _ = self.written.send(request);
        Ok(())
    }

    fn on_exit(&self, handler: ExitHandler) {
        let exit = *self.exit.lock().unwrap();
        match exit {
            Some(exit) => handler(exit),
            None => self.exit_hooks.lock().unwrap().push(handler),
        }
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if !self.state().is_terminal() {
            self.exit(WorkerExit {
                code: None,
                signal: Some(15),
            });
        }
    }
}

pub(crate) fn message(json: &str) -> Message {
    Message::parse(Bytes::copy_from_slice(json.as_bytes())).unwrap()
}

/// A result response echoing the request's id.
pub(crate) fn reply(request: &Request, result: Value) -> Message {
    let json = serde_json::json!({
        "jsonrpc": "2.0",
        "id": request.id,
        "result": result,
    });
    message(&json.to_string())
}
