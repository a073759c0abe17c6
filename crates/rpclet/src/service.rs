//! BridgeService: transport-agnostic request handling.
//!
//! This service owns:
//! - The worker link (liveness, stdin, stop)
//! - The correlation proxy and its single stdout reader
//! - The default per-request timeout
//! - Shutdown coordination
//!
//! Transports hand requests to `dispatch()` and render the resulting `Outcome`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::codec::FramedRead;

use crate::bridge::codec::JsonRpcCodec;
use crate::bridge::protocol::Request;
use crate::health::WorkerState;
use crate::process::{ProcessSupervisor, SpawnError, WorkerConfig, WorkerLink, WorkerSpawner};
use crate::proxy::{CorrelationProxy, DispatchHandle};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct BridgeService {
    proxy: Arc<CorrelationProxy>,
    worker: Arc<dyn WorkerLink>,
    request_timeout: Duration,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl BridgeService {
    /// Wrap an already running worker. The caller is responsible for feeding
    /// the worker's stdout to `proxy().run_reader()`.
    pub fn new(worker: Arc<dyn WorkerLink>) -> Self {
        let proxy = Arc::new(CorrelationProxy::new(Arc::clone(&worker)));

        let weak = Arc::downgrade(&proxy);
        worker.on_exit(Box::new(move |exit| {
            if let Some(proxy) = weak.upgrade() {
                tracing::warn!(%exit, "Worker exited, failing in-flight requests");
                proxy.fail_all();
            }
        }));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            proxy,
            worker,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Spawn the worker and start demultiplexing its stdout.
    pub fn launch(config: &WorkerConfig, spawner: &dyn WorkerSpawner) -> Result<Self, SpawnError> {
        let (supervisor, stdout) = ProcessSupervisor::start(config, spawner)?;
        let service = Self::new(supervisor);

        let messages = FramedRead::new(stdout, JsonRpcCodec::new());
        tokio::spawn(Arc::clone(&service.proxy).run_reader(messages));

        Ok(service)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn proxy(&self) -> &Arc<CorrelationProxy> {
        &self.proxy
    }

    pub fn worker(&self) -> &Arc<dyn WorkerLink> {
        &self.worker
    }

    pub fn worker_state(&self) -> WorkerState {
        self.worker.state()
    }

    /// Dispatch with the default timeout.
    pub async fn dispatch(&self, request: Request) -> DispatchHandle {
        self.proxy.dispatch(request, self.request_timeout).await
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Stop the worker and wait for it to exit.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down worker");
        self.worker.stop().await;
    }
}
