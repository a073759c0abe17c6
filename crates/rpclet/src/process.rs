//! Process supervisor - owns the worker subprocess.
//!
//! Flow:
//! 1. Spawn worker with piped stdio and the forwarded configuration
//! 2. Hand stdout to the caller (exactly one framer reads it)
//! 3. Drain stderr into tracing
//! 4. Monitor the child until it exits or `stop()` is requested
//! 5. On exit: record status, close stdin, fire exit hooks exactly once

use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{Mutex, watch};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonRpcCodec;
use crate::bridge::protocol::Request;
use crate::health::{WorkerExit, WorkerState};

/// How long `stop()` waits after SIGTERM before killing the worker.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Worker launch configuration.
///
/// The tool settings are opaque to rpclet: they are passed through to the
/// worker's environment exactly as given, and omitted when unset.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub max_content_length: Option<String>,
    pub default_timeout: Option<String>,
    pub max_browsers: Option<String>,
    pub browser_headless: Option<String>,
    pub enable_relevance_checking: Option<String>,
    pub relevance_threshold: Option<String>,
    pub browsers_path: Option<String>,
}

impl WorkerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Environment variables forwarded to the worker.
    pub fn env(&self) -> Vec<(&'static str, &str)> {
        [
            ("MAX_CONTENT_LENGTH", &self.max_content_length),
            ("DEFAULT_TIMEOUT", &self.default_timeout),
            ("MAX_BROWSERS", &self.max_browsers),
            ("BROWSER_HEADLESS", &self.browser_headless),
            ("ENABLE_RELEVANCE_CHECKING", &self.enable_relevance_checking),
            ("RELEVANCE_THRESHOLD", &self.relevance_threshold),
            ("PLAYWRIGHT_BROWSERS_PATH", &self.browsers_path),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_deref().map(|v| (key, v)))
        .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("worker {0} not captured")]
    Pipe(&'static str),
}

/// Extension point for different worker spawn strategies.
///
/// Implementations must pipe stdin and stdout; stderr is drained if piped.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &WorkerConfig) -> Result<Child, SpawnError>;
}

/// Spawns `config.command` directly.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, config: &WorkerConfig) -> Result<Child, SpawnError> {
        let child = Command::new(&config.command)
            .args(&config.args)
            .envs(config.env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker is not running")]
    WorkerDown,
    #[error("failed to write to worker: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExitHandler = Box<dyn FnOnce(WorkerExit) + Send>;

/// What the proxy and the service need from a worker.
///
/// This abstraction lets the correlation and HTTP layers be tested without
/// a real subprocess.
#[async_trait]
pub trait WorkerLink: Send + Sync {
    fn state(&self) -> WorkerState;

    /// Write one framed request. Concurrent writes never interleave.
    async fn write(&self, request: Request) -> Result<(), WorkerError>;

    /// Register a callback for process termination. Called exactly once;
    /// immediately if the worker has already exited.
    fn on_exit(&self, handler: ExitHandler);

    /// Request graceful termination and wait for it. Idempotent.
    async fn stop(&self);
}

type WorkerStdin = FramedWrite<Pin<Box<dyn AsyncWrite + Send>>, JsonRpcCodec>;

enum ExitHooks {
    Pending(Vec<ExitHandler>),
    Fired(WorkerExit),
}

/// Owner of the single worker subprocess.
pub struct ProcessSupervisor {
    pid: Option<u32>,
    state_tx: watch::Sender<WorkerState>,
    stdin: Mutex<Option<WorkerStdin>>,
    exit_hooks: StdMutex<ExitHooks>,
    stop_token: CancellationToken,
}

impl ProcessSupervisor {
    /// Spawn the worker. Returns the supervisor and the worker's stdout,
    /// which the caller must hand to exactly one reader.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: &WorkerConfig,
        spawner: &dyn WorkerSpawner,
    ) -> Result<(Arc<Self>, ChildStdout), SpawnError> {
        tracing::info!(
            command = %config.command,
            args = ?config.args,
            forwarded = ?config.env().iter().map(|(k, _)| *k).collect::<Vec<_>>(),
            "Spawning worker subprocess"
        );

        let mut child = spawner.spawn(config).inspect_err(|e| {
            tracing::error!(error = %e, "Worker spawn failed");
        })?;

        let stdin = child.stdin.take().ok_or(SpawnError::Pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::Pipe("stdout"))?;
        let stderr = child.stderr.take();
        let pid = child.id();

        let stdin: Pin<Box<dyn AsyncWrite + Send>> = Box::pin(stdin);
        let (state_tx, _) = watch::channel(WorkerState::Starting);
        let supervisor = Arc::new(Self {
            pid,
            state_tx,
            stdin: Mutex::new(Some(FramedWrite::new(stdin, JsonRpcCodec::new()))),
            exit_hooks: StdMutex::new(ExitHooks::Pending(Vec::new())),
            stop_token: CancellationToken::new(),
        });

        if let Some(stderr) = stderr {
            tokio::spawn(drain_diagnostics(stderr));
        }

        supervisor.state_tx.send_replace(WorkerState::Running);
        tracing::info!(pid, "Worker running");

        tokio::spawn(Arc::clone(&supervisor).monitor(child));

        Ok((supervisor, stdout))
    }

    pub fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    pub async fn write(&self, request: Request) -> Result<(), WorkerError> {
        if !self.state().is_running() {
            return Err(WorkerError::WorkerDown);
        }

        let send = async {
            let mut stdin = self.stdin.lock().await;
            let writer = stdin.as_mut().ok_or(WorkerError::WorkerDown)?;
            writer.send(request).await?;
            Ok::<(), WorkerError>(())
        };

        // A worker that stopped reading fills the pipe; stop() must still get the lock.
        tokio::select! {
            result = send => result,
            _ = self.stop_token.cancelled() => Err(WorkerError::WorkerDown),
        }
    }

    pub fn on_exit(&self, handler: impl FnOnce(WorkerExit) + Send + 'static) {
        let exit = {
            let mut hooks = lock(&self.exit_hooks);
            match &mut *hooks {
                ExitHooks::Pending(handlers) => {
                    handlers.push(Box::new(handler));
                    return;
                }
                ExitHooks::Fired(exit) => *exit,
            }
        };
        handler(exit);
    }

    pub async fn stop(&self) {
        if !self.stop_token.is_cancelled() && !self.state().is_terminal() {
            tracing::info!(pid = self.pid, "Stopping worker");
        }
        self.stop_token.cancel();

        let mut state_rx = self.subscribe();
        let _ = state_rx.wait_for(WorkerState::is_terminal).await;
    }

    async fn monitor(self: Arc<Self>, mut child: Child) {
        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = self.stop_token.cancelled() => None,
        };

        let status = match exited {
            Some(status) => status,
            None => {
                // Closing stdin is the polite shutdown for stdio servers.
                self.stdin.lock().await.take();
                terminate(&child);
                match tokio::time::timeout(STOP_GRACE_PERIOD, child.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        tracing::warn!(
                            grace_secs = STOP_GRACE_PERIOD.as_secs(),
                            "Worker did not exit within grace period, killing"
                        );
                        if let Err(e) = child.start_kill() {
                            tracing::error!(error = %e, "Failed to kill worker");
                        }
                        child.wait().await
                    }
                }
            }
        };

        self.stdin.lock().await.take();

        let (state, exit) = match status {
            Ok(status) => {
                let exit = WorkerExit::from(status);
                (WorkerState::Exited(exit), exit)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to wait for worker");
                (WorkerState::Failed, WorkerExit::default())
            }
        };

        if self.stop_token.is_cancelled() {
            tracing::info!(pid = self.pid, %exit, "Worker stopped");
        } else {
            tracing::error!(
                pid = self.pid,
                code = exit.code,
                signal = exit.signal,
                "Worker exited unexpectedly"
            );
        }

        self.finish(state, exit);
    }

    fn finish(&self, state: WorkerState, exit: WorkerExit) {
        self.state_tx.send_replace(state);

        let handlers = {
            let mut hooks = lock(&self.exit_hooks);
            match std::mem::replace(&mut *hooks, ExitHooks::Fired(exit)) {
                ExitHooks::Pending(handlers) => handlers,
                ExitHooks::Fired(_) => Vec::new(),
            }
        };
        for handler in handlers {
            handler(exit);
        }
    }
}

#[async_trait]
impl WorkerLink for ProcessSupervisor {
    fn state(&self) -> WorkerState {
        ProcessSupervisor::state(self)
    }

    async fn write(&self, request: Request) -> Result<(), WorkerError> {
        ProcessSupervisor::write(self, request).await
    }

    fn on_exit(&self, handler: ExitHandler) {
        ProcessSupervisor::on_exit(self, handler)
    }

    async fn stop(&self) {
        ProcessSupervisor::stop(self).await
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(unix)]
fn terminate(child: &Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!(pid, error = %e, "Failed to send SIGTERM to worker");
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}

/// Re-emit worker stderr as log lines. Never parsed.
async fn drain_diagnostics<R: AsyncRead + Unpin>(stderr: R) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if !text.is_empty() {
                    tracing::info!(target: "rpclet::worker", "{}", text);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read worker stderr");
                break;
            }
        }
    }
    tracing::debug!("Worker stderr closed");
}
