//! Child-process stdio transport.
//!
//! Spawns the configured command with merged environment, pipes stdio,
//! and speaks newline-delimited JSON on stdin/stdout. Child stderr and
//! any non-JSON stdout lines are diagnostic output, surfaced at debug
//! level and never parsed as messages.
//!
//! Lock discipline follows the hybrid pattern: `parking_lot` for state
//! and channel slots (short-lived, never across `.await`), `tokio::sync`
//! for the child handle (held across `.await` during shutdown), atomics
//! for counters.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, Mutex as TokioMutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use deechat_mcp_config::{ServerConfig, TransportKind};
use deechat_mcp_protocol::JsonRpcMessage;

use crate::core::{
    route_inbound, AtomicStats, StatusCell, Transport, TransportCapabilities, TransportError,
    TransportEvent, TransportEvents, TransportResult, TransportState, TransportStats,
};
use crate::correlation::RequestTracker;
use crate::retry::RetryPolicy;

/// How long a child gets to exit after the graceful signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Configuration for the stdio transport
#[derive(Debug, Clone)]
pub struct StdioConfig {
    /// Command to execute
    pub command: String,
    /// Arguments to pass to the command
    pub args: Vec<String>,
    /// Working directory for the process
    pub working_directory: Option<String>,
    /// Environment variables merged over the inherited environment
    pub env: Vec<(String, String)>,
}

impl From<&ServerConfig> for StdioConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            command: config.command.clone().unwrap_or_default(),
            args: config.args.clone(),
            working_directory: config.working_directory.clone(),
            env: config.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }
}

struct StdioInner {
    config: StdioConfig,
    status: StatusCell,
    events: TransportEvents,
    capabilities: TransportCapabilities,
    tracker: RequestTracker,
    stats: AtomicStats,
    timeout: Mutex<Duration>,
    child: TokioMutex<Option<Child>>,
    stdin_tx: Mutex<Option<mpsc::Sender<String>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// Stdio transport over a spawned child process
#[derive(Clone)]
pub struct StdioTransport {
    inner: Arc<StdioInner>,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("command", &self.inner.config.command)
            .field("state", &self.inner.status.get())
            .finish()
    }
}

impl StdioTransport {
    /// Create a transport for the given launch configuration
    pub fn new(config: StdioConfig) -> Self {
        let events = TransportEvents::new();
        Self {
            inner: Arc::new(StdioInner {
                config,
                status: StatusCell::new(events.clone()),
                events,
                capabilities: TransportCapabilities {
                    streaming: false,
                    notifications: true,
                    sessions: false,
                    reconnect: false,
                },
                tracker: RequestTracker::new(),
                stats: AtomicStats::default(),
                timeout: Mutex::new(Duration::from_secs(30)),
                child: TokioMutex::new(None),
                stdin_tx: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Pid of the running child, if any
    pub async fn process_id(&self) -> Option<u32> {
        self.inner.child.lock().await.as_ref().and_then(Child::id)
    }

    /// Whether the child is still running
    pub async fn is_process_alive(&self) -> bool {
        let mut child = self.inner.child.lock().await;
        match child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn start_process(&self) -> TransportResult<()> {
        let inner = &self.inner;
        if inner.config.command.is_empty() {
            return Err(TransportError::ConfigurationError(
                "command cannot be empty".to_string(),
            ));
        }

        info!(
            command = %inner.config.command,
            args = ?inner.config.args,
            "starting MCP server process"
        );

        let mut cmd = Command::new(&inner.config.command);
        cmd.args(&inner.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = inner.config.working_directory {
            cmd.current_dir(dir);
        }
        for (key, value) in &inner.config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "failed to spawn '{}': {e}",
                inner.config.command
            ))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::ConnectionFailed("failed to capture child stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::ConnectionFailed("failed to capture child stdout".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            TransportError::ConnectionFailed("failed to capture child stderr".to_string())
        })?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(100);

        // Commit the connected state before the reader task can observe
        // an immediate child exit and move the state on.
        *inner.child.lock().await = Some(child);
        *inner.stdin_tx.lock() = Some(stdin_tx);
        inner.status.set(TransportState::Connected);
        inner.stats.mark_connected();
        inner.events.emit(TransportEvent::Connected);

        // Single producer onto the child's stdin.
        let writer_task = tokio::spawn(async move {
            let mut writer = BufWriter::new(stdin);
            while let Some(line) = stdin_rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                    || writer.flush().await.is_err()
                {
                    error!("failed to write to child stdin");
                    break;
                }
            }
            debug!("stdin writer task completed");
        });

        // Single consumer of the child's stdout; owns inbound routing.
        let reader_task = {
            let transport = self.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    route_inbound(
                        &line,
                        &transport.inner.tracker,
                        &transport.inner.events,
                        &transport.inner.stats,
                    );
                }
                transport.handle_child_exit().await;
            })
        };

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "deechat_mcp_transport::child_stderr", "{line}");
            }
        });

        {
            let mut tasks = inner.tasks.lock();
            tasks.push(writer_task);
            tasks.push(reader_task);
            tasks.push(stderr_task);
        }
        Ok(())
    }

    /// Stdout closed: either we are tearing down, or the child died.
    async fn handle_child_exit(&self) {
        let inner = &self.inner;
        if matches!(
            inner.status.get(),
            TransportState::Disconnecting | TransportState::Disconnected
        ) {
            return;
        }

        let exit = inner
            .child
            .lock()
            .await
            .as_mut()
            .and_then(|c| c.try_wait().ok().flatten());
        let reason = match exit {
            Some(status) => format!("server process exited: {status}"),
            None => "server process closed stdout".to_string(),
        };
        warn!(reason = %reason, "MCP server process ended unexpectedly");

        inner.stats.record_error();
        inner.tracker.cancel_all("transport disconnected");
        *inner.stdin_tx.lock() = None;
        inner.events.emit(TransportEvent::Error {
            error: TransportError::ConnectionLost(reason.clone()),
        });
        inner.status.set(TransportState::Disconnected);
        inner.events.emit(TransportEvent::Disconnected {
            reason: Some(reason),
        });
    }

    async fn stop_process(&self) -> TransportResult<()> {
        let inner = &self.inner;
        inner.tracker.cancel_all("transport disconnected");
        *inner.stdin_tx.lock() = None;

        if let Some(mut child) = inner.child.lock().await.take() {
            terminate_gracefully(&mut child).await;
        }

        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }

        inner.status.set(TransportState::Disconnected);
        inner.events.emit(TransportEvent::Disconnected {
            reason: Some("transport closed".to_string()),
        });
        Ok(())
    }
}

/// Ask the child to exit, escalating to a hard kill after the grace
/// period. On Unix the graceful signal is SIGTERM.
async fn terminate_gracefully(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
        match timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                info!(%status, "server process exited");
                return;
            }
            Ok(Err(e)) => warn!(error = %e, "failed waiting for server process"),
            Err(_) => warn!("server process ignored SIGTERM, killing"),
        }
    }

    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill server process");
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn transport_type(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn capabilities(&self) -> &TransportCapabilities {
        &self.inner.capabilities
    }

    fn state(&self) -> TransportState {
        self.inner.status.get()
    }

    async fn connect(&self) -> TransportResult<()> {
        match self.inner.status.get() {
            TransportState::Connected => return Ok(()),
            TransportState::Connecting | TransportState::Disconnecting => {
                return Err(TransportError::Internal(
                    "connect while a transition is in flight".to_string(),
                ));
            }
            TransportState::Failed { reason } => {
                return Err(TransportError::Internal(format!(
                    "transport is in error state ({reason}); disconnect first"
                )));
            }
            TransportState::Disconnected => {}
        }

        self.inner.status.set(TransportState::Connecting);
        match self.start_process().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.stats.record_error();
                self.inner.status.set(TransportState::Failed {
                    reason: e.to_string(),
                });
                self.inner
                    .events
                    .emit(TransportEvent::Error { error: e.clone() });
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.inner.status.set(TransportState::Disconnecting);
        self.stop_process().await
    }

    async fn send(&self, message: &JsonRpcMessage) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::SendFailed(format!(
                "cannot send in state: {}",
                self.state()
            )));
        }

        let line = serde_json::to_string(message)
            .map_err(|e| TransportError::SerializationFailed(e.to_string()))?;
        let sender = self
            .inner
            .stdin_tx
            .lock()
            .clone()
            .ok_or_else(|| TransportError::ConnectionLost("stdin channel closed".to_string()))?;

        let bytes = line.len();
        // A full channel simply awaits drain here; that is the stdio
        // backpressure contract.
        sender
            .send(line)
            .await
            .map_err(|_| TransportError::ConnectionLost("stdin channel closed".to_string()))?;
        self.inner.stats.record_sent(bytes);
        Ok(())
    }

    fn tracker(&self) -> &RequestTracker {
        &self.inner.tracker
    }

    fn request_timeout(&self) -> Duration {
        *self.inner.timeout.lock()
    }

    fn set_timeout(&self, timeout: Duration) {
        *self.inner.timeout.lock() = timeout;
    }

    fn set_retry_policy(&self, _policy: RetryPolicy) {
        // Stdio advertises reconnect=false; the orchestrator owns retries.
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    fn stats(&self) -> TransportStats {
        self.inner.stats.snapshot()
    }

    fn endpoint(&self) -> Option<String> {
        Some(format!(
            "{} {}",
            self.inner.config.command,
            self.inner.config.args.join(" ")
        ))
    }
}
