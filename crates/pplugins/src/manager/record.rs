//! Plugin Record
//!
//! The manager's handle to one running plugin process.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::HostConfig;
use crate::error::{PluginError, PluginResult};
use crate::ipc::{ErrorPayload, Frame, FrameReader, FrameWriter, IpcChannel, MessageType, StartPayload};

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Status
// ─────────────────────────────────────────────────────────────────────────────

/// Current state of a plugin process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PluginStatus {
    /// Spawned, not yet ready
    Starting = 0,
    /// Host loaded the plugin and sent Ready
    Running = 1,
    /// Process has exited
    Exited = 2,
}

impl PluginStatus {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Running,
            _ => Self::Exited,
        }
    }
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginStatus::Starting => write!(f, "starting"),
            PluginStatus::Running => write!(f, "running"),
            PluginStatus::Exited => write!(f, "exited"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Record
// ─────────────────────────────────────────────────────────────────────────────

/// A plugin process owned by the manager
pub struct PluginRecord {
    name: String,
    child: Child,
    writer: FrameWriter<ChildStdin>,
    messages: mpsc::UnboundedReceiver<serde_json::Value>,
    status: Arc<AtomicU8>,
    last_error: Arc<Mutex<Option<String>>>,
    shutdown_sent: bool,
    send_timeout: Duration,
    writer_stalled: bool,
    reader_handle: Option<JoinHandle<()>>,
}

impl PluginRecord {
    /// Spawn the host process for `name`. Each frame write may block for at most `send_timeout`.
    pub(crate) fn spawn(name: &str, host: &HostConfig, send_timeout: Duration) -> PluginResult<Self> {
        let program = host.program_path();
        debug!("Spawning plugin process: {} {}", program.display(), name);

        let mut cmd = Command::new(&program);
        cmd.args(&host.args)
            .arg(name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Plugin logs go to our stderr
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| PluginError::Spawn {
            plugin: name.to_string(),
            reason: format!("{}: {}", program.display(), e),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| PluginError::Spawn {
            plugin: name.to_string(),
            reason: "Failed to get stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| PluginError::Spawn {
            plugin: name.to_string(),
            reason: "Failed to get stdout".into(),
        })?;

        let (writer, reader) = IpcChannel::new(stdout, stdin).split();

        let status = Arc::new(AtomicU8::new(PluginStatus::Starting as u8));
        let last_error = Arc::new(Mutex::new(None));
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        let reader_handle = tokio::spawn(read_messages(
            name.to_string(),
            reader,
            Arc::clone(&status),
            Arc::clone(&last_error),
            message_tx,
        ));

        Ok(Self {
            name: name.to_string(),
            child,
            writer,
            messages: message_rx,
            status,
            last_error,
            shutdown_sent: false,
            send_timeout,
            writer_stalled: false,
            reader_handle: Some(reader_handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS process id, if the process has not been reaped
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn status(&self) -> PluginStatus {
        PluginStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Last error the plugin reported before exiting
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Whether the shutdown sentinel has been sent
    pub fn shutdown_sent(&self) -> bool {
        self.shutdown_sent
    }

    pub(crate) async fn send_start(&mut self, config: serde_json::Value) -> PluginResult<()> {
        let frame = Frame::json(MessageType::Start, &StartPayload { config })
            .map_err(|e| PluginError::ipc(&self.name, e))?;
        self.send(&frame).await
    }

    /// Enqueue an application payload on the plugin's event channel
    pub async fn send_event(&mut self, event: &serde_json::Value) -> PluginResult<()> {
        if self.shutdown_sent {
            return Err(PluginError::ChannelClosed(self.name.clone()));
        }
        let frame = Frame::json(MessageType::Event, event).map_err(|e| PluginError::ipc(&self.name, e))?;
        self.send(&frame).await
    }

    /// Enqueue the shutdown sentinel. Only the first call sends anything.
    pub async fn send_shutdown(&mut self) -> PluginResult<()> {
        if self.shutdown_sent {
            return Ok(());
        }
        self.shutdown_sent = true;
        self.send(&Frame::empty(MessageType::Stop)).await
    }

    async fn send(&mut self, frame: &Frame) -> PluginResult<()> {
        if self.writer_stalled {
            return Err(PluginError::ChannelClosed(self.name.clone()));
        }

        match tokio::time::timeout(self.send_timeout, self.writer.send(frame)).await {
            Ok(result) => result.map_err(|e| PluginError::ipc(&self.name, e)),
            Err(_) => {
                // Part of the frame may already be in the pipe, so nothing can follow it
                self.writer_stalled = true;
                warn!("Plugin {} stopped reading its input", self.name);
                Err(PluginError::ipc(
                    &self.name,
                    format!("write timed out after {:?}", self.send_timeout),
                ))
            }
        }
    }

    /// Exit status if the process has already exited
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.mark_exited();
                Some(status)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Unable to poll plugin {}: {}", self.name, e);
                None
            }
        }
    }

    pub fn is_alive(&mut self) -> bool {
        self.try_exit_status().is_none()
    }

    /// Wait up to `timeout` for the process to exit
    pub async fn wait(&mut self, timeout: Duration) -> Option<ExitStatus> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.mark_exited();
                Some(status)
            }
            Ok(Err(e)) => {
                error!("Error waiting for plugin {}: {}", self.name, e);
                None
            }
            Err(_) => None,
        }
    }

    /// Forcibly terminate the process without waiting
    pub fn terminate(&mut self) -> PluginResult<()> {
        self.child
            .start_kill()
            .map_err(|e| PluginError::failed(&self.name, format!("unable to terminate: {e}")))
    }

    fn mark_exited(&self) {
        self.status.store(PluginStatus::Exited as u8, Ordering::SeqCst);
    }

    /// Give the reader task up to `timeout` to consume what the process wrote
    pub(crate) async fn finish_reading(&mut self, timeout: Duration) {
        if let Some(handle) = self.reader_handle.take() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(timeout, handle).await.is_err() {
                debug!("Reader for plugin {} still busy, aborting", self.name);
                abort.abort();
            }
        }
    }

    /// Take every message received so far
    pub(crate) fn drain_messages(&mut self) -> Vec<serde_json::Value> {
        let mut drained = Vec::new();
        while let Ok(message) = self.messages.try_recv() {
            drained.push(message);
        }
        drained
    }
}

impl Drop for PluginRecord {
    fn drop(&mut self) {
        if let Some(handle) = self.reader_handle.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for PluginRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRecord")
            .field("name", &self.name)
            .field("pid", &self.pid())
            .field("status", &self.status())
            .finish()
    }
}

/// Background task draining frames the plugin writes to its stdout
async fn read_messages(
    plugin: String,
    mut reader: FrameReader<ChildStdout>,
    status: Arc<AtomicU8>,
    last_error: Arc<Mutex<Option<String>>>,
    messages: mpsc::UnboundedSender<serde_json::Value>,
) {
    loop {
        match reader.recv().await {
            Ok(Some(frame)) => match frame.msg_type {
                MessageType::Ready => {
                    debug!("Plugin {} is ready", plugin);
                    let _ = status.compare_exchange(
                        PluginStatus::Starting as u8,
                        PluginStatus::Running as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                }
                MessageType::Message => match frame.parse_json::<serde_json::Value>() {
                    Ok(message) => {
                        let _ = messages.send(message);
                    }
                    Err(e) => warn!("Dropping malformed message from plugin {}: {}", plugin, e),
                },
                MessageType::Error => {
                    let message = frame
                        .parse_json::<ErrorPayload>()
                        .map(|payload| payload.message)
                        .unwrap_or_else(|_| String::from_utf8_lossy(&frame.payload).into_owned());
                    error!("Plugin {} error: {}", plugin, message);
                    *last_error.lock() = Some(message);
                }
                other => warn!("Unexpected message type from plugin {}: {:?}", plugin, other),
            },
            Ok(None) => {
                debug!("Plugin {} closed connection", plugin);
                break;
            }
            Err(e) => {
                error!("Error reading from plugin {}: {}", plugin, e);
                break;
            }
        }
    }
}
