//! Plugin Interface
//!
//! The plugin's side of the conversation with its manager. Inbound frames are
//! decoded by a background task into a FIFO of [`PluginEvent`]s so a plugin can
//! poll without blocking; outbound messages go through a writer task.

use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{PluginError, PluginResult};
use crate::ipc::{ErrorPayload, Frame, FrameReader, FrameWriter, MessageType};

/// An event delivered to a plugin
#[derive(Debug, Clone, PartialEq)]
pub enum PluginEvent {
    /// Application-defined payload sent by the manager
    Payload(serde_json::Value),
    /// Shutdown sentinel. The plugin must leave its run loop.
    Shutdown,
}

impl PluginEvent {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, PluginEvent::Shutdown)
    }
}

/// Communication handle passed to a plugin
pub struct PluginInterface {
    name: String,
    events: mpsc::UnboundedReceiver<PluginEvent>,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl PluginInterface {
    /// Build an interface from raw channels.
    pub fn new(
        name: impl Into<String>,
        events: mpsc::UnboundedReceiver<PluginEvent>,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        Self {
            name: name.into(),
            events,
            outbound,
        }
    }

    /// Connect an interface to the manager over a frame reader and writer.
    ///
    /// Returns the interface and the [`InterfaceLink`] that owns the I/O tasks.
    pub fn connect<R, W>(
        name: impl Into<String>,
        reader: FrameReader<R>,
        writer: FrameWriter<W>,
    ) -> (Self, InterfaceLink)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let name = name.into();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(read_events(name.clone(), reader, event_tx));
        let writer_task = tokio::spawn(write_frames(name.clone(), writer, outbound_rx));

        let link = InterfaceLink {
            name: name.clone(),
            outbound: outbound_tx.clone(),
            reader_task,
            writer_task,
        };

        (Self::new(name, event_rx, outbound_tx), link)
    }

    /// Name of the plugin this interface belongs to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next event. `None` once the channel is closed and drained.
    pub async fn get_event(&mut self) -> Option<PluginEvent> {
        self.events.recv().await
    }

    /// Wait up to `timeout` for the next event
    pub async fn get_event_timeout(&mut self, timeout: Duration) -> Option<PluginEvent> {
        tokio::time::timeout(timeout, self.events.recv())
            .await
            .ok()
            .flatten()
    }

    /// Take the next event without waiting. `None` if nothing is queued.
    pub fn try_get_event(&mut self) -> Option<PluginEvent> {
        self.events.try_recv().ok()
    }

    /// Send a message back to the manager
    pub fn add_message<T: Serialize>(&self, message: &T) -> PluginResult<()> {
        let frame = Frame::json(MessageType::Message, message)
            .map_err(|e| PluginError::ipc(&self.name, e))?;
        self.outbound
            .send(frame)
            .map_err(|_| PluginError::ChannelClosed(self.name.clone()))
    }
}

impl std::fmt::Debug for PluginInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInterface")
            .field("name", &self.name)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Interface Link
// ─────────────────────────────────────────────────────────────────────────────

/// Owner of the I/O tasks behind a connected [`PluginInterface`]
pub struct InterfaceLink {
    name: String,
    outbound: mpsc::UnboundedSender<Frame>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl InterfaceLink {
    /// Tell the manager the plugin failed
    pub fn report_error(&self, message: impl Into<String>) {
        let payload = ErrorPayload {
            message: message.into(),
        };
        match Frame::json(MessageType::Error, &payload) {
            Ok(frame) => {
                let _ = self.outbound.send(frame);
            }
            Err(e) => error!("Failed to encode error report for {}: {}", self.name, e),
        }
    }

    /// Flush pending outbound frames and stop the I/O tasks.
    ///
    /// The interface must have been dropped, otherwise its sender keeps the
    /// writer task alive and this waits forever.
    pub async fn finish(self) {
        let Self {
            name,
            outbound,
            reader_task,
            writer_task,
        } = self;

        drop(outbound);
        if let Err(e) = writer_task.await {
            error!("Writer task for {} failed: {}", name, e);
        }
        reader_task.abort();
    }
}

/// Decode inbound frames into events. Exactly one `Shutdown` is delivered,
/// either for the `Stop` frame or when the manager goes away.
async fn read_events<R: AsyncRead + Unpin>(
    name: String,
    mut reader: FrameReader<R>,
    events: mpsc::UnboundedSender<PluginEvent>,
) {
    loop {
        match reader.recv().await {
            Ok(Some(frame)) => match frame.msg_type {
                MessageType::Event => match frame.parse_json::<serde_json::Value>() {
                    Ok(value) => {
                        if events.send(PluginEvent::Payload(value)).is_err() {
                            debug!("Plugin {} dropped its interface", name);
                            return;
                        }
                    }
                    Err(e) => warn!("Dropping malformed event for {}: {}", name, e),
                },
                MessageType::Stop => {
                    debug!("Plugin {} received shutdown sentinel", name);
                    break;
                }
                other => warn!("Unexpected message type from manager: {:?}", other),
            },
            Ok(None) => {
                debug!("Manager closed connection to {}", name);
                break;
            }
            Err(e) => {
                error!("Error reading from manager: {}", e);
                break;
            }
        }
    }

    let _ = events.send(PluginEvent::Shutdown);
}

async fn write_frames<W: AsyncWrite + Unpin>(
    name: String,
    mut writer: FrameWriter<W>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = writer.send(&frame).await {
            error!("Error writing to manager from {}: {}", name, e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::IpcChannel;

    fn connected() -> (
        PluginInterface,
        InterfaceLink,
        IpcChannel<tokio::io::ReadHalf<tokio::io::DuplexStream>, tokio::io::WriteHalf<tokio::io::DuplexStream>>,
    ) {
        let (plugin_side, manager_side) = tokio::io::duplex(4096);
        let (read, write) = tokio::io::split(plugin_side);
        let (interface, link) =
            PluginInterface::connect("test", FrameReader::new(read), FrameWriter::new(write));
        let (m_read, m_write) = tokio::io::split(manager_side);
        (interface, link, IpcChannel::new(m_read, m_write))
    }

    #[tokio::test]
    async fn test_try_get_event_on_empty_queue() {
        let (mut interface, _link, _manager) = connected();
        assert!(interface.try_get_event().is_none());
    }

    #[tokio::test]
    async fn test_events_then_single_sentinel() {
        let (mut interface, _link, mut manager) = connected();

        manager
            .send(&Frame::json(MessageType::Event, &serde_json::json!("hello")).unwrap())
            .await
            .unwrap();
        manager.send(&Frame::empty(MessageType::Stop)).await.unwrap();

        assert_eq!(
            interface.get_event().await,
            Some(PluginEvent::Payload(serde_json::json!("hello")))
        );
        assert_eq!(interface.get_event().await, Some(PluginEvent::Shutdown));
        assert_eq!(interface.get_event().await, None);
    }

    #[tokio::test]
    async fn test_manager_going_away_delivers_shutdown() {
        let (mut interface, _link, manager) = connected();
        drop(manager);

        let event = interface.get_event_timeout(Duration::from_secs(5)).await;
        assert_eq!(event, Some(PluginEvent::Shutdown));
        assert_eq!(interface.get_event().await, None);
    }

    #[tokio::test]
    async fn test_get_event_timeout_elapses() {
        let (mut interface, _link, _manager) = connected();
        let event = interface.get_event_timeout(Duration::from_millis(20)).await;
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn test_messages_and_errors_reach_manager() {
        let (interface, link, mut manager) = connected();

        interface.add_message(&serde_json::json!({"answer": 42})).unwrap();
        link.report_error("boom");
        drop(interface);
        link.finish().await;

        let message = manager.recv().await.unwrap().unwrap();
        assert_eq!(message.msg_type, MessageType::Message);
        let value: serde_json::Value = message.parse_json().unwrap();
        assert_eq!(value["answer"], 42);

        let error = manager.recv().await.unwrap().unwrap();
        assert_eq!(error.msg_type, MessageType::Error);
        let payload: ErrorPayload = error.parse_json().unwrap();
        assert_eq!(payload.message, "boom");
    }
}
