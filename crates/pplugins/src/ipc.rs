//! IPC protocol between the manager and plugin host processes
//!
//! Frame format: `[length: 4 bytes BE][msg_type: 1 byte][payload: length-1 bytes]`.
//! The manager writes to the child's stdin and reads from its stdout.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame, counting the type byte.
///
/// Anything bigger is treated as garbage on the pipe (a plugin printing to
/// stdout, say) rather than allocated.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Message types for IPC protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Manager → Plugin
    Start = 1,
    Stop = 2,
    Event = 3,

    // Plugin → Manager
    Ready = 10,
    Message = 12,
    Error = 13,
}

impl TryFrom<u8> for MessageType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::Start),
            2 => Ok(MessageType::Stop),
            3 => Ok(MessageType::Event),
            10 => Ok(MessageType::Ready),
            12 => Ok(MessageType::Message),
            13 => Ok(MessageType::Error),
            _ => anyhow::bail!("Unknown message type: {}", value),
        }
    }
}

/// A frame received from or sent to a plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    pub fn empty(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            payload: Vec::new(),
        }
    }

    /// Build a frame with a JSON payload
    pub fn json<T: Serialize>(msg_type: MessageType, data: &T) -> Result<Self> {
        Ok(Self::new(msg_type, serde_json::to_vec(data)?))
    }

    /// Parse payload as JSON
    pub fn parse_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Payload of the `Start` frame
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartPayload {
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Payload of the `Error` frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Writes frames to the other side
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        let size = 1 + frame.payload.len();
        if size > MAX_FRAME_SIZE {
            anyhow::bail!("Frame too large: {} bytes", size);
        }
        let len = u32::try_from(size)?;
        self.inner.write_all(&len.to_be_bytes()).await?;
        self.inner.write_all(&[frame.msg_type as u8]).await?;
        self.inner.write_all(&frame.payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Send a frame with a JSON payload
    pub async fn send_json<T: Serialize>(&mut self, msg_type: MessageType, data: &T) -> Result<()> {
        self.send(&Frame::json(msg_type, data)?).await
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads frames from the other side
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Receive the next frame. `None` on a clean EOF at a frame boundary.
    pub async fn recv(&mut self) -> Result<Option<Frame>> {
        let Some(size) = self.read_size().await? else {
            return Ok(None);
        };

        let msg_type = MessageType::try_from(self.inner.read_u8().await?)?;
        let mut payload = vec![0u8; size - 1];
        self.inner.read_exact(&mut payload).await?;

        Ok(Some(Frame::new(msg_type, payload)))
    }

    /// Frame size from the header, validated before anything is allocated
    async fn read_size(&mut self) -> Result<Option<usize>> {
        let mut header = [0u8; 4];
        if let Err(e) = self.inner.read_exact(&mut header).await {
            return match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Ok(None),
                _ => Err(e.into()),
            };
        }

        match u32::from_be_bytes(header) as usize {
            0 => anyhow::bail!("Empty message"),
            size if size > MAX_FRAME_SIZE => anyhow::bail!(
                "Frame too large: {} bytes (header {:02x?})",
                size,
                header
            ),
            size => Ok(Some(size)),
        }
    }
}

/// Bidirectional IPC channel
pub struct IpcChannel<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> IpcChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        }
    }

    /// Split into separate writer and reader
    pub fn split(self) -> (FrameWriter<W>, FrameReader<R>) {
        (self.writer, self.reader)
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        self.writer.send(frame).await
    }

    pub async fn recv(&mut self) -> Result<Option<Frame>> {
        self.reader.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_a_duplex_pipe() {
        let (a, b) = tokio::io::duplex(1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let mut left = IpcChannel::new(a_read, a_write);
        let mut right = IpcChannel::new(b_read, b_write);

        left.send(&Frame::empty(MessageType::Ready)).await.unwrap();
        left.send(&Frame::json(MessageType::Event, &serde_json::json!({"n": 1})).unwrap())
            .await
            .unwrap();

        let ready = right.recv().await.unwrap().unwrap();
        assert_eq!(ready, Frame::empty(MessageType::Ready));

        let event = right.recv().await.unwrap().unwrap();
        assert_eq!(event.msg_type, MessageType::Event);
        let value: serde_json::Value = event.parse_json().unwrap();
        assert_eq!(value["n"], 1);
    }

    #[tokio::test]
    async fn test_eof_yields_none() {
        let mut reader = FrameReader::new(&b""[..]);
        assert!(reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_empty_and_unknown_frames() {
        let mut reader = FrameReader::new(&[0u8, 0, 0, 0][..]);
        assert!(reader.recv().await.is_err());

        let mut reader = FrameReader::new(&[0u8, 0, 0, 1, 99][..]);
        let err = reader.recv().await.unwrap_err();
        assert!(err.to_string().contains("Unknown message type: 99"));
    }

    #[tokio::test]
    async fn test_rejects_oversized_frames() {
        // Plain text on the pipe reads as a ~1.7 GB length
        let mut reader = FrameReader::new(&b"hello from a plugin\n"[..]);
        let err = reader.recv().await.unwrap_err();
        assert!(err.to_string().contains("Frame too large"), "{err}");

        let mut writer = FrameWriter::new(Vec::new());
        let frame = Frame::new(MessageType::Message, vec![0; MAX_FRAME_SIZE]);
        assert!(writer.send(&frame).await.is_err());
        assert!(writer.into_inner().is_empty());
    }

    #[tokio::test]
    async fn test_largest_frame_is_accepted() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut writer = FrameWriter::new(a);
        let mut reader = FrameReader::new(b);
        let frame = Frame::new(MessageType::Event, vec![7; MAX_FRAME_SIZE - 1]);

        let (sent, received) = tokio::join!(writer.send(&frame), reader.recv());
        sent.unwrap();
        assert_eq!(received.unwrap().unwrap(), frame);
    }

    #[tokio::test]
    async fn test_wire_layout() {
        let mut writer = FrameWriter::new(Vec::new());
        writer
            .send(&Frame::new(MessageType::Message, b"{}".to_vec()))
            .await
            .unwrap();

        assert_eq!(writer.into_inner(), vec![0, 0, 0, 3, 12, b'{', b'}']);
    }
}
