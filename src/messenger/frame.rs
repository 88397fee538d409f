//! Framing of channel messages over a byte stream.
//!
//! Layout: kind (u8), call id (u32 LE), channel name (u16 LE length + utf-8),
//! payload (u32 LE length + bytes).

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Call,
    Reply,
    /// No handler is registered for the channel of the call.
    Unhandled,
    /// The handler stopped before producing a reply.
    Aborted,
}

impl FrameKind {
    pub fn as_u8(&self) -> u8 {
        match self {
            FrameKind::Call => 0,
            FrameKind::Reply => 1,
            FrameKind::Unhandled => 2,
            FrameKind::Aborted => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameKind::Call),
            1 => Some(FrameKind::Reply),
            2 => Some(FrameKind::Unhandled),
            3 => Some(FrameKind::Aborted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub id: u32,
    pub channel: String,
    pub payload: Vec<u8>,
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl Frame {
    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let channel_len = u16::try_from(self.channel.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "Channel name too long")
        })?;

        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Payload of {} bytes exceeds frame limit", self.payload.len()),
            ));
        }

        let mut header = Vec::with_capacity(11 + self.channel.len());
        header.push(self.kind.as_u8());
        header.extend_from_slice(&self.id.to_le_bytes());
        header.extend_from_slice(&channel_len.to_le_bytes());
        header.extend_from_slice(self.channel.as_bytes());
        header.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());

        writer.write_all(&header).await?;
        writer.write_all(&self.payload).await?;
        writer.flush().await
    }

    /// Reads the next frame, `None` when the stream ended cleanly between
    /// frames.
    pub async fn read_from<R>(reader: &mut R) -> io::Result<Option<Frame>>
    where
        R: AsyncRead + Unpin,
    {
        let kind = match reader.read_u8().await {
            Ok(kind) => kind,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        let kind = FrameKind::from_u8(kind)
            .ok_or_else(|| invalid_data(format!("Unknown frame kind {}", kind)))?;

        let id = reader.read_u32_le().await?;

        let channel_len = reader.read_u16_le().await? as usize;
        let mut channel = vec![0; channel_len];
        reader.read_exact(&mut channel).await?;
        let channel = String::from_utf8(channel)
            .map_err(|_| invalid_data("Channel name is not utf-8".to_string()))?;

        let payload_len = reader.read_u32_le().await? as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(invalid_data(format!(
                "Payload of {} bytes exceeds frame limit",
                payload_len
            )));
        }
        let mut payload = vec![0; payload_len];
        reader.read_exact(&mut payload).await?;

        Ok(Some(Frame { kind, id, channel, payload }))
    }
}
