//! Frame codec for the multiplexed session layer
//!
//! A session carries one control stream (stream 0) and any number of data
//! streams. Every frame is `stream_id (4) | frame_type (1) | flags (1) |
//! length (4) | payload`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Stream identifier
pub type StreamId = u32;

/// Frame types carried over a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Control envelope (requests, responses, pushes) on stream 0
    Control = 0,
    /// Opens a new data stream; payload names the target endpoint
    Open = 1,
    /// Stream payload bytes
    Data = 2,
    /// Closes a data stream
    Close = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Control),
            1 => Ok(FrameType::Open),
            2 => Ok(FrameType::Data),
            3 => Ok(FrameType::Close),
            _ => Err(CodecError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const FIN: u8 = 0b0000_0001;
    pub const RST: u8 = 0b0000_0010;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_fin(mut self) -> Self {
        self.0 |= Self::FIN;
        self
    }

    pub fn with_rst(mut self) -> Self {
        self.0 |= Self::RST;
        self
    }

    pub fn has_fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn has_rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// A single multiplexed frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: stream_id (4) + frame_type (1) + flags (1) + length (4)
    pub const HEADER_SIZE: usize = 10;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn control(payload: Bytes) -> Self {
        Self::new(crate::CONTROL_STREAM_ID, FrameType::Control, payload)
    }

    pub fn open(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Open, payload)
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new())
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(CodecError::FrameTooLarge(payload_len));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + payload_len);
        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags.as_u8());
        buf.put_u32(payload_len as u32);
        buf.put(self.payload.clone());

        Ok(buf.freeze())
    }

    /// Decode frame from bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(CodecError::IncompleteFrame);
        }

        let stream_id = buf.get_u32();
        let frame_type = FrameType::try_from(buf.get_u8())?;
        let flags = FrameFlags::from_u8(buf.get_u8());
        let length = buf.get_u32();

        if length > crate::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length as usize));
        }
        if buf.remaining() < length as usize {
            return Err(CodecError::IncompleteFrame);
        }

        let payload = buf.split_to(length as usize);

        Ok(Self {
            stream_id,
            frame_type,
            flags,
            payload,
        })
    }

    /// Read one frame from an async reader. Returns `Ok(None)` on clean EOF
    /// at a frame boundary.
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Self>, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; Self::HEADER_SIZE];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let mut buf = Bytes::copy_from_slice(&header);
        let stream_id = buf.get_u32();
        let frame_type = FrameType::try_from(buf.get_u8())?;
        let flags = FrameFlags::from_u8(buf.get_u8());
        let length = buf.get_u32();

        if length > crate::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length as usize));
        }

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload).await?;

        Ok(Some(Self {
            stream_id,
            frame_type,
            flags,
            payload: Bytes::from(payload),
        }))
    }

    /// Write this frame to an async writer
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = self.encode()?;
        writer.write_all(&encoded).await?;
        Ok(())
    }
}

/// Write one length-prefixed bincode message; used for the handshake
/// exchange before the frame loops take over the transport.
pub async fn write_message<W, T>(writer: &mut W, value: &T) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let payload = bincode::serialize(value)?;
    if payload.len() > crate::MAX_FRAME_SIZE as usize {
        return Err(CodecError::FrameTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    Ok(())
}

/// Read one length-prefixed bincode message
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, CodecError>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > crate::MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(len as usize));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(bincode::deserialize(&payload)?)
}

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Incomplete frame")]
    IncompleteFrame,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed message: {0}")]
    Message(#[from] bincode::Error),
}
