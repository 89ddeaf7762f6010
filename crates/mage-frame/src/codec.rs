use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::channel::ChannelId;
use crate::error::{FrameError, Result};

/// Frame header: channel (1) + length (4) + opcode (1) = 6 bytes.
pub const HEADER_SIZE: usize = 6;

/// Default maximum payload size: 1 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Application bytes for the frame's channel.
    Data = 0x00,
    /// Connection-level control message (e.g. close).
    Control = 0x01,
    /// Handshake message; only valid before authentication.
    Handshake = 0x02,
}

impl Opcode {
    /// Parse an opcode byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Opcode::Data),
            0x01 => Ok(Opcode::Control),
            0x02 => Ok(Opcode::Handshake),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }

    /// Lowercase name for logs and CLI output.
    pub fn as_str(self) -> &'static str {
        match self {
            Opcode::Data => "data",
            Opcode::Control => "control",
            Opcode::Handshake => "handshake",
        }
    }
}

/// A framed message with channel routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The channel this message belongs to.
    pub channel: ChannelId,
    /// What kind of message this is.
    pub opcode: Opcode,
    /// The message payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(channel: ChannelId, opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            opcode,
            payload: payload.into(),
        }
    }

    /// Create a data frame.
    pub fn data(channel: ChannelId, payload: impl Into<Bytes>) -> Self {
        Self::new(channel, Opcode::Data, payload)
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌────────────┬──────────────┬──────────┬──────────────────┐
/// │ Channel    │ Length       │ Opcode   │ Payload          │
/// │ (1B)       │ (4B LE)      │ (1B)     │ (Length bytes)   │
/// └────────────┴──────────────┴──────────┴──────────────────┘
/// ```
pub fn encode_frame(
    channel: ChannelId,
    opcode: Opcode,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u8(channel);
    dst.put_u32_le(payload.len() as u32);
    dst.put_u8(opcode as u8);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// The header is validated as soon as it is complete, so an oversized length
/// or unknown opcode fails without waiting for (or allocating) the payload.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let channel = src[0];
    let payload_len = u32::from_le_bytes([src[1], src[2], src[3], src[4]]) as usize;
    let opcode = Opcode::from_u8(src[5])?;

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame {
        channel,
        opcode,
        payload,
    }))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 1 MiB.
    pub max_payload_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
