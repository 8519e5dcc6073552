use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: magic (2) + length (4) + flags (2) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Magic bytes: "SM" (0x53 0x4D).
pub const MAGIC: [u8; 2] = [0x53, 0x4D];

/// Another part of the same message follows this frame.
pub const MORE: u16 = 0x0001;

/// Connection-management frame (handshake); never part of a routed message.
pub const CONTROL: u16 = 0x0002;

const KNOWN_FLAGS: u16 = MORE | CONTROL;

/// Default maximum payload size per part: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Default maximum number of parts per message.
pub const DEFAULT_MAX_PARTS: usize = 64;

/// A complete message: routing frames, delimiters and body, in order.
pub type Multipart = Vec<Bytes>;

/// One frame on the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    pub flags: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            flags,
            payload: payload.into(),
        }
    }

    /// Whether another part of the same message follows.
    pub fn has_more(&self) -> bool {
        self.flags & MORE != 0
    }

    /// Whether this is a connection-management frame.
    pub fn is_control(&self) -> bool {
        self.flags & CONTROL != 0
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode a frame into the wire format.
///
/// ```text
/// ┌──────────────┬───────────┬──────────┬─────────────────┐
/// │ Magic (2B)   │ Length    │ Flags    │ Payload         │
/// │ 0x53 0x4D    │ (4B LE)   │ (2B LE)  │ (Length bytes)  │
/// └──────────────┴───────────┴──────────┴─────────────────┘
/// ```
pub fn encode_frame(flags: u16, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if flags & !KNOWN_FLAGS != 0 {
        return Err(FrameError::UnknownFlags(flags));
    }
    if payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u32_le(payload.len() as u32);
    dst.put_u16_le(flags);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let payload_len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    let flags = u16::from_le_bytes([src[6], src[7]]);

    if flags & !KNOWN_FLAGS != 0 {
        return Err(FrameError::UnknownFlags(flags));
    }

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame { flags, payload }))
}

/// Configuration for frame readers and writers.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size per part in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
    /// Maximum number of parts in one message. Default: 64.
    pub max_parts: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            max_parts: DEFAULT_MAX_PARTS,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
