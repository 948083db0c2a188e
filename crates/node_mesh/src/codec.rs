//! Length-prefixed binary framing for node-to-node links.
//!
//! Wire layout, all fields little-endian:
//!
//! ```text
//! [len: u16][source: u16][dest: u16][payload ...]
//! ```
//!
//! * `len` counts everything after itself: `payload.len() + 4`.
//! * `source` is the full sender handle (`node_id << 8 | module_id`).
//! * `dest` packs the message type in its high byte and the destination's
//!   local module id in its low byte. The destination node is implied by the
//!   link the frame travels on.

use crate::types::{Handle, MessageType};
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the fixed header, length field included.
pub const HEADER_LEN: usize = 6;

/// Largest payload representable by the 16-bit length field.
pub const MAX_PAYLOAD_LIMIT: usize = u16::MAX as usize - 4;

/// Errors produced while framing or parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Refused to encode a payload above the configured maximum.
    #[error("payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// The length field of an incoming frame is impossible or too large.
    #[error("malformed frame: declared length {declared}")]
    Malformed { declared: u16 },
}

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Full handle of the sending module.
    pub source: Handle,
    /// Local module id of the receiver on the destination node.
    pub dest: u8,
    /// Type tag, split out of the destination field.
    pub msg_type: MessageType,
    /// Opaque application bytes.
    pub payload: Bytes,
}

impl Frame {
    pub fn new(source: Handle, dest: u8, msg_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            source,
            dest,
            msg_type,
            payload: payload.into(),
        }
    }

    /// Control-protocol frame carrying `text`.
    pub fn text(source: Handle, dest: u8, text: &str) -> Self {
        Self::new(source, dest, MessageType::TEXT, Bytes::copy_from_slice(text.as_bytes()))
    }
}

/// Result of a single decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A full frame was parsed from the front of the buffer.
    Frame { frame: Frame, consumed: usize },
    /// More bytes are needed; the buffer must be kept as is.
    Incomplete,
}

/// Frames decoded from one buffer in a single pass.
#[derive(Debug, Default)]
pub struct Batch {
    /// Complete frames in arrival order.
    pub frames: Vec<Frame>,
    /// Bytes taken by `frames`. A trailing partial frame is not included.
    pub consumed: usize,
    /// Set when parsing stopped on a malformed frame. Frames before it are
    /// still returned; the link carrying them must be torn down.
    pub error: Option<CodecError>,
}

/// Stateless encoder/decoder bound to a maximum payload size.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_LIMIT)
    }
}

impl FrameCodec {
    /// Creates a codec accepting payloads up to `max_payload` bytes, capped at
    /// [`MAX_PAYLOAD_LIMIT`].
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(MAX_PAYLOAD_LIMIT),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Appends the wire form of a frame to `dst`.
    pub fn encode_into(
        &self,
        source: Handle,
        dest: u8,
        msg_type: MessageType,
        payload: &[u8],
        dst: &mut BytesMut,
    ) -> Result<(), CodecError> {
        if payload.len() > self.max_payload {
            return Err(CodecError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u16_le((payload.len() + 4) as u16);
        dst.put_u16_le(source.raw());
        dst.put_u16_le(u16::from(msg_type.0) << 8 | u16::from(dest));
        dst.put_slice(payload);
        Ok(())
    }

    /// Encodes a single frame into a fresh buffer.
    pub fn encode(
        &self,
        source: Handle,
        dest: u8,
        msg_type: MessageType,
        payload: &[u8],
    ) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        self.encode_into(source, dest, msg_type, payload, &mut buf)?;
        Ok(buf.freeze())
    }

    pub fn encode_frame(&self, frame: &Frame) -> Result<Bytes, CodecError> {
        self.encode(frame.source, frame.dest, frame.msg_type, &frame.payload)
    }

    /// Parses the frame at the front of `buf`.
    pub fn decode(&self, buf: &[u8]) -> Result<Decoded, CodecError> {
        if buf.len() < HEADER_LEN {
            return Ok(Decoded::Incomplete);
        }
        let declared = u16::from_le_bytes([buf[0], buf[1]]);
        let declared_len = usize::from(declared);
        if declared_len < 4 || declared_len - 4 > self.max_payload {
            return Err(CodecError::Malformed { declared });
        }
        let total = declared_len + 2;
        if buf.len() < total {
            return Ok(Decoded::Incomplete);
        }
        let source = Handle(u16::from_le_bytes([buf[2], buf[3]]));
        let dest = u16::from_le_bytes([buf[4], buf[5]]);
        let frame = Frame {
            source,
            dest: (dest & 0x00ff) as u8,
            msg_type: MessageType((dest >> 8) as u8),
            payload: Bytes::copy_from_slice(&buf[HEADER_LEN..total]),
        };
        Ok(Decoded::Frame {
            frame,
            consumed: total,
        })
    }

    /// Parses every complete frame packed back-to-back in `buf`.
    ///
    /// The caller drops exactly `consumed` bytes from its stream and keeps the
    /// rest for the next read.
    pub fn decode_batch(&self, buf: &[u8]) -> Batch {
        let mut batch = Batch::default();
        loop {
            match self.decode(&buf[batch.consumed..]) {
                Ok(Decoded::Frame { frame, consumed }) => {
                    batch.frames.push(frame);
                    batch.consumed += consumed;
                }
                Ok(Decoded::Incomplete) => break,
                Err(e) => {
                    batch.error = Some(e);
                    break;
                }
            }
        }
        batch
    }
}
