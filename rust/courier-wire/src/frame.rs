//! Length-prefixed wire frames for transport-backed routers.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! [u32 total length, covering everything after this field]
//! [u16 len][service id utf-8]
//! [u16 len][op id utf-8]
//! [u8  op code]
//! [u64 request id]
//! [u16 len][source name utf-8]
//! [u16 source port]
//! [u32 len][payload bytes]
//! ```
//!
//! A zero-length payload decodes as an absent payload; the per-op-code
//! payload invariants keep the two indistinguishable cases unambiguous.
//! Decode errors are recoverable: a malformed frame is dropped, the
//! connection stays up.

use std::fmt;

use crate::{Address, CsMessage, OpCode, OpId, RequestId, ServiceId};

/// Error raised by [`encode`] when an envelope field does not fit its
/// length prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameEncodeError {
    pub field: &'static str,
    pub len: usize,
}

impl fmt::Display for FrameEncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} bytes exceeds the frame length prefix",
            self.field, self.len
        )
    }
}

impl std::error::Error for FrameEncodeError {}

/// Error raised by [`decode`] on malformed input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameDecodeError {
    /// Input ended before the declared field boundary.
    Truncated,
    /// The total-length field disagrees with the bytes actually present.
    LengthMismatch { declared: usize, actual: usize },
    /// A string field held invalid UTF-8.
    InvalidUtf8 { field: &'static str },
    /// Unknown op-code discriminant.
    UnknownOpCode(u8),
    /// Bytes left over after the last field.
    TrailingBytes { count: usize },
}

impl fmt::Display for FrameDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameDecodeError::Truncated => write!(f, "frame truncated"),
            FrameDecodeError::LengthMismatch { declared, actual } => {
                write!(f, "frame declares {declared} bytes but carries {actual}")
            }
            FrameDecodeError::InvalidUtf8 { field } => {
                write!(f, "invalid utf-8 in {field}")
            }
            FrameDecodeError::UnknownOpCode(code) => {
                write!(f, "unknown op code discriminant {code}")
            }
            FrameDecodeError::TrailingBytes { count } => {
                write!(f, "{count} trailing bytes after payload")
            }
        }
    }
}

impl std::error::Error for FrameDecodeError {}

/// Encode an envelope into a complete frame, total-length prefix included.
pub fn encode(msg: &CsMessage) -> Result<Vec<u8>, FrameEncodeError> {
    let sid = msg.service_id().as_str().as_bytes();
    let op = msg.op_id().as_str().as_bytes();
    let source = msg.source().name.as_bytes();
    let payload: &[u8] = msg.payload().map(Vec::as_slice).unwrap_or_default();

    check_len("service id", sid.len(), u16::MAX as usize)?;
    check_len("op id", op.len(), u16::MAX as usize)?;
    check_len("source name", source.len(), u16::MAX as usize)?;
    check_len("payload", payload.len(), u32::MAX as usize)?;

    let body_len = 2 + sid.len()
        + 2 + op.len()
        + 1
        + 8
        + 2 + source.len()
        + 2
        + 4 + payload.len();

    let mut out = Vec::with_capacity(4 + body_len);
    out.extend_from_slice(&(body_len as u32).to_le_bytes());
    put_prefixed(&mut out, sid);
    put_prefixed(&mut out, op);
    out.push(msg.op_code() as u8);
    out.extend_from_slice(&msg.request_id().raw().to_le_bytes());
    put_prefixed(&mut out, source);
    out.extend_from_slice(&msg.source().port.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode one complete frame (total-length prefix included).
pub fn decode(buf: &[u8]) -> Result<CsMessage, FrameDecodeError> {
    let mut r = Reader::new(buf);
    let declared = r.u32()? as usize;
    let actual = buf.len() - 4;
    if declared != actual {
        return Err(FrameDecodeError::LengthMismatch { declared, actual });
    }

    let sid = r.short_str("service id")?;
    let op = r.short_str("op id")?;
    let code = r.u8()?;
    let op_code = OpCode::from_u8(code).ok_or(FrameDecodeError::UnknownOpCode(code))?;
    let request_id = RequestId::new(r.u64()?);
    let source_name = r.short_str("source name")?;
    let source_port = r.u16()?;
    let payload_len = r.u32()? as usize;
    let payload = r.bytes(payload_len)?;
    let payload = if payload.is_empty() {
        None
    } else {
        Some(payload.to_vec())
    };

    if r.remaining() != 0 {
        return Err(FrameDecodeError::TrailingBytes {
            count: r.remaining(),
        });
    }

    Ok(CsMessage::new(
        ServiceId::from(sid),
        OpId::from(op),
        op_code,
        request_id,
        payload,
    )
    .with_source(Address::new(source_name, source_port)))
}

/// Peek the full frame size (prefix included) once at least four bytes of a
/// stream have arrived. Transports that reassemble from a byte stream use
/// this to find frame boundaries.
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    let declared = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    Some(4 + declared)
}

fn check_len(field: &'static str, len: usize, max: usize) -> Result<(), FrameEncodeError> {
    if len > max {
        Err(FrameEncodeError { field, len })
    } else {
        Ok(())
    }
}

fn put_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], FrameDecodeError> {
        if self.remaining() < len {
            return Err(FrameDecodeError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, FrameDecodeError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, FrameDecodeError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, FrameDecodeError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, FrameDecodeError> {
        let b = self.bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn short_str(&mut self, field: &'static str) -> Result<&'a str, FrameDecodeError> {
        let len = self.u16()? as usize;
        let bytes = self.bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| FrameDecodeError::InvalidUtf8 { field })
    }
}
