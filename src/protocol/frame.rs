//! RFC 6455 frame codec.
//!
//! ```text
//!  0                   1                   2                   3
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |    Masking-key (0 or 4 bytes)   |       Payload Data ...      |
//! +---------------------------------+-----------------------------+
//! ```
//!
//! Decoding works on a byte buffer that may hold a partial frame; it
//! reports how many bytes a complete frame consumed. Masked frames are
//! unmasked on decode so the codec also reads client frames.

// ============================================================================
// Imports
// ============================================================================

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Close status codes used by the client.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away.
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Invalid payload data (bad UTF-8 in a text message).
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Message too big.
    pub const MESSAGE_TOO_BIG: u16 = 1009;
}

// ============================================================================
// Opcode
// ============================================================================

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    /// Parses the low nibble of the first header byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    /// Returns `true` for Close, Ping and Pong.
    #[inline]
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

// ============================================================================
// Frame
// ============================================================================

/// A single decoded or to-be-encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Frame {
    /// Creates a final frame.
    #[must_use]
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    /// Creates a close frame with a status code and reason.
    ///
    /// The reason is truncated to fit a control frame.
    #[must_use]
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        payload.put_slice(&reason.as_bytes()[..end]);
        Self::new(Opcode::Close, payload.freeze())
    }

    /// Status code and reason of a close frame payload.
    #[must_use]
    pub fn close_reason(&self) -> (Option<u16>, String) {
        if self.payload.len() < 2 {
            return (None, String::new());
        }
        let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let reason = String::from_utf8_lossy(&self.payload[2..]).into_owned();
        (Some(code), reason)
    }

    /// Encodes the frame, masking the payload when `mask` is given.
    #[must_use]
    pub fn encode(&self, mask: Option<[u8; 4]>) -> Bytes {
        let len = self.payload.len();
        let mut out = BytesMut::with_capacity(len + 14);

        let fin_bit = if self.fin { 0x80 } else { 0x00 };
        out.put_u8(fin_bit | self.opcode.as_u8());

        let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
        if len < 126 {
            out.put_u8(mask_bit | len as u8);
        } else if let Ok(short) = u16::try_from(len) {
            out.put_u8(mask_bit | 126);
            out.put_u16(short);
        } else {
            out.put_u8(mask_bit | 127);
            out.put_u64(len as u64);
        }

        match mask {
            Some(key) => {
                out.put_slice(&key);
                let start = out.len();
                out.put_slice(&self.payload);
                apply_mask(&mut out[start..], key);
            }
            None => out.put_slice(&self.payload),
        }
        out.freeze()
    }

    /// Decodes one frame from the start of `buffer`.
    ///
    /// Returns `Ok(None)` while the frame is incomplete, otherwise the frame
    /// and the number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooLarge`] as soon as the header announces a
    /// payload above `max_payload`, and [`FrameError::Protocol`] for reserved
    /// bits, unknown opcodes, or invalid control frames.
    pub fn decode(buffer: &[u8], max_payload: usize) -> Result<Option<(Self, usize)>, FrameError> {
        if buffer.len() < 2 {
            return Ok(None);
        }

        let fin = buffer[0] & 0x80 != 0;
        if buffer[0] & 0x70 != 0 {
            return Err(FrameError::Protocol("reserved bits set"));
        }
        let opcode = Opcode::from_u8(buffer[0] & 0x0F).ok_or(FrameError::Protocol("unknown opcode"))?;
        let masked = buffer[1] & 0x80 != 0;

        let mut offset = 2;
        let len = match buffer[1] & 0x7F {
            126 => {
                let Some(bytes) = buffer.get(2..4) else {
                    return Ok(None);
                };
                offset += 2;
                u64::from(u16::from_be_bytes([bytes[0], bytes[1]]))
            }
            127 => {
                let Some(bytes) = buffer.get(2..10) else {
                    return Ok(None);
                };
                offset += 8;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                u64::from_be_bytes(raw)
            }
            short => u64::from(short),
        };

        if opcode.is_control() && (!fin || len > MAX_CONTROL_PAYLOAD as u64) {
            return Err(FrameError::Protocol("invalid control frame"));
        }
        if len > max_payload as u64 {
            return Err(FrameError::TooLarge(len));
        }
        // Bounded by max_payload above.
        let len = len as usize;

        let mask = if masked {
            let Some(bytes) = buffer.get(offset..offset + 4) else {
                return Ok(None);
            };
            offset += 4;
            Some([bytes[0], bytes[1], bytes[2], bytes[3]])
        } else {
            None
        };

        let Some(data) = buffer.get(offset..offset + len) else {
            return Ok(None);
        };

        let payload = match mask {
            Some(key) => {
                let mut data = BytesMut::from(data);
                apply_mask(&mut data, key);
                data.freeze()
            }
            None => Bytes::copy_from_slice(data),
        };

        Ok(Some((
            Self {
                fin,
                opcode,
                payload,
            },
            offset + len,
        )))
    }
}

/// XORs `data` with the repeating 4-byte `key`.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

// ============================================================================
// FrameError
// ============================================================================

/// Frame decoding failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Violation of the framing rules.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// Announced payload exceeds the configured maximum.
    #[error("frame payload of {0} bytes exceeds the maximum")]
    TooLarge(u64),
}

impl FrameError {
    /// Close code to send for this error.
    #[must_use]
    pub const fn close_code(&self) -> u16 {
        match self {
            Self::Protocol(_) => close_code::PROTOCOL_ERROR,
            Self::TooLarge(_) => close_code::MESSAGE_TOO_BIG,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
