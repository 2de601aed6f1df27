//! RFC 6455 frame codec.
//!
//! Wire format:
//! ```text
//! [FIN:1|RSV1:1|RSV2:1|RSV3:1|opcode:4][MASK:1|len7:7][ext len: 0/2/8][mask key: 0/4][payload:N]
//! ```
//! `len7` of 126 means a 16-bit length follows, 127 a 64-bit length.  All
//! multi-byte integers are big-endian.
//!
//! RSV1 marks a data message compressed with permessage-deflate; RSV2 and
//! RSV3 are never valid here because no other extension is negotiated.

use thiserror::Error;

/// Default upper bound for a single frame payload (64 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Control frames (close, ping, pong) may carry at most 125 payload bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Close status code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close status code for a protocol violation.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Errors that can occur while decoding a frame.
#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    /// The byte slice does not hold a complete frame yet.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// RSV2 or RSV3 was set.
    #[error("reserved bits set in frame header: 0x{0:02X}")]
    ReservedBits(u8),

    /// The opcode nibble is not one RFC 6455 defines.
    #[error("unknown opcode: 0x{0:X}")]
    UnknownOpcode(u8),

    /// The declared payload length exceeds the configured maximum.
    #[error("payload of {declared} bytes exceeds limit of {max}")]
    PayloadTooLarge { declared: u64, max: usize },

    /// A control frame was fragmented or longer than 125 bytes.
    #[error("invalid control frame: {0}")]
    InvalidControlFrame(&'static str),
}

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Close, ping, and pong.
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }
}

/// One decoded frame.  The payload is always unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    /// Set on the first frame of a compressed message.
    pub rsv1: bool,
    pub opcode: Opcode,
    /// Whether the frame arrived masked (client frames must be).
    pub masked: bool,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A complete, unfragmented frame.
    pub fn new(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self {
            fin: true,
            rsv1: false,
            opcode,
            masked: false,
            payload,
        }
    }

    pub fn binary(payload: Vec<u8>) -> Self {
        Self::new(Opcode::Binary, payload)
    }

    pub fn text(text: &str) -> Self {
        Self::new(Opcode::Text, text.as_bytes().to_vec())
    }

    pub fn ping(payload: Vec<u8>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    pub fn pong(payload: Vec<u8>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// A close frame carrying a status code and a (truncated) reason.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = code.to_be_bytes().to_vec();
        let mut reason = reason.as_bytes();
        if reason.len() > MAX_CONTROL_PAYLOAD - 2 {
            reason = &reason[..MAX_CONTROL_PAYLOAD - 2];
        }
        payload.extend_from_slice(reason);
        Self::new(Opcode::Close, payload)
    }

    /// The status code of a close frame, if present.
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode == Opcode::Close && self.payload.len() >= 2 {
            Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
        } else {
            None
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Decodes one frame from the beginning of `bytes` with the default payload
/// limit.
///
/// Returns the frame and the number of bytes consumed, so the caller can
/// drain them from its receive buffer.
///
/// # Errors
///
/// Returns [`FrameError::InsufficientData`] when more bytes are needed, and
/// the other variants when the frame is invalid.
///
/// # Examples
///
/// ```rust
/// use broker_core::protocol::frame::{decode_frame, encode_frame_masked, Frame};
///
/// let bytes = encode_frame_masked(&Frame::text("hi"), [1, 2, 3, 4]);
/// let (frame, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(frame.payload, b"hi");
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameError> {
    decode_frame_limited(bytes, DEFAULT_MAX_PAYLOAD)
}

/// Like [`decode_frame`] with an explicit payload limit.
///
/// The limit is checked as soon as the length field is readable, so an
/// oversized frame is rejected before its payload is buffered.
pub fn decode_frame_limited(bytes: &[u8], max_payload: usize) -> Result<(Frame, usize), FrameError> {
    if bytes.len() < 2 {
        return Err(FrameError::InsufficientData {
            needed: 2,
            available: bytes.len(),
        });
    }

    let b0 = bytes[0];
    let b1 = bytes[1];
    let fin = b0 & 0x80 != 0;
    let rsv1 = b0 & 0x40 != 0;
    if b0 & 0x30 != 0 {
        return Err(FrameError::ReservedBits(b0 & 0x70));
    }
    let opcode = Opcode::try_from(b0 & 0x0F)?;
    let masked = b1 & 0x80 != 0;

    let (payload_len, mut offset) = match b1 & 0x7F {
        126 => {
            if bytes.len() < 4 {
                return Err(FrameError::InsufficientData {
                    needed: 4,
                    available: bytes.len(),
                });
            }
            (u16::from_be_bytes([bytes[2], bytes[3]]) as u64, 4)
        }
        127 => {
            if bytes.len() < 10 {
                return Err(FrameError::InsufficientData {
                    needed: 10,
                    available: bytes.len(),
                });
            }
            let mut len = [0u8; 8];
            len.copy_from_slice(&bytes[2..10]);
            (u64::from_be_bytes(len), 10)
        }
        n => (n as u64, 2),
    };

    if opcode.is_control() {
        if !fin {
            return Err(FrameError::InvalidControlFrame("fragmented control frame"));
        }
        if payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(FrameError::InvalidControlFrame("control payload over 125 bytes"));
        }
    }
    if payload_len > max_payload as u64 {
        return Err(FrameError::PayloadTooLarge {
            declared: payload_len,
            max: max_payload,
        });
    }
    let payload_len = payload_len as usize;

    let mask = if masked {
        if bytes.len() < offset + 4 {
            return Err(FrameError::InsufficientData {
                needed: offset + 4,
                available: bytes.len(),
            });
        }
        let key = [
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let total = offset + payload_len;
    if bytes.len() < total {
        return Err(FrameError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }

    let mut payload = bytes[offset..total].to_vec();
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    Ok((
        Frame {
            fin,
            rsv1,
            opcode,
            masked,
            payload,
        },
        total,
    ))
}

/// Encodes a server-to-client frame (never masked).
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    encode_with_mask(frame, None)
}

/// Encodes a client-to-server frame masked with `mask`.
pub fn encode_frame_masked(frame: &Frame, mask: [u8; 4]) -> Vec<u8> {
    encode_with_mask(frame, Some(mask))
}

fn encode_with_mask(frame: &Frame, mask: Option<[u8; 4]>) -> Vec<u8> {
    let len = frame.payload.len();
    let mut buf = Vec::with_capacity(len + 14);

    let mut b0 = frame.opcode as u8;
    if frame.fin {
        b0 |= 0x80;
    }
    if frame.rsv1 {
        b0 |= 0x40;
    }
    buf.push(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if len < 126 {
        buf.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        buf.push(mask_bit | 126);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buf.push(mask_bit | 127);
        buf.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            buf.extend_from_slice(&key);
            let start = buf.len();
            buf.extend_from_slice(&frame.payload);
            apply_mask(&mut buf[start..], key);
        }
        None => buf.extend_from_slice(&frame.payload),
    }
    buf
}

fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
