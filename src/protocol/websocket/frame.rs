//! RFC 6455 frames.
//!
//! ```text
//!   0                   1                   2                   3
//!   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!  +-+-+-+-+-------+-+-------------+-------------------------------+
//!  |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//!  |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//!  |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//!  | |1|2|3|       |K|             |                               |
//!  +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//!  |                               |Masking-key, if MASK set to 1  |
//!  +-------------------------------+-------------------------------+
//!  | Masking-key (continued)       |          Payload Data         |
//!  +-------------------------------- - - - - - - - - - - - - - - - +
//! ```

use std::cell::OnceCell;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Mask key used for frames this side sends masked (client role).
pub const CLIENT_MASK_KEY: [u8; 4] = [0x7a, 0x6d, 0x5a, 0x4d];

/// Close status codes.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const MANDATORY_EXTENSION: u16 = 1010;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const TLS_HANDSHAKE: u16 = 1015;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// XORs `data` with the repeating 4-byte `key`. Applying it twice restores
/// the input.
pub fn apply_mask(key: [u8; 4], data: &mut [u8]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Decoded fixed part of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask_key: Option<[u8; 4]>,
    /// Bytes before the payload, mask key included.
    pub head_len: usize,
    pub payload_len: u64,
}

impl FrameHeader {
    /// `Ok(None)` until every header byte has arrived.
    pub fn parse(buf: &[u8]) -> Result<Option<FrameHeader>, ProtocolError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let fin = buf[0] & 0x80 != 0;
        let opcode =
            Opcode::from_u8(buf[0] & 0x0F).ok_or(ProtocolError::MalformedFrame("unknown opcode"))?;
        let masked = buf[1] & 0x80 != 0;

        let (payload_len, mut head_len) = match buf[1] & 0x7F {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut len = [0u8; 8];
                len.copy_from_slice(&buf[2..10]);
                let len = u64::from_be_bytes(len);
                if len >> 63 != 0 {
                    return Err(ProtocolError::MalformedFrame("payload length overflow"));
                }
                (len, 10)
            }
            n => (n as u64, 2),
        };
        if opcode.is_control() && (payload_len > 125 || !fin) {
            return Err(ProtocolError::MalformedFrame("oversized or fragmented control frame"));
        }

        let mask_key = if masked {
            if buf.len() < head_len + 4 {
                return Ok(None);
            }
            let mut key = [0u8; 4];
            key.copy_from_slice(&buf[head_len..head_len + 4]);
            head_len += 4;
            Some(key)
        } else {
            None
        };

        Ok(Some(FrameHeader {
            fin,
            opcode,
            mask_key,
            head_len,
            payload_len,
        }))
    }

    /// Header plus payload, saturating on 32-bit targets.
    pub fn frame_len(&self) -> usize {
        usize::try_from(self.payload_len)
            .unwrap_or(usize::MAX)
            .saturating_add(self.head_len)
    }
}

/// One WebSocket frame. Immutable once built; the wire encoding is computed
/// on first use and reused afterwards.
pub struct Frame {
    payload: Bytes,
    opcode: Opcode,
    masked: bool,
    fin: bool,
    encoded: OnceCell<Bytes>,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>, opcode: Opcode, masked: bool, fin: bool) -> Self {
        Self {
            payload: payload.into(),
            opcode,
            masked,
            fin,
            encoded: OnceCell::new(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Bytes::from(text.into()), Opcode::Text, false, true)
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(data, Opcode::Binary, false, true)
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(payload, Opcode::Ping, false, true)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(payload, Opcode::Pong, false, true)
    }

    /// Close frame carrying `code` and a UTF-8 `reason`. The reason is cut
    /// to fit the 125-byte control frame limit.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut cut = reason.len().min(123);
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut payload = BytesMut::with_capacity(2 + cut);
        payload.put_u16(code);
        payload.put_slice(&reason.as_bytes()[..cut]);
        Self::new(payload.freeze(), Opcode::Close, false, true)
    }

    /// Same frame, encoded with the client mask.
    pub fn into_masked(self) -> Self {
        Self::new(self.payload, self.opcode, true, self.fin)
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload as text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn is_masked(&self) -> bool {
        self.masked
    }

    pub fn is_fin(&self) -> bool {
        self.fin
    }

    /// Status code of a close frame; `None` for other frames or an empty
    /// close payload.
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != Opcode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_code()?;
        std::str::from_utf8(&self.payload[2..]).ok()
    }

    /// Wire bytes of this frame.
    pub fn encode(&self) -> Bytes {
        self.encoded.get_or_init(|| self.encode_uncached()).clone()
    }

    fn encode_uncached(&self) -> Bytes {
        let len = self.payload.len();
        let mut out = BytesMut::with_capacity(len + 14);
        out.put_u8(((self.fin as u8) << 7) | self.opcode as u8);

        let mask_bit = if self.masked { 0x80 } else { 0 };
        if len <= 125 {
            out.put_u8(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            out.put_u8(mask_bit | 126);
            out.put_u16(len as u16);
        } else {
            out.put_u8(mask_bit | 127);
            out.put_u64(len as u64);
        }

        if self.masked {
            out.put_slice(&CLIENT_MASK_KEY);
            let start = out.len();
            out.put_slice(&self.payload);
            apply_mask(CLIENT_MASK_KEY, &mut out[start..]);
        } else {
            out.put_slice(&self.payload);
        }
        out.freeze()
    }

    /// Decodes one frame from the front of `buf`, unmasking its payload.
    /// Returns the frame and the number of bytes it occupied, or `Ok(None)`
    /// if the frame is not complete yet.
    pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
        let Some(header) = FrameHeader::parse(buf)? else {
            return Ok(None);
        };
        let total = header.frame_len();
        if buf.len() < total {
            return Ok(None);
        }
        let mut payload = buf[header.head_len..total].to_vec();
        if let Some(key) = header.mask_key {
            apply_mask(key, &mut payload);
        }
        let frame = Frame::new(
            payload,
            header.opcode,
            header.mask_key.is_some(),
            header.fin,
        );
        Ok(Some((frame, total)))
    }
}

impl Clone for Frame {
    fn clone(&self) -> Self {
        Self {
            payload: self.payload.clone(),
            opcode: self.opcode,
            masked: self.masked,
            fin: self.fin,
            encoded: self.encoded.clone(),
        }
    }
}

impl From<&str> for Frame {
    fn from(text: &str) -> Self {
        Frame::text(text)
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Frame::text(text)
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.opcode == other.opcode
            && self.fin == other.fin
            && self.masked == other.masked
            && self.payload == other.payload
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("opcode", &self.opcode)
            .field("fin", &self.fin)
            .field("masked", &self.masked)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
