//! Binary wire protocol between the SDK and the sandbox daemon.
//!
//! ## Wire Format
//!
//! ```text
//! [4-byte length][1-byte kind][4-byte id][payload]
//! ```
//!
//! - **length**: big-endian u32, size of (kind + id + payload)
//! - **kind**: u8 frame kind
//! - **id**: big-endian u32 correlation id (0 for unsolicited frames)
//! - **payload**: MessagePack-encoded, kind-specific
//!
//! ## Frame Kinds
//!
//! | Kind | Direction | Name    | Payload                           |
//! |------|-----------|---------|-----------------------------------|
//! | 0x01 | C→D       | hello   | [`Hello`] (access token)          |
//! | 0x02 | D→C       | welcome | (empty)                           |
//! | 0x03 | C→D       | call    | [`Request`]                       |
//! | 0x04 | D→C       | reply   | [`Response`]                      |
//! | 0x05 | D→C       | fail    | [`WireError`]                     |
//! | 0x06 | D→C       | event   | [`StreamEvent`], id = operation   |
//! | 0x07 | D→C       | bye     | [`WireError`], id = 0             |
//!
//! A `call` is answered by exactly one `reply` or `fail` carrying the same
//! id. Stream-opening calls (process start, PTY create, process connect,
//! watch start) additionally produce `event` frames whose id equals the
//! call id, ending with a terminal [`StreamEvent::End`] or
//! [`StreamEvent::Stopped`]. `bye` announces that the daemon is going away
//! (sandbox expiry or pause) and carries the reason.

mod types;

pub use types::{
    EntryInfo, FsEventKind, FsNotification, Hello, ProcessInfo, Request, Response, Status,
    StreamEvent, WireError, status_code,
};

/// Header size (4-byte length prefix).
pub const HEADER_SIZE: usize = 4;

/// Maximum frame body size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Minimum body size: kind (1) + id (4).
pub const MIN_BODY_SIZE: usize = 5;

// Frame kind constants.
pub const KIND_HELLO: u8 = 0x01;
pub const KIND_WELCOME: u8 = 0x02;
pub const KIND_CALL: u8 = 0x03;
pub const KIND_REPLY: u8 = 0x04;
pub const KIND_FAIL: u8 = 0x05;
pub const KIND_EVENT: u8 = 0x06;
pub const KIND_BYE: u8 = 0x07;

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too large: {0}")]
    FrameTooLarge(usize),

    #[error("frame too small: {0}")]
    FrameTooSmall(usize),

    #[error("unknown frame kind: 0x{0:02X}")]
    UnknownKind(u8),

    #[error("payload encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("payload decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Read a `u8` from `data` at `offset`. Returns `None` if out of bounds.
fn read_u8_at(data: &[u8], offset: usize) -> Option<u8> {
    data.get(offset).copied()
}

/// Read a `u32` from `data` at `offset`. Returns `None` if out of bounds.
fn read_u32_at(data: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// A raw decoded frame: kind + correlation id + undecoded payload.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub kind: u8,
    pub id: u32,
    pub payload: Vec<u8>,
}

/// A fully decoded frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Hello(Hello),
    Welcome,
    Call { id: u32, request: Request },
    Reply { id: u32, response: Response },
    Fail { id: u32, error: WireError },
    Event { id: u32, event: StreamEvent },
    Bye(WireError),
}

impl Frame {
    /// Encode to wire bytes: `[4-byte length][1-byte kind][4-byte id][payload]`.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let (kind, id, payload) = match self {
            Frame::Hello(hello) => (KIND_HELLO, 0, rmp_serde::to_vec_named(hello)?),
            Frame::Welcome => (KIND_WELCOME, 0, Vec::new()),
            Frame::Call { id, request } => (KIND_CALL, *id, rmp_serde::to_vec_named(request)?),
            Frame::Reply { id, response } => (KIND_REPLY, *id, rmp_serde::to_vec_named(response)?),
            Frame::Fail { id, error } => (KIND_FAIL, *id, rmp_serde::to_vec_named(error)?),
            Frame::Event { id, event } => (KIND_EVENT, *id, rmp_serde::to_vec_named(event)?),
            Frame::Bye(error) => (KIND_BYE, 0, rmp_serde::to_vec_named(error)?),
        };
        encode_raw(kind, id, &payload)
    }

    /// Decode a [`RawFrame`] into a typed frame.
    pub fn decode(raw: &RawFrame) -> Result<Frame, ProtocolError> {
        match raw.kind {
            KIND_HELLO => Ok(Frame::Hello(rmp_serde::from_slice(&raw.payload)?)),
            KIND_WELCOME => Ok(Frame::Welcome),
            KIND_CALL => Ok(Frame::Call {
                id: raw.id,
                request: rmp_serde::from_slice(&raw.payload)?,
            }),
            KIND_REPLY => Ok(Frame::Reply {
                id: raw.id,
                response: rmp_serde::from_slice(&raw.payload)?,
            }),
            KIND_FAIL => Ok(Frame::Fail {
                id: raw.id,
                error: rmp_serde::from_slice(&raw.payload)?,
            }),
            KIND_EVENT => Ok(Frame::Event {
                id: raw.id,
                event: rmp_serde::from_slice(&raw.payload)?,
            }),
            KIND_BYE => Ok(Frame::Bye(rmp_serde::from_slice(&raw.payload)?)),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// Encode a raw frame: `[4-byte length][1-byte kind][4-byte id][payload]`.
pub fn encode_raw(kind: u8, id: u32, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let body_len = 1 + 4 + payload.len();
    if body_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body_len));
    }
    let mut buf = Vec::with_capacity(HEADER_SIZE + body_len);
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    buf.push(kind);
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Decoder (buffered, handles partial reads)
// ---------------------------------------------------------------------------

/// Buffered frame decoder for streaming data.
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(64 * 1024),
        }
    }

    /// Feed data and extract complete raw frames.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<RawFrame>, ProtocolError> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        let mut offset = 0;

        while offset + HEADER_SIZE <= self.buf.len() {
            let length = match read_u32_at(&self.buf, offset) {
                Some(v) => v as usize,
                None => break,
            };

            if length > MAX_FRAME_SIZE {
                self.buf.clear();
                return Err(ProtocolError::FrameTooLarge(length));
            }
            if length < MIN_BODY_SIZE {
                self.buf.clear();
                return Err(ProtocolError::FrameTooSmall(length));
            }

            let total = HEADER_SIZE + length;
            if offset + total > self.buf.len() {
                break;
            }

            let kind = match read_u8_at(&self.buf, offset + HEADER_SIZE) {
                Some(v) => v,
                None => break,
            };
            let id = match read_u32_at(&self.buf, offset + HEADER_SIZE + 1) {
                Some(v) => v,
                None => break,
            };
            let payload = self
                .buf
                .get(offset + HEADER_SIZE + MIN_BODY_SIZE..offset + total)
                .unwrap_or_default()
                .to_vec();

            frames.push(RawFrame { kind, id, payload });
            offset += total;
        }

        // Compact: remove consumed bytes once at the end
        if offset > 0 {
            self.buf.drain(..offset);
        }

        Ok(frames)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
