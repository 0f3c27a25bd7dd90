//! BlockStream wire format: the three message shapes exchanged on a stream.
//!
//! Every message is one frame. A frame body starts with a fixed
//! [`FrameHeader`] followed by the token bytes and `item_count` items:
//!
//!   HANDSHAKE  token
//!   REQUEST    item = len:u32 | cid bytes
//!   RESPONSE   item = cid_len:u32 | cid bytes | data_len:u32 | data
//!
//! All integers are little-endian. CIDs travel as raw bytes so that a
//! malformed identifier fails the request it belongs to rather than the
//! whole stream. Framing (the outer length prefix) is the transport
//! layer's job; this module only turns a frame body into a [`Message`]
//! and back.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::block::Block;
use crate::cid::Cid;
use crate::token::Token;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Protocol identifier registered with the transport.
pub const PROTOCOL_ID: &str = "/blockstream/1.0.0";

/// Current frame format version.
pub const WIRE_VERSION: u8 = 0x01;

/// Default upper bound on the combined block payload of one RESPONSE.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 << 20;

/// Default upper bound on a single frame, header and lengths included.
/// Larger than the message size so a lone oversized block still fits.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 << 20;

/// Default handshake timeout in seconds.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 5;

// ── Frame Header ──────────────────────────────────────────────────────────────

/// Fixed prefix of every frame body.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Frame format version. Currently 0x01.
    pub version: u8,

    /// [`MessageKind`] discriminant.
    pub kind: u8,

    /// [`ErrorCode`] discriminant. Zero for anything but RESPONSE.
    pub error_code: u8,

    /// Reserved, must be zero.
    pub flags: u8,

    /// Correlation id of a REQUEST and all RESPONSEs answering it.
    pub id: u32,

    /// Length of the token that follows the header.
    pub token_len: u32,

    /// Number of items after the token.
    pub item_count: u32,
}

assert_eq_size!(FrameHeader, [u8; 16]);

/// Header length in bytes.
pub const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

// ── Kinds & Codes ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Handshake = 0,
    Request = 1,
    Response = 2,
}

impl MessageKind {
    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Handshake => "HANDSHAKE",
            MessageKind::Request => "REQUEST",
            MessageKind::Response => "RESPONSE",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageKind::Handshake),
            1 => Ok(MessageKind::Request),
            2 => Ok(MessageKind::Response),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// Outcome code carried by a RESPONSE. One code covers the whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ErrorCode {
    /// No error.
    #[default]
    Null = 0,
    /// Any failure without a more specific code.
    Unknown = 1,
    /// Requested content is absent from the responder's store.
    NotFound = 2,
}

impl ErrorCode {
    pub fn is_null(self) -> bool {
        self == ErrorCode::Null
    }
}

impl TryFrom<u8> for ErrorCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ErrorCode::Null),
            1 => Ok(ErrorCode::Unknown),
            2 => Ok(ErrorCode::NotFound),
            other => Err(WireError::UnknownErrorCode(other)),
        }
    }
}

impl From<ErrorCode> for u8 {
    fn from(c: ErrorCode) -> u8 {
        c as u8
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// A block as it travels in a RESPONSE: claimed identifier plus raw payload.
/// Nothing about it is verified until the receiver checks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireBlock {
    pub cid: Bytes,
    pub data: Bytes,
}

impl From<&Block> for WireBlock {
    fn from(b: &Block) -> Self {
        Self {
            cid: Bytes::copy_from_slice(&b.cid().to_bytes()),
            data: b.data().clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake {
        token: Token,
    },
    Request {
        id: u32,
        cids: Vec<Bytes>,
    },
    Response {
        id: u32,
        blocks: Vec<WireBlock>,
        code: ErrorCode,
    },
}

impl Message {
    pub fn handshake(token: &Token) -> Self {
        Message::Handshake {
            token: token.clone(),
        }
    }

    pub fn request(id: u32, cids: &[Cid]) -> Self {
        Message::Request {
            id,
            cids: cids
                .iter()
                .map(|c| Bytes::copy_from_slice(&c.to_bytes()))
                .collect(),
        }
    }

    pub fn response(id: u32, blocks: &[Block], code: ErrorCode) -> Self {
        Message::Response {
            id,
            blocks: blocks.iter().map(WireBlock::from).collect(),
            code,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Handshake { .. } => MessageKind::Handshake,
            Message::Request { .. } => MessageKind::Request,
            Message::Response { .. } => MessageKind::Response,
        }
    }

    /// Encode into a frame body.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let (id, token, code, count) = match self {
            Message::Handshake { token } => (0, token.as_bytes(), ErrorCode::Null, 0),
            Message::Request { id, cids } => (*id, &[][..], ErrorCode::Null, cids.len()),
            Message::Response { id, blocks, code } => (*id, &[][..], *code, blocks.len()),
        };

        let header = FrameHeader {
            version: WIRE_VERSION,
            kind: self.kind() as u8,
            error_code: code.into(),
            flags: 0,
            id: id.to_le(),
            token_len: len_u32(token.len())?.to_le(),
            item_count: len_u32(count)?.to_le(),
        };

        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.body_len());
        buf.put_slice(header.as_bytes());
        buf.put_slice(token);

        match self {
            Message::Handshake { .. } => {}
            Message::Request { cids, .. } => {
                for cid in cids {
                    put_chunk(&mut buf, cid)?;
                }
            }
            Message::Response { blocks, .. } => {
                for block in blocks {
                    put_chunk(&mut buf, &block.cid)?;
                    put_chunk(&mut buf, &block.data)?;
                }
            }
        }

        Ok(buf.freeze())
    }

    /// Decode a frame body. Payload slices share `frame`'s allocation.
    pub fn decode(mut frame: Bytes) -> Result<Self, WireError> {
        if frame.len() < HEADER_LEN {
            return Err(WireError::Truncated);
        }
        let header = FrameHeader::read_from_prefix(&frame[..HEADER_LEN])
            .ok_or(WireError::Truncated)?;
        frame.advance(HEADER_LEN);

        // Copy packed fields out before use.
        let version = header.version;
        let flags = header.flags;
        let id = u32::from_le(header.id);
        let token_len = u32::from_le(header.token_len) as usize;
        let count = u32::from_le(header.item_count) as usize;

        if version != WIRE_VERSION {
            return Err(WireError::UnknownVersion(version));
        }
        if flags != 0 {
            return Err(WireError::ReservedFlagsSet(flags));
        }
        let kind = MessageKind::try_from(header.kind)?;
        let code = ErrorCode::try_from(header.error_code)?;

        if frame.len() < token_len {
            return Err(WireError::Truncated);
        }
        let token = frame.split_to(token_len);

        // Each item is at least one length prefix; don't trust `count` blindly.
        let cap = count.min(frame.len() / 4);

        let msg = match kind {
            MessageKind::Handshake => Message::Handshake {
                token: Token::new(token),
            },
            MessageKind::Request => {
                let mut cids = Vec::with_capacity(cap);
                for _ in 0..count {
                    cids.push(take_chunk(&mut frame)?);
                }
                Message::Request { id, cids }
            }
            MessageKind::Response => {
                let mut blocks = Vec::with_capacity(cap);
                for _ in 0..count {
                    let cid = take_chunk(&mut frame)?;
                    let data = take_chunk(&mut frame)?;
                    blocks.push(WireBlock { cid, data });
                }
                Message::Response { id, blocks, code }
            }
        };

        if !frame.is_empty() {
            return Err(WireError::TrailingBytes(frame.len()));
        }
        Ok(msg)
    }

    fn body_len(&self) -> usize {
        match self {
            Message::Handshake { token } => token.as_bytes().len(),
            Message::Request { cids, .. } => cids.iter().map(|c| 4 + c.len()).sum(),
            Message::Response { blocks, .. } => blocks
                .iter()
                .map(|b| 8 + b.cid.len() + b.data.len())
                .sum(),
        }
    }
}

fn len_u32(len: usize) -> Result<u32, WireError> {
    u32::try_from(len).map_err(|_| WireError::TooLarge(len))
}

fn put_chunk(buf: &mut BytesMut, chunk: &[u8]) -> Result<(), WireError> {
    buf.put_u32_le(len_u32(chunk.len())?);
    buf.put_slice(chunk);
    Ok(())
}

fn take_chunk(frame: &mut Bytes) -> Result<Bytes, WireError> {
    if frame.len() < 4 {
        return Err(WireError::Truncated);
    }
    let len = frame.get_u32_le() as usize;
    if frame.len() < len {
        return Err(WireError::Truncated);
    }
    Ok(frame.split_to(len))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame truncated")]
    Truncated,

    #[error("unknown frame version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("unknown message kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("unknown error code: 0x{0:02x}")]
    UnknownErrorCode(u8),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("length {0} does not fit the wire format")]
    TooLarge(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
