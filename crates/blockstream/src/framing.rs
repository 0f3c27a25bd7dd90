//! Message framing over raw peer streams.
//!
//! Each [`Message`] travels as one length-prefixed frame
//! (`tokio_util::codec::LengthDelimitedCodec`). The typed read/write helpers
//! here name the operation they perform so every failure reaches the caller
//! wrapped with what was being attempted.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use blockstream_core::wire::{MessageKind, WireBlock};
use blockstream_core::{Block, Cid, ErrorCode, Message, Token};

use crate::error::{Error, ErrorCodeExt, Result};
use crate::transport::BoxStream;

fn codec(max_frame_size: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_size)
        .new_codec()
}

pub type StreamReader = MessageReader<ReadHalf<BoxStream>>;
pub type StreamWriter = MessageWriter<WriteHalf<BoxStream>>;

/// Split a raw stream into framed halves.
pub fn split(stream: BoxStream, max_frame_size: usize) -> (StreamReader, StreamWriter) {
    let (r, w) = tokio::io::split(stream);
    (
        MessageReader::new(r, max_frame_size),
        MessageWriter::new(w, max_frame_size),
    )
}

// ── Writer ────────────────────────────────────────────────────────────────────

pub struct MessageWriter<W> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
    max_frame_size: usize,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(io: W, max_frame_size: usize) -> Self {
        Self {
            inner: FramedWrite::new(io, codec(max_frame_size)),
            max_frame_size,
        }
    }

    /// Encode and send one frame. A message that would exceed the frame
    /// limit fails with [`Error::FrameTooLarge`] before anything is written,
    /// leaving the stream usable.
    pub async fn send(&mut self, op: &'static str, msg: &Message) -> Result<()> {
        let frame = msg.encode().map_err(|e| Error::wire(op, e))?;
        if frame.len() > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                op,
                size: frame.len(),
                max: self.max_frame_size,
            });
        }
        self.inner.send(frame).await.map_err(|e| Error::io(op, e))
    }

    pub async fn write_token(&mut self, token: &Token) -> Result<()> {
        self.send("can't write token", &Message::handshake(token))
            .await
    }

    pub async fn write_request(&mut self, id: u32, cids: &[Cid]) -> Result<()> {
        self.send("can't write blocks request", &Message::request(id, cids))
            .await
    }

    /// Write one batch. `err` describes why the request ended, if it did.
    pub async fn write_response(
        &mut self,
        id: u32,
        blocks: &[Block],
        err: Option<&Error>,
    ) -> Result<()> {
        let code = err.map(ErrorCode::for_error).unwrap_or(ErrorCode::Null);
        self.send(
            "can't write blocks response",
            &Message::response(id, blocks, code),
        )
        .await
    }

    /// Flush and shut down the write direction.
    pub async fn close(&mut self) -> Result<()> {
        SinkExt::<Bytes>::close(&mut self.inner)
            .await
            .map_err(|e| Error::io("can't close stream", e))
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// A decoded RESPONSE. `error` is the remote's terminal error for `id`.
#[derive(Debug)]
pub struct BlocksResponse {
    pub id: u32,
    pub blocks: Vec<WireBlock>,
    pub error: Option<Error>,
}

impl BlocksResponse {
    /// True if no further RESPONSE will follow for this id.
    pub fn is_terminal(&self) -> bool {
        self.error.is_some() || self.blocks.is_empty()
    }
}

pub struct MessageReader<R> {
    inner: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(io: R, max_frame_size: usize) -> Self {
        Self {
            inner: FramedRead::new(io, codec(max_frame_size)),
        }
    }

    /// Read the next message. A cleanly closed stream is [`Error::Closed`].
    pub async fn recv(&mut self, op: &'static str) -> Result<Message> {
        match self.inner.next().await {
            Some(Ok(frame)) => Message::decode(frame.freeze()).map_err(|e| Error::wire(op, e)),
            Some(Err(e)) => Err(Error::io(op, e)),
            None => Err(Error::Closed { op }),
        }
    }

    pub async fn read_token(&mut self) -> Result<Token> {
        match self.recv("can't read token").await? {
            Message::Handshake { token } => Ok(token),
            other => Err(unexpected(MessageKind::Handshake, &other)),
        }
    }

    /// Read a REQUEST. CIDs are returned raw; see [`parse_cids`].
    pub async fn read_request(&mut self) -> Result<(u32, Vec<Bytes>)> {
        match self.recv("can't read blocks request").await? {
            Message::Request { id, cids } => Ok((id, cids)),
            other => Err(unexpected(MessageKind::Request, &other)),
        }
    }

    pub async fn read_response(&mut self) -> Result<BlocksResponse> {
        match self.recv("can't read blocks response").await? {
            Message::Response { id, blocks, code } => Ok(BlocksResponse {
                id,
                blocks,
                error: Error::from_code(code),
            }),
            other => Err(unexpected(MessageKind::Response, &other)),
        }
    }
}

fn unexpected(expected: MessageKind, got: &Message) -> Error {
    Error::UnexpectedMessage {
        expected,
        got: got.kind(),
    }
}

/// Parse the raw CIDs of a REQUEST. Any malformed entry fails the whole list.
pub fn parse_cids(raw: &[Bytes]) -> Result<Vec<Cid>> {
    raw.iter()
        .map(|b| Cid::from_bytes(b).map_err(Error::from))
        .collect()
}
