//! Error taxonomy for the protocol engine and its mapping onto wire codes.

use std::error::Error as StdError;

use blockstream_core::wire::{MessageKind, WireError};
use blockstream_core::{BlockError, CidError, ErrorCode, Token};

use crate::store::StoreError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{op}: {source}")]
    Wire {
        op: &'static str,
        #[source]
        source: WireError,
    },

    #[error("{op}: stream closed")]
    Closed { op: &'static str },

    #[error("{op}: frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge {
        op: &'static str,
        size: usize,
        max: usize,
    },

    #[error("unexpected message type: expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: MessageKind,
        got: MessageKind,
    },

    #[error("handshake failed: tokens are not equal (exp: {expected}, recv: {received})")]
    HandshakeMismatch { expected: Token, received: Token },

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("access denied for token {token}: {reason}")]
    AccessDenied { token: Token, reason: String },

    #[error("can't cast cid of requested block: {0}")]
    InvalidCid(#[from] CidError),

    #[error(transparent)]
    Integrity(#[from] BlockError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("remote peer does not have the requested block")]
    RemoteNotFound,

    #[error("unknown error from remote peer")]
    RemoteUnknown,

    #[error("collector is shut down")]
    CollectorClosed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("no usable peers for session")]
    NoUsablePeers,
}

impl Error {
    pub(crate) fn io(op: &'static str, source: std::io::Error) -> Self {
        Error::Io { op, source }
    }

    pub(crate) fn wire(op: &'static str, source: WireError) -> Self {
        Error::Wire { op, source }
    }

    /// True for any not-found condition, local or remote.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::RemoteNotFound | Error::Store(StoreError::NotFound(_))
        )
    }

    /// Reverse of [`ErrorCode::for_error`]. `Null` means no error.
    pub fn from_code(code: ErrorCode) -> Option<Error> {
        match code {
            ErrorCode::Null => None,
            ErrorCode::Unknown => Some(Error::RemoteUnknown),
            ErrorCode::NotFound => Some(Error::RemoteNotFound),
        }
    }
}

/// Maps an internal error onto the wire code space.
pub trait ErrorCodeExt {
    fn for_error(err: &Error) -> ErrorCode;
}

impl ErrorCodeExt for ErrorCode {
    /// Walks `err` and its source chain; the first not-found condition wins,
    /// anything else is Unknown.
    fn for_error(err: &Error) -> ErrorCode {
        if err.is_not_found() {
            return ErrorCode::NotFound;
        }
        let mut cause: Option<&(dyn StdError + 'static)> = err.source();
        while let Some(e) = cause {
            if is_not_found_cause(e) {
                return ErrorCode::NotFound;
            }
            // io::Error::source skips its payload, so look inside explicitly.
            if let Some(inner) = e.downcast_ref::<std::io::Error>().and_then(|io| io.get_ref()) {
                if is_not_found_cause(inner) {
                    return ErrorCode::NotFound;
                }
            }
            cause = e.source();
        }
        ErrorCode::Unknown
    }
}

fn is_not_found_cause(e: &(dyn StdError + 'static)) -> bool {
    if let Some(inner) = e.downcast_ref::<Error>() {
        return inner.is_not_found();
    }
    matches!(e.downcast_ref::<StoreError>(), Some(StoreError::NotFound(_)))
}
