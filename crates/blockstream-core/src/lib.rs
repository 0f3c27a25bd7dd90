//! blockstream-core: content identifiers, blocks, tokens, wire format and
//! configuration. All other BlockStream crates depend on this one.

pub mod block;
pub mod cid;
pub mod config;
pub mod token;
pub mod wire;

pub use block::{Block, BlockError};
pub use cid::{Cid, CidError, HashCode};
pub use config::BlockStreamConfig;
pub use token::Token;
pub use wire::{ErrorCode, Message, MessageKind, WireError, PROTOCOL_ID};
