//! blockstream: token-gated block exchange between peers.
//!
//! An [`Endpoint`] serves its local store to authorised peers and opens
//! [`Session`]s that fetch blocks from others. Transport, block storage and
//! access policy are collaborators behind the [`Transport`], [`Blockstore`]
//! and [`AccessGranter`] traits.

pub mod access;
pub mod collector;
pub mod endpoint;
pub mod error;
pub mod framing;
pub mod fs_store;
pub mod handshake;
pub mod mem_transport;
pub mod request;
pub mod sender;
pub mod session;
pub mod store;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
pub mod transport;

pub use access::{AccessGranter, DynAccessGranter, PassingGranter, ReportSender, TokenRegistry};
pub use collector::{Collector, CollectorHandle, CollectorStats};
pub use endpoint::Endpoint;
pub use error::{Error, ErrorCodeExt, Result};
pub use fs_store::FsBlockstore;
pub use mem_transport::{MemNetwork, MemTransport};
pub use request::Request;
pub use sender::{Sender, SenderOutcome};
pub use session::Session;
pub use store::{Blockstore, DynBlockstore, MemBlockstore, StoreError};
pub use transport::{BoxStream, DynTransport, InboundStream, PeerId, StreamHandler, Transport};

pub use blockstream_core::{Block, BlockStreamConfig, Cid, HashCode, Token, PROTOCOL_ID};
