//! Transport collaborator. Opens and accepts bidirectional byte streams
//! between peers. BlockStream runs on top of whatever implements [`Transport`].

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

/// Identity of a remote peer as reported by the transport.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

/// Any ordered, reliable, bidirectional byte stream.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> RawStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxStream = Box<dyn RawStream>;

/// A stream opened by a remote peer.
pub struct InboundStream {
    pub remote: PeerId,
    pub stream: BoxStream,
}

impl fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundStream")
            .field("remote", &self.remote)
            .finish()
    }
}

/// Invoked once per inbound stream for a registered protocol.
pub type StreamHandler = Arc<dyn Fn(InboundStream) + Send + Sync>;

pub type DynTransport = Arc<dyn Transport>;

pub trait Transport: Send + Sync + 'static {
    /// Identity other peers see for us.
    fn local_peer(&self) -> PeerId;

    /// Dial `peer` and open a stream speaking `protocol`.
    fn open_stream(
        &self,
        peer: PeerId,
        protocol: &'static str,
    ) -> BoxFuture<'_, std::io::Result<BoxStream>>;

    /// Route every inbound stream for `protocol` to `handler`.
    /// Registering again replaces the previous handler.
    fn set_stream_handler(&self, protocol: &'static str, handler: StreamHandler);

    /// Stop routing inbound streams for `protocol`.
    fn remove_stream_handler(&self, protocol: &'static str);
}
