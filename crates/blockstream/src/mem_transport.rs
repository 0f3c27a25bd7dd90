//! In-process [`Transport`] backed by `tokio::io::duplex`.
//!
//! This is NOT a production transport. It only connects transports created
//! from the same [`MemNetwork`], which makes it suitable for tests and
//! simulations of many peers inside one process.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;

use crate::transport::{BoxStream, InboundStream, PeerId, StreamHandler, Transport};

const DUPLEX_BUF_SIZE: usize = 64 * 1024;

type HandlerTable = Arc<DashMap<&'static str, StreamHandler>>;

/// Shared broker routing streams between [`MemTransport`] instances.
#[derive(Clone, Default)]
pub struct MemNetwork {
    peers: Arc<DashMap<PeerId, HandlerTable>>,
}

impl MemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the network under a fresh random identity.
    pub fn add_peer(&self) -> MemTransport {
        let id = PeerId::random();
        let handlers: HandlerTable = Arc::new(DashMap::new());
        self.peers.insert(id, handlers.clone());
        MemTransport {
            id,
            network: self.clone(),
            handlers,
        }
    }

    /// Build `n` transports that can all reach each other.
    pub fn full_mesh(n: usize) -> (Self, Vec<MemTransport>) {
        let network = Self::new();
        let peers = (0..n).map(|_| network.add_peer()).collect();
        (network, peers)
    }

    /// Take `peer` off the network. Dials to it fail from now on; streams
    /// already open keep working until either side drops them.
    pub fn remove_peer(&self, peer: &PeerId) {
        self.peers.remove(peer);
    }
}

impl std::fmt::Debug for MemNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemNetwork")
            .field("peers", &self.peers.len())
            .finish()
    }
}

/// One peer's view of a [`MemNetwork`].
#[derive(Clone)]
pub struct MemTransport {
    id: PeerId,
    network: MemNetwork,
    handlers: HandlerTable,
}

impl std::fmt::Debug for MemTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTransport").field("id", &self.id).finish()
    }
}

impl Transport for MemTransport {
    fn local_peer(&self) -> PeerId {
        self.id
    }

    fn open_stream(
        &self,
        peer: PeerId,
        protocol: &'static str,
    ) -> BoxFuture<'_, std::io::Result<BoxStream>> {
        Box::pin(async move {
            let handler = self
                .network
                .peers
                .get(&peer)
                .and_then(|table| {
                    let handler = table.get(protocol).map(|h| h.value().clone());
                    handler
                })
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        format!("peer {peer} does not serve {protocol}"),
                    )
                })?;

            let (local, remote) = tokio::io::duplex(DUPLEX_BUF_SIZE);
            tracing::trace!(from = %self.id, to = %peer, protocol, "mem stream opened");
            handler(InboundStream {
                remote: self.id,
                stream: Box::new(remote),
            });
            Ok(Box::new(local) as BoxStream)
        })
    }

    fn set_stream_handler(&self, protocol: &'static str, handler: StreamHandler) {
        self.handlers.insert(protocol, handler);
    }

    fn remove_stream_handler(&self, protocol: &'static str) {
        self.handlers.remove(protocol);
    }
}
