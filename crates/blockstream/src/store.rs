//! Local block storage. The Collector reads from it and
//! sessions optionally write to it.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;

use blockstream_core::{Block, Cid};

pub type DynBlockstore = Arc<dyn Blockstore>;

/// Content-addressed key-value store keyed by [`Cid`].
///
/// Implementations must tolerate concurrent calls; nothing above this trait
/// serializes store access.
pub trait Blockstore: Send + Sync + 'static {
    fn has(&self, cid: Cid) -> BoxFuture<'_, Result<bool, StoreError>>;

    /// Fails with [`StoreError::NotFound`] when the block is absent.
    fn get(&self, cid: Cid) -> BoxFuture<'_, Result<Block, StoreError>>;

    /// Storing a block that is already present is a no-op.
    fn put(&self, block: Block) -> BoxFuture<'_, Result<(), StoreError>>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("block not found: {0}")]
    NotFound(Cid),

    #[error("block store failure: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        StoreError::Backend(e.into())
    }
}

// ── In-memory store ───────────────────────────────────────────────────────────

/// Blockstore held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemBlockstore {
    blocks: Arc<DashMap<Cid, Bytes>>,
}

impl MemBlockstore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Identifiers of every stored block, in no particular order.
    pub fn cids(&self) -> Vec<Cid> {
        self.blocks.iter().map(|e| *e.key()).collect()
    }

    pub fn insert(&self, block: Block) {
        let cid = *block.cid();
        self.blocks.insert(cid, block.into_data());
    }
}

impl Blockstore for MemBlockstore {
    fn has(&self, cid: Cid) -> BoxFuture<'_, Result<bool, StoreError>> {
        Box::pin(async move { Ok(self.blocks.contains_key(&cid)) })
    }

    fn get(&self, cid: Cid) -> BoxFuture<'_, Result<Block, StoreError>> {
        Box::pin(async move {
            let data = self
                .blocks
                .get(&cid)
                .map(|e| e.value().clone())
                .ok_or(StoreError::NotFound(cid))?;
            // Stored blocks were verified on insert.
            Block::checked(cid, data).map_err(StoreError::backend)
        })
    }

    fn put(&self, block: Block) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.insert(block);
            Ok(())
        })
    }
}
