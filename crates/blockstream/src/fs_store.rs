//! Filesystem-backed blockstore.
//!
//! Blocks are stored by CID in a two-level directory structure:
//!   {root}/{hex[0..2]}/{full_hex}
//!
//! This is the same layout Git uses for objects. Files are immutable:
//! if the file exists, the content is correct. No TTLs, no invalidation.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use memmap2::Mmap;

use blockstream_core::{Block, Cid};

use crate::store::{Blockstore, StoreError};

/// Content-addressed on-disk blockstore.
#[derive(Debug, Clone)]
pub struct FsBlockstore {
    root: Arc<PathBuf>,
}

impl FsBlockstore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(StoreError::backend)?;
        Ok(Self {
            root: Arc::new(root),
        })
    }

    /// Count stored blocks (for stats/debugging).
    pub fn count(&self) -> usize {
        let mut total = 0;
        if let Ok(entries) = fs::read_dir(self.root.as_path()) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    total += subdir
                        .flatten()
                        .filter(|f| f.path().extension().is_none())
                        .count();
                }
            }
        }
        total
    }

    /// Total stored bytes (for stats/debugging).
    pub fn size(&self) -> u64 {
        let mut total = 0u64;
        if let Ok(entries) = fs::read_dir(self.root.as_path()) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    for file in subdir.flatten() {
                        if let Ok(meta) = file.metadata() {
                            total += meta.len();
                        }
                    }
                }
            }
        }
        total
    }

    fn block_path(&self, cid: &Cid) -> PathBuf {
        let hex = cid.to_string();
        // Two-level: blocks/01/011e20...
        self.root.join(&hex[0..2]).join(&hex)
    }

    fn read(&self, cid: Cid) -> Result<Block, StoreError> {
        let path = self.block_path(&cid);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(cid))
            }
            Err(e) => return Err(StoreError::backend(e)),
        };

        let len = file.metadata().map_err(StoreError::backend)?.len();
        let data = if len == 0 {
            // mmap of an empty file fails on some platforms.
            Bytes::new()
        } else {
            // Safety: the file is opened read-only and never mutated in place;
            // writers only ever rename a complete file over a missing path.
            let mmap = unsafe { Mmap::map(&file) }.map_err(StoreError::backend)?;
            Bytes::copy_from_slice(&mmap)
        };

        Block::checked(cid, data).map_err(StoreError::backend)
    }

    fn write(&self, block: &Block) -> Result<(), StoreError> {
        let path = self.block_path(block.cid());
        if path.exists() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(StoreError::backend)?;
        }

        // Atomic write: tmp file → rename. The tmp name is unique per writer
        // so concurrent puts of the same block don't clobber each other.
        let tmp_path = path.with_extension(format!("tmp{}", rand::random::<u32>()));
        {
            let mut file = fs::File::create(&tmp_path).map_err(StoreError::backend)?;
            file.write_all(block.data()).map_err(StoreError::backend)?;
            file.sync_all().map_err(StoreError::backend)?;
        }
        fs::rename(&tmp_path, &path).map_err(StoreError::backend)?;

        tracing::trace!(cid = %block.cid(), len = block.len(), "block stored");
        Ok(())
    }
}

impl Blockstore for FsBlockstore {
    fn has(&self, cid: Cid) -> BoxFuture<'_, Result<bool, StoreError>> {
        let path = self.block_path(&cid);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || path.exists())
                .await
                .map_err(StoreError::backend)
        })
    }

    fn get(&self, cid: Cid) -> BoxFuture<'_, Result<Block, StoreError>> {
        let this = self.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || this.read(cid))
                .await
                .map_err(StoreError::backend)?
        })
    }

    fn put(&self, block: Block) -> BoxFuture<'_, Result<(), StoreError>> {
        let this = self.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || this.write(&block))
                .await
                .map_err(StoreError::backend)?
        })
    }
}
