//! Fixtures shared by unit and integration tests.

use rand::RngCore;

use blockstream_core::{Block, Cid};

use crate::store::MemBlockstore;

/// `count` blocks of `size` random bytes each.
pub fn rand_blocks(count: usize, size: usize) -> Vec<Block> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let mut data = vec![0u8; size];
            rng.fill_bytes(&mut data);
            Block::new(data)
        })
        .collect()
}

/// A store holding `count` random blocks, plus their CIDs in insertion order.
pub fn rand_blockstore(count: usize, size: usize) -> (MemBlockstore, Vec<Cid>) {
    let store = MemBlockstore::new();
    let cids = rand_blocks(count, size)
        .into_iter()
        .map(|block| {
            let cid = *block.cid();
            store.insert(block);
            cid
        })
        .collect();
    (store, cids)
}
