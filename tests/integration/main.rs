//! BlockStream integration harness.
//!
//! Every test builds its own in-process network out of `MemNetwork`, so
//! tests are independent of each other and need no privileges:
//!
//!   cargo test --test integration
//!   RUST_LOG=blockstream=debug cargo test --test integration -- --nocapture
//!
//! Each test closes the endpoints it starts.

mod access_control;
mod failures;
mod mesh;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Once;
use std::time::Duration;

pub use std::sync::Arc;

pub use anyhow::{bail, ensure, Context, Result};
pub use tokio::sync::mpsc;
pub use tokio_util::sync::CancellationToken;

pub use blockstream::{
    Block, BlockStreamConfig, Cid, DynAccessGranter, Endpoint, MemBlockstore, MemNetwork,
    MemTransport, PassingGranter, PeerId, Session, Token, TokenRegistry, Transport,
};

// ── Harness ───────────────────────────────────────────────────────────────────

static TRACING: Once = Once::new();

/// Route `tracing` output through the test writer, filtered by RUST_LOG.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// One participant: a transport, its store and the endpoint serving it.
pub struct Node {
    pub transport: MemTransport,
    pub store: MemBlockstore,
    pub endpoint: Endpoint,
}

impl Node {
    pub fn start(
        transport: MemTransport,
        store: MemBlockstore,
        granter: DynAccessGranter,
        config: BlockStreamConfig,
    ) -> Self {
        let endpoint = Endpoint::new(
            Arc::new(transport.clone()),
            Arc::new(store.clone()),
            granter,
            config,
        );
        Self {
            transport,
            store,
            endpoint,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.transport.local_peer()
    }
}

/// `n` fully meshed nodes sharing `store`, all granting every token.
pub fn spawn_mesh(n: usize, store: &MemBlockstore, config: &BlockStreamConfig) -> Vec<Node> {
    init_tracing();
    let (_net, transports) = MemNetwork::full_mesh(n);
    transports
        .into_iter()
        .map(|t| Node::start(t, store.clone(), Arc::new(PassingGranter), config.clone()))
        .collect()
}

/// Everyone but `nodes[i]`.
pub fn others(nodes: &[Node], i: usize) -> Vec<PeerId> {
    nodes
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != i)
        .map(|(_, n)| n.peer())
        .collect()
}

/// Drain a `get_blocks` channel until it closes.
pub async fn collect(mut rx: mpsc::Receiver<Block>) -> Vec<Block> {
    let mut out = Vec::new();
    while let Some(block) = rx.recv().await {
        out.push(block);
    }
    out
}

/// Drain with an upper bound on how long the channel may stay open.
pub async fn collect_within(rx: mpsc::Receiver<Block>, secs: u64) -> Result<Vec<Block>> {
    tokio::time::timeout(Duration::from_secs(secs), collect(rx))
        .await
        .context("get_blocks channel never closed")
}

/// Fail unless `blocks` is exactly `want`: no duplicates, nothing missing,
/// every payload hashing to its CID.
pub fn assert_exact(blocks: &[Block], want: &[Cid]) -> Result<()> {
    let got: HashSet<Cid> = blocks.iter().map(|b| *b.cid()).collect();
    ensure!(
        got.len() == blocks.len(),
        "{} duplicate blocks delivered",
        blocks.len() - got.len()
    );
    let want: HashSet<Cid> = want.iter().copied().collect();
    ensure!(
        got == want,
        "delivered {} of {} wanted, {} unexpected",
        got.intersection(&want).count(),
        want.len(),
        got.difference(&want).count()
    );
    for block in blocks {
        ensure!(block.cid().matches(block.data()), "corrupted block {}", block.cid());
    }
    Ok(())
}

/// Poll `check` until it holds or `secs` elapse.
pub async fn eventually<F, Fut>(secs: u64, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("condition not met within {secs}s")
}

pub async fn close_all(nodes: &[Node]) {
    for node in nodes {
        node.endpoint.close().await;
    }
}
