use crate::*;

use blockstream::testutil::rand_blockstore;
use blockstream::{Blockstore, FsBlockstore};

/// Five fully meshed peers, each fetching the whole 256-block set from the
/// other four at once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_five_peer_mesh() -> Result<()> {
    const NODES: usize = 5;
    let (store, cids) = rand_blockstore(256, 64);
    let nodes = spawn_mesh(NODES, &store, &BlockStreamConfig::default());
    let token = Token::from("test");
    let ctx = CancellationToken::new();

    let peer_sets: Vec<Vec<PeerId>> = (0..NODES).map(|i| others(&nodes, i)).collect();
    let opened = futures::future::join_all(
        nodes
            .iter()
            .zip(&peer_sets)
            .map(|(n, peers)| n.endpoint.session(&ctx, peers, token.clone())),
    )
    .await;
    let sessions = opened.into_iter().collect::<blockstream::Result<Vec<_>>>()?;
    for s in &sessions {
        ensure!(s.peers().len() == NODES - 1, "session lost peers");
    }

    let mut calls = Vec::new();
    for s in &sessions {
        calls.push(s.get_blocks(&ctx, cids.clone()).await?);
    }
    for rx in calls {
        let blocks = collect_within(rx, 30).await?;
        assert_exact(&blocks, &cids)?;
    }

    for n in &nodes {
        ensure!(n.endpoint.active_sessions() == 1, "session not registered");
    }
    ctx.cancel();
    close_all(&nodes).await;
    for n in &nodes {
        ensure!(n.endpoint.active_sessions() == 0, "session left registered");
        ensure!(n.endpoint.active_senders() == 0, "sender left registered");
    }
    Ok(())
}

/// Asking twice for the same set on one Session yields it twice.
#[tokio::test]
async fn test_rerequest_same_set() -> Result<()> {
    let (store, cids) = rand_blockstore(64, 64);
    let nodes = spawn_mesh(3, &store, &BlockStreamConfig::default());
    let ctx = CancellationToken::new();
    let session = nodes[0]
        .endpoint
        .session(&ctx, &others(&nodes, 0), Token::from("again"))
        .await?;

    for _ in 0..2 {
        let blocks = collect_within(session.get_blocks(&ctx, cids.clone()).await?, 10).await?;
        assert_exact(&blocks, &cids)?;
    }

    ctx.cancel();
    close_all(&nodes).await;
    Ok(())
}

/// Independent calls interleave on the same streams.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_calls_on_one_session() -> Result<()> {
    let (store, cids) = rand_blockstore(128, 128);
    let nodes = spawn_mesh(3, &store, &BlockStreamConfig::default());
    let ctx = CancellationToken::new();
    let session = nodes[0]
        .endpoint
        .session(&ctx, &others(&nodes, 0), Token::from("parallel"))
        .await?;

    let chunks: Vec<Vec<Cid>> = cids.chunks(32).map(<[Cid]>::to_vec).collect();
    let mut calls = Vec::new();
    for chunk in &chunks {
        calls.push(session.get_blocks(&ctx, chunk.clone()).await?);
    }
    let results = futures::future::join_all(calls.into_iter().map(|rx| collect_within(rx, 10))).await;
    for (chunk, blocks) in chunks.iter().zip(results) {
        assert_exact(&blocks?, chunk)?;
    }

    ctx.cancel();
    close_all(&nodes).await;
    Ok(())
}

/// Batch size does not change what is delivered, down to blocks larger
/// than a whole batch.
#[tokio::test]
async fn test_any_batch_size_delivers_everything() -> Result<()> {
    let (store, cids) = rand_blockstore(48, 64);
    for max in [10, 64, 100, 1000, 1 << 20] {
        let mut config = BlockStreamConfig::default();
        config.transfer.max_message_size = max;
        let nodes = spawn_mesh(2, &store, &config);
        let ctx = CancellationToken::new();
        let session = nodes[0]
            .endpoint
            .session(&ctx, &others(&nodes, 0), Token::from("sizes"))
            .await?;

        let blocks = collect_within(session.get_blocks(&ctx, cids.clone()).await?, 10).await?;
        assert_exact(&blocks, &cids).with_context(|| format!("max_message_size = {max}"))?;

        ctx.cancel();
        close_all(&nodes).await;
    }
    Ok(())
}

/// With auto_save on, everything received lands in the requester's store.
#[tokio::test]
async fn test_auto_save_into_fs_store() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let (remote_store, cids) = rand_blockstore(32, 256);

    let (_net, mut transports) = MemNetwork::full_mesh(2);
    let server = Node::start(
        transports.remove(1),
        remote_store,
        Arc::new(PassingGranter),
        BlockStreamConfig::default(),
    );
    let local = FsBlockstore::new(dir.path())?;
    let client = Endpoint::new(
        Arc::new(transports.remove(0)),
        Arc::new(local.clone()),
        Arc::new(PassingGranter),
        BlockStreamConfig::default().with_auto_save(),
    );

    let ctx = CancellationToken::new();
    let session = client
        .session(&ctx, &[server.peer()], Token::from("keep"))
        .await?;
    let blocks = collect_within(session.get_blocks(&ctx, cids.clone()).await?, 10).await?;
    assert_exact(&blocks, &cids)?;

    ensure!(local.count() == cids.len(), "fs store holds {} blocks", local.count());
    for cid in &cids {
        ensure!(client.store().has(*cid).await?, "{cid} not saved");
    }

    ctx.cancel();
    client.close().await;
    server.endpoint.close().await;
    Ok(())
}
