use crate::*;

use blockstream::framing::split;
use blockstream::handshake::give_hand;
use blockstream::testutil::rand_blockstore;
use blockstream::{Error, PROTOCOL_ID};

fn registry_node(
    transport: MemTransport,
    store: &MemBlockstore,
    registry: &TokenRegistry,
) -> Node {
    Node::start(
        transport,
        store.clone(),
        Arc::new(registry.clone()),
        BlockStreamConfig::default(),
    )
}

/// A server that never granted the token refuses the handshake, leaving
/// the requester without usable peers.
#[tokio::test]
async fn test_ungranted_token_is_refused() -> Result<()> {
    init_tracing();
    let (store, _) = rand_blockstore(4, 32);
    let (_net, mut transports) = MemNetwork::full_mesh(2);
    let registry = TokenRegistry::new();
    let server = registry_node(transports.remove(1), &store, &registry);
    let client = Node::start(
        transports.remove(0),
        MemBlockstore::new(),
        Arc::new(PassingGranter),
        BlockStreamConfig::default(),
    );

    let ctx = CancellationToken::new();
    let res = client
        .endpoint
        .session(&ctx, &[server.peer()], Token::from("stranger"))
        .await;
    ensure!(matches!(res, Err(Error::NoUsablePeers)), "expected refusal, got {res:?}");
    ensure!(client.endpoint.active_sessions() == 0);
    ensure!(server.endpoint.active_senders() == 0);

    client.endpoint.close().await;
    server.endpoint.close().await;
    Ok(())
}

/// Granted tokens work, and each handshake counts as a use.
#[tokio::test]
async fn test_granted_token_is_served() -> Result<()> {
    init_tracing();
    let (store, cids) = rand_blockstore(16, 64);
    let (_net, mut transports) = MemNetwork::full_mesh(2);
    let registry = TokenRegistry::new();
    let token = Token::from("friend");
    registry.grant(token.clone());
    let server = registry_node(transports.remove(1), &store, &registry);
    let client = Node::start(
        transports.remove(0),
        MemBlockstore::new(),
        Arc::new(PassingGranter),
        BlockStreamConfig::default(),
    );

    let ctx = CancellationToken::new();
    let session = client
        .endpoint
        .session(&ctx, &[server.peer()], token.clone())
        .await?;
    ensure!(registry.uses(&token) == 1);

    let blocks = collect_within(session.get_blocks(&ctx, cids.clone()).await?, 10).await?;
    assert_exact(&blocks, &cids)?;

    ctx.cancel();
    client.endpoint.close().await;
    server.endpoint.close().await;
    ensure!(registry.is_granted(&token), "clean close must keep the grant");
    Ok(())
}

/// Only the peers that accept the token take part.
#[tokio::test]
async fn test_rejecting_peer_is_dropped() -> Result<()> {
    init_tracing();
    let (store, cids) = rand_blockstore(32, 64);
    let (_net, mut transports) = MemNetwork::full_mesh(3);
    let token = Token::from("partial");

    let open = TokenRegistry::new();
    open.grant(token.clone());
    let closed = TokenRegistry::new();

    let accepting = registry_node(transports.remove(2), &store, &open);
    let rejecting = registry_node(transports.remove(1), &store, &closed);
    let client = Node::start(
        transports.remove(0),
        MemBlockstore::new(),
        Arc::new(PassingGranter),
        BlockStreamConfig::default(),
    );

    let ctx = CancellationToken::new();
    let session = client
        .endpoint
        .session(&ctx, &[accepting.peer(), rejecting.peer()], token)
        .await?;
    ensure!(session.peers() == vec![accepting.peer()]);

    let blocks = collect_within(session.get_blocks(&ctx, cids.clone()).await?, 10).await?;
    assert_exact(&blocks, &cids)?;

    ctx.cancel();
    client.endpoint.close().await;
    accepting.endpoint.close().await;
    rejecting.endpoint.close().await;
    Ok(())
}

/// A requester that breaks protocol after the handshake loses its grant,
/// so later sessions with the same token are refused.
#[tokio::test]
async fn test_protocol_violation_revokes_token() -> Result<()> {
    init_tracing();
    let (store, _) = rand_blockstore(4, 32);
    let (_net, mut transports) = MemNetwork::full_mesh(2);
    let registry = TokenRegistry::new();
    let token = Token::from("reckless");
    registry.grant(token.clone());
    let server = registry_node(transports.remove(1), &store, &registry);
    let rogue = transports.remove(0);

    let config = BlockStreamConfig::default();
    let stream = rogue.open_stream(server.peer(), PROTOCOL_ID).await?;
    let (mut reader, mut writer) = split(stream, config.transfer.max_frame_size);
    give_hand(&mut reader, &mut writer, &token, config.handshake_timeout()).await?;
    // A second HANDSHAKE where a REQUEST belongs.
    writer.write_token(&token).await?;

    eventually(5, || {
        let registry = registry.clone();
        let token = token.clone();
        async move { !registry.is_granted(&token) }
    })
    .await
    .context("token still granted after violation")?;

    let client = Node::start(
        rogue,
        MemBlockstore::new(),
        Arc::new(PassingGranter),
        BlockStreamConfig::default(),
    );
    let ctx = CancellationToken::new();
    let res = client.endpoint.session(&ctx, &[server.peer()], token).await;
    ensure!(matches!(res, Err(Error::NoUsablePeers)), "revoked token accepted");

    drop(writer);
    drop(reader);
    client.endpoint.close().await;
    server.endpoint.close().await;
    Ok(())
}
