use std::time::Duration;

use bytes::Bytes;

use crate::*;

use blockstream::framing::split;
use blockstream::testutil::{rand_blocks, rand_blockstore};
use blockstream::{Error, InboundStream, PROTOCOL_ID};
use blockstream_core::wire::WireBlock;
use blockstream_core::{ErrorCode, Message};

/// Answers every request with garbage payloads under the requested CIDs.
async fn corrupt_responder(inbound: InboundStream) -> blockstream::Result<()> {
    let (mut reader, mut writer) = split(inbound.stream, 1 << 20);
    let token = reader.read_token().await?;
    writer.write_token(&token).await?;
    loop {
        let (id, cids) = reader.read_request().await?;
        let blocks = cids
            .into_iter()
            .map(|cid| WireBlock {
                cid,
                data: Bytes::from_static(b"definitely not what you asked for"),
            })
            .collect();
        let msg = Message::Response {
            id,
            blocks,
            code: ErrorCode::Null,
        };
        writer.send("can't write corrupt response", &msg).await?;
        writer.write_response(id, &[], None).await?;
    }
}

fn serve_corrupted(transport: &MemTransport) {
    transport.set_stream_handler(
        PROTOCOL_ID,
        Arc::new(|inbound: InboundStream| {
            tokio::spawn(async move {
                let _ = corrupt_responder(inbound).await;
            });
        }),
    );
}

/// CIDs nobody has are simply missing; the channel still closes.
#[tokio::test]
async fn test_missing_blocks_close_channel() -> Result<()> {
    let (store, cids) = rand_blockstore(24, 64);
    let nodes = spawn_mesh(3, &store, &BlockStreamConfig::default());
    let ctx = CancellationToken::new();
    let session = nodes[0]
        .endpoint
        .session(&ctx, &others(&nodes, 0), Token::from("gaps"))
        .await?;

    let absent: Vec<Cid> = rand_blocks(4, 64).iter().map(|b| *b.cid()).collect();
    let mut wanted = cids.clone();
    wanted.extend(&absent);

    let blocks = collect_within(session.get_blocks(&ctx, wanted).await?, 10).await?;
    assert_exact(&blocks, &cids)?;

    ctx.cancel();
    close_all(&nodes).await;
    Ok(())
}

/// Corrupted payloads are never delivered; honest peers fill in.
#[tokio::test]
async fn test_corrupted_peer_is_excluded() -> Result<()> {
    init_tracing();
    let (store, cids) = rand_blockstore(32, 64);
    let (_net, mut transports) = MemNetwork::full_mesh(3);
    let liar = transports.remove(2);
    serve_corrupted(&liar);
    let honest = Node::start(
        transports.remove(1),
        store,
        Arc::new(PassingGranter),
        BlockStreamConfig::default(),
    );
    let client = Node::start(
        transports.remove(0),
        MemBlockstore::new(),
        Arc::new(PassingGranter),
        BlockStreamConfig::default().with_auto_save(),
    );

    let ctx = CancellationToken::new();
    let both = client
        .endpoint
        .session(&ctx, &[liar.local_peer(), honest.peer()], Token::from("trust"))
        .await?;
    let blocks = collect_within(both.get_blocks(&ctx, cids.clone()).await?, 10).await?;
    assert_exact(&blocks, &cids)?;

    // Nothing but the liar: the channel closes empty and nothing is saved.
    let fresh: Vec<Cid> = rand_blocks(8, 64).iter().map(|b| *b.cid()).collect();
    let only_liar = client
        .endpoint
        .session(&ctx, &[liar.local_peer()], Token::from("trust"))
        .await?;
    let blocks = collect_within(only_liar.get_blocks(&ctx, fresh).await?, 10).await?;
    ensure!(blocks.is_empty(), "{} corrupted blocks delivered", blocks.len());
    ensure!(client.store.len() == cids.len(), "corrupted block saved");

    ctx.cancel();
    client.endpoint.close().await;
    honest.endpoint.close().await;
    Ok(())
}

/// Ending the Session's context closes open calls and deregisters it on
/// both sides.
#[tokio::test]
async fn test_session_ends_with_context() -> Result<()> {
    let (store, cids) = rand_blockstore(256, 1024);
    let mut config = BlockStreamConfig::default();
    config.transfer.max_message_size = 1024;
    config.session.output_buffer = 1;
    let nodes = spawn_mesh(2, &store, &config);

    let ctx = CancellationToken::new();
    let session = nodes[0]
        .endpoint
        .session(&ctx, &others(&nodes, 0), Token::from("short"))
        .await?;
    let mut rx = session.get_blocks(&ctx, cids.clone()).await?;
    ensure!(rx.recv().await.is_some(), "nothing arrived");

    ctx.cancel();
    let rest = collect_within(rx, 5).await?;
    ensure!(rest.len() < cids.len() - 1, "call ran to completion despite cancel");

    let (client, server) = (&nodes[0], &nodes[1]);
    eventually(5, move || async move { client.endpoint.active_sessions() == 0 }).await?;
    eventually(5, move || async move { server.endpoint.active_senders() == 0 }).await?;
    ensure!(matches!(
        session.get_blocks(&CancellationToken::new(), cids).await,
        Err(Error::Cancelled)
    ));

    close_all(&nodes).await;
    Ok(())
}

/// close() waits for live Sessions and Senders instead of cutting them off.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_drains_gracefully() -> Result<()> {
    let (store, cids) = rand_blockstore(64, 256);
    let mut nodes = spawn_mesh(2, &store, &BlockStreamConfig::default());
    let ctx = CancellationToken::new();
    let session = nodes[0]
        .endpoint
        .session(&ctx, &others(&nodes, 0), Token::from("drain"))
        .await?;

    let server = nodes.pop().context("two nodes")?;
    let closing = tokio::spawn(async move {
        server.endpoint.close().await;
        server
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    ensure!(!closing.is_finished(), "close returned with a live sender");

    // The transfer in flight is unaffected.
    let blocks = collect_within(session.get_blocks(&ctx, cids.clone()).await?, 10).await?;
    assert_exact(&blocks, &cids)?;

    ctx.cancel();
    let server = tokio::time::timeout(Duration::from_secs(5), closing)
        .await
        .context("close never returned")??;
    ensure!(server.endpoint.active_senders() == 0);

    // A closed endpoint accepts nobody.
    let ctx = CancellationToken::new();
    let res = nodes[0]
        .endpoint
        .session(&ctx, &[server.peer()], Token::from("late"))
        .await;
    ensure!(matches!(res, Err(Error::NoUsablePeers)));

    nodes[0].endpoint.close().await;
    Ok(())
}

/// A peer that goes away mid-session stops counting; the rest still serve.
#[tokio::test]
async fn test_lost_peer_does_not_stall_calls() -> Result<()> {
    let (store, cids) = rand_blockstore(32, 64);
    let mut nodes = spawn_mesh(3, &store, &BlockStreamConfig::default());
    let ctx = CancellationToken::new();
    let session = nodes[0]
        .endpoint
        .session(&ctx, &others(&nodes, 0), Token::from("flaky"))
        .await?;
    ensure!(session.peers().len() == 2);

    // Dropping an endpoint without close() cancels what it serves.
    let gone = nodes.pop().context("three nodes")?;
    let gone_peer = gone.peer();
    drop(gone);
    eventually(5, || {
        let session = session.clone();
        async move { !session.peers().contains(&gone_peer) }
    })
    .await?;

    let blocks = collect_within(session.get_blocks(&ctx, cids.clone()).await?, 10).await?;
    assert_exact(&blocks, &cids)?;

    ctx.cancel();
    close_all(&nodes).await;
    Ok(())
}
