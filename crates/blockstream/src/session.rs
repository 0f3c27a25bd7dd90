//! Session: the requesting side.
//!
//! A Session owns one handshaken stream per usable peer. Each stream has a
//! long-lived reader task that routes RESPONSEs by correlation id to the
//! call that asked for them:
//!
//!   get_blocks ──REQUEST{id}──▶ every peer
//!
//!   reader(peer A) ─┐
//!   reader(peer B) ─┼─▶ calls[id] ──▶ reducer ──▶ caller's channel
//!   reader(peer C) ─┘               verify · dedup · (save)
//!
//! The reducer closes the caller's channel once every CID was delivered,
//! every peer has finished the request, or the call is cancelled.
//!
//! Every hop is bounded. A caller that stops reading stalls its reducer,
//! then the readers, and through the stream the remote Sender and its
//! Collector. Calls sharing a peer stream wait on the slowest of them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use blockstream_core::wire::WireBlock;
use blockstream_core::{Block, BlockStreamConfig, Cid, Token, PROTOCOL_ID};

use crate::error::{Error, Result};
use crate::framing::{split, StreamReader, StreamWriter};
use crate::handshake::give_hand;
use crate::store::DynBlockstore;
use crate::transport::{PeerId, Transport};

// What a reader task tells a call.
#[derive(Debug)]
enum PeerEvent {
    Blocks { peer: PeerId, blocks: Vec<WireBlock> },
    Done { peer: PeerId, error: Option<Error> },
}

type CallTable = DashMap<u32, mpsc::Sender<PeerEvent>>;

struct PeerLink {
    peer: PeerId,
    // Taken out when the Session closes so the stream is dropped for good.
    writer: Mutex<Option<StreamWriter>>,
    alive: AtomicBool,
}

struct SessionInner {
    token: Token,
    links: Vec<Arc<PeerLink>>,
    calls: Arc<CallTable>,
    next_id: AtomicU32,
    store: DynBlockstore,
    auto_save: bool,
    output_buffer: usize,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// Client-side handle for retrieving blocks from a fixed set of peers.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Dial every peer and run the initiator handshake on all of them
    /// concurrently. Peers that can't be dialed or fail the handshake are
    /// dropped; only when none are left does this fail. A peer listed twice
    /// gets a single stream.
    ///
    /// The Session lives until `cancel` fires.
    pub async fn open(
        transport: &dyn Transport,
        peers: &[PeerId],
        token: Token,
        store: DynBlockstore,
        config: &BlockStreamConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let timeout = config.handshake_timeout();
        let max_frame = config.transfer.max_frame_size;

        let mut seen = HashSet::new();
        let peers: Vec<PeerId> = peers.iter().copied().filter(|p| seen.insert(*p)).collect();

        let dials = peers.iter().map(|&peer| {
            let token = &token;
            async move {
                let stream = transport
                    .open_stream(peer, PROTOCOL_ID)
                    .await
                    .map_err(|e| Error::io("can't open stream", e))?;
                let (mut reader, mut writer) = split(stream, max_frame);
                give_hand(&mut reader, &mut writer, token, timeout).await?;
                Ok::<_, Error>((peer, reader, writer))
            }
        });

        let mut links = Vec::new();
        let mut readers = Vec::new();
        for (peer, res) in peers.iter().zip(futures::future::join_all(dials).await) {
            match res {
                Ok((peer, reader, writer)) => {
                    links.push(Arc::new(PeerLink {
                        peer,
                        writer: Mutex::new(Some(writer)),
                        alive: AtomicBool::new(true),
                    }));
                    readers.push(reader);
                }
                Err(e) => {
                    tracing::warn!(%peer, %token, error = %e, "dropping peer from session");
                }
            }
        }

        if links.is_empty() {
            return Err(Error::NoUsablePeers);
        }

        let inner = Arc::new(SessionInner {
            token,
            links,
            calls: Arc::new(DashMap::new()),
            next_id: AtomicU32::new(0),
            store,
            auto_save: config.session.auto_save,
            output_buffer: config.session.output_buffer.max(1),
            cancel,
            tasks: TaskTracker::new(),
        });

        for (link, reader) in inner.links.iter().zip(readers) {
            inner.tasks.spawn(read_responses(
                link.clone(),
                reader,
                inner.calls.clone(),
                inner.cancel.clone(),
            ));
        }

        tracing::info!(
            token = %inner.token,
            peers = inner.links.len(),
            dropped = peers.len() - inner.links.len(),
            "session opened"
        );
        Ok(Self { inner })
    }

    pub fn token(&self) -> &Token {
        &self.inner.token
    }

    /// Peers whose stream is still up.
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner
            .links
            .iter()
            .filter(|l| l.alive.load(Ordering::Acquire))
            .map(|l| l.peer)
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Ask every peer for `cids` and stream back verified, deduplicated
    /// blocks as they arrive.
    ///
    /// The returned channel closes once every CID was delivered, every peer
    /// finished the request, `cancel` fires, or the Session ends. CIDs that
    /// never arrive are simply missing from what was received.
    pub async fn get_blocks(
        &self,
        cancel: &CancellationToken,
        cids: Vec<Cid>,
    ) -> Result<mpsc::Receiver<Block>> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (out_tx, out_rx) = mpsc::channel(inner.output_buffer);
        if cids.is_empty() {
            return Ok(out_rx);
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (ev_tx, ev_rx) = mpsc::channel(inner.output_buffer);
        // Registered before any liveness check so a reader that dies from
        // here on still reports to this call.
        inner.calls.insert(id, ev_tx);
        tracing::debug!(token = %inner.token, id, count = cids.len(), "requesting blocks");

        let sends = inner.links.iter().map(|link| {
            let cids = &cids;
            let session_cancel = &inner.cancel;
            async move {
                if !link.alive.load(Ordering::Acquire) {
                    return None;
                }
                // A stalled stream must not keep the writer from closed().
                let written = tokio::select! {
                    _ = session_cancel.cancelled() => Err(Error::Cancelled),
                    res = async {
                        match link.writer.lock().await.as_mut() {
                            Some(writer) => writer.write_request(id, cids).await,
                            None => Err(Error::Cancelled),
                        }
                    } => res,
                };
                match written {
                    Ok(()) => Some(link.peer),
                    Err(e) => {
                        tracing::warn!(peer = %link.peer, id, error = %e, "request not sent");
                        link.alive.store(false, Ordering::Release);
                        None
                    }
                }
            }
        });
        let pending: HashSet<PeerId> = futures::future::join_all(sends)
            .await
            .into_iter()
            .flatten()
            .collect();

        let reducer = Reducer {
            id,
            wanted: cids.into_iter().collect(),
            delivered: HashSet::new(),
            pending,
            store: inner.store.clone(),
            auto_save: inner.auto_save,
            out: out_tx,
        };
        let calls = inner.calls.clone();
        let call_cancel = cancel.clone();
        let session_cancel = inner.cancel.clone();
        inner.tasks.spawn(async move {
            reducer.run(ev_rx, call_cancel, session_cancel).await;
            calls.remove(&id);
        });

        Ok(out_rx)
    }

    /// Wait for the Session to end, then close every stream and wait for
    /// in-flight calls to wind down.
    pub async fn closed(&self) {
        let inner = &self.inner;
        inner.cancel.cancelled().await;
        for link in &inner.links {
            link.alive.store(false, Ordering::Release);
            if let Some(mut writer) = link.writer.lock().await.take() {
                let _ = writer.close().await;
            }
        }
        inner.tasks.close();
        inner.tasks.wait().await;
        tracing::info!(token = %inner.token, "session closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.inner.token)
            .field("peers", &self.inner.links.len())
            .field("calls", &self.inner.calls.len())
            .finish()
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

async fn read_responses(
    link: Arc<PeerLink>,
    mut reader: StreamReader,
    calls: Arc<CallTable>,
    cancel: CancellationToken,
) {
    let peer = link.peer;
    let err = loop {
        let resp = tokio::select! {
            _ = cancel.cancelled() => return,
            resp = reader.read_response() => resp,
        };
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => break e,
        };

        let terminal = resp.is_terminal();
        let Some(call) = calls.get(&resp.id).map(|c| c.value().clone()) else {
            tracing::trace!(%peer, id = resp.id, "response for finished call");
            continue;
        };
        if !resp.blocks.is_empty() {
            let event = PeerEvent::Blocks {
                peer,
                blocks: resp.blocks,
            };
            if !forward(&call, event, &cancel).await {
                return;
            }
        }
        if terminal {
            let event = PeerEvent::Done {
                peer,
                error: resp.error,
            };
            if !forward(&call, event, &cancel).await {
                return;
            }
        }
    };

    match &err {
        Error::Closed { .. } => tracing::debug!(%peer, "peer closed stream"),
        e => tracing::warn!(%peer, error = %e, "peer stream failed"),
    }

    // Mark first so calls started from now on skip this peer; then release
    // every call still waiting on it.
    link.alive.store(false, Ordering::Release);
    let waiting: Vec<_> = calls.iter().map(|c| c.value().clone()).collect();
    futures::future::join_all(
        waiting
            .iter()
            .map(|call| forward(call, PeerEvent::Done { peer, error: None }, &cancel)),
    )
    .await;
}

// Wait for room in the call's queue. A finished call just drops the event;
// false only when the Session is over.
async fn forward(
    call: &mpsc::Sender<PeerEvent>,
    event: PeerEvent,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = call.send(event) => true,
    }
}

// ── Reducer ───────────────────────────────────────────────────────────────────

// Merges the responses of every peer for one call.
struct Reducer {
    id: u32,
    wanted: HashSet<Cid>,
    delivered: HashSet<Cid>,
    pending: HashSet<PeerId>,
    store: DynBlockstore,
    auto_save: bool,
    out: mpsc::Sender<Block>,
}

impl Reducer {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<PeerEvent>,
        call_cancel: CancellationToken,
        session_cancel: CancellationToken,
    ) {
        while !self.wanted.is_empty() && !self.pending.is_empty() {
            let event = tokio::select! {
                biased;
                _ = call_cancel.cancelled() => break,
                _ = session_cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                PeerEvent::Blocks { peer, blocks } => {
                    for raw in blocks {
                        let Some(block) = self.verify(peer, raw) else {
                            continue;
                        };
                        let delivered = tokio::select! {
                            biased;
                            _ = call_cancel.cancelled() => false,
                            _ = session_cancel.cancelled() => false,
                            ok = self.deliver(block) => ok,
                        };
                        if !delivered {
                            return self.finish();
                        }
                    }
                }
                PeerEvent::Done { peer, error } => {
                    if let Some(e) = &error {
                        tracing::debug!(%peer, id = self.id, error = %e, "peer ended request");
                    }
                    self.pending.remove(&peer);
                }
            }
        }
        self.finish()
    }

    // Accept a block only if it was asked for, not yet delivered, and its
    // payload hashes to its CID.
    fn verify(&self, peer: PeerId, raw: WireBlock) -> Option<Block> {
        let cid = match Cid::from_bytes(&raw.cid) {
            Ok(cid) => cid,
            Err(e) => {
                tracing::warn!(%peer, id = self.id, error = %e, "dropping block with bad cid");
                return None;
            }
        };
        if !self.wanted.contains(&cid) {
            if self.delivered.contains(&cid) {
                tracing::trace!(%peer, %cid, "duplicate block");
            } else {
                tracing::warn!(%peer, %cid, "dropping unrequested block");
            }
            return None;
        }
        match Block::checked(cid, raw.data) {
            Ok(block) => Some(block),
            Err(e) => {
                tracing::warn!(%peer, %cid, error = %e, "dropping corrupted block");
                None
            }
        }
    }

    // False once the caller is gone.
    async fn deliver(&mut self, block: Block) -> bool {
        let cid = *block.cid();
        if self.auto_save {
            if let Err(e) = self.store.put(block.clone()).await {
                tracing::warn!(%cid, error = %e, "can't save received block");
            }
        }
        self.wanted.remove(&cid);
        self.delivered.insert(cid);
        self.out.send(block).await.is_ok()
    }

    fn finish(self) {
        tracing::debug!(
            id = self.id,
            delivered = self.delivered.len(),
            missing = self.wanted.len(),
            "call finished"
        );
    }
}
