//! Endpoint: one local participant in the protocol.
//!
//! Owns the local store, the access policy and the Collector. Serves every
//! inbound stream with a [`Sender`] and hands out [`Session`]s for outbound
//! retrieval. Live Sessions and Senders are kept in per-token registries
//! and tracked so [`Endpoint::close`] can wait for all of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use blockstream_core::{BlockStreamConfig, Token, PROTOCOL_ID};

use crate::access::DynAccessGranter;
use crate::collector::{Collector, CollectorHandle, CollectorStats};
use crate::error::Result;
use crate::sender::Sender;
use crate::session::Session;
use crate::store::DynBlockstore;
use crate::transport::{DynTransport, InboundStream, PeerId, StreamHandler};

// ── Registry ──────────────────────────────────────────────────────────────────

// Token -> registration id -> entry. A token may have several live entries,
// e.g. one Sender per requesting peer.
struct Registry<V> {
    entries: DashMap<Token, HashMap<u64, V>>,
    next_id: AtomicU64,
}

impl<V> Registry<V> {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    fn insert(&self, token: Token, value: V) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.entry(token).or_default().insert(id, value);
        id
    }

    fn remove(&self, token: &Token, id: u64) {
        if let Some(mut entry) = self.entries.get_mut(token) {
            entry.remove(&id);
        }
        self.entries.remove_if(token, |_, m| m.is_empty());
    }

    fn len(&self) -> usize {
        self.entries.iter().map(|e| e.value().len()).sum()
    }
}

// ── Endpoint ──────────────────────────────────────────────────────────────────

struct EndpointInner {
    transport: DynTransport,
    store: DynBlockstore,
    granter: DynAccessGranter,
    config: BlockStreamConfig,
    collector: CollectorHandle,
    collector_task: std::sync::Mutex<Option<JoinHandle<CollectorStats>>>,
    sessions: Registry<Session>,
    senders: Registry<PeerId>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

/// Must be created inside a Tokio runtime. Dropping an Endpoint without
/// [`close`](Endpoint::close) cancels whatever it is still serving.
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    /// Start the Collector and begin accepting inbound streams on
    /// [`PROTOCOL_ID`].
    pub fn new(
        transport: DynTransport,
        store: DynBlockstore,
        granter: DynAccessGranter,
        config: BlockStreamConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (collector, handle) = Collector::new(
            store.clone(),
            config.transfer.max_message_size,
            config.transfer.collector_queue,
            cancel.clone(),
        );
        let collector_task = tokio::spawn(collector.run());

        let inner = Arc::new(EndpointInner {
            transport,
            store,
            granter,
            config,
            collector: handle,
            collector_task: std::sync::Mutex::new(Some(collector_task)),
            sessions: Registry::new(),
            senders: Registry::new(),
            tasks: TaskTracker::new(),
            cancel,
        });

        let weak = Arc::downgrade(&inner);
        let handler: StreamHandler = Arc::new(move |inbound: InboundStream| accept(&weak, inbound));
        inner.transport.set_stream_handler(PROTOCOL_ID, handler);

        tracing::info!(
            peer = %inner.transport.local_peer(),
            auto_save = inner.config.session.auto_save,
            max_message_size = inner.config.transfer.max_message_size,
            "endpoint started"
        );
        Self { inner }
    }

    /// Open a Session for `token` against `peers`. It lives until `ctx` is
    /// cancelled and is deregistered afterwards.
    pub async fn session(
        &self,
        ctx: &CancellationToken,
        peers: &[PeerId],
        token: Token,
    ) -> Result<Session> {
        let inner = &self.inner;
        let session = Session::open(
            inner.transport.as_ref(),
            peers,
            token.clone(),
            inner.store.clone(),
            &inner.config,
            ctx.clone(),
        )
        .await?;

        let reg = inner.sessions.insert(token.clone(), session.clone());
        let registered = session.clone();
        let owner = inner.clone();
        inner.tasks.spawn(async move {
            registered.closed().await;
            owner.sessions.remove(&token, reg);
        });
        Ok(session)
    }

    /// Stop accepting inbound streams and wait until every Session and
    /// Sender has finished on its own. Nothing in flight is cut short.
    pub async fn close(&self) {
        let inner = &self.inner;
        inner.transport.remove_stream_handler(PROTOCOL_ID);
        tracing::info!(
            sessions = inner.sessions.len(),
            senders = inner.senders.len(),
            "endpoint closing, draining"
        );

        inner.tasks.close();
        inner.tasks.wait().await;

        inner.cancel.cancel();
        let task = inner
            .collector_task
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(task) = task {
            match task.await {
                Ok(stats) => tracing::info!(
                    requests = stats.requests,
                    batches = stats.batches,
                    blocks = stats.blocks,
                    failed = stats.failed,
                    "collector closed"
                ),
                Err(e) => tracing::error!(error = %e, "collector task failed"),
            }
        }
        tracing::info!("endpoint closed");
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.transport.local_peer()
    }

    pub fn store(&self) -> &DynBlockstore {
        &self.inner.store
    }

    pub fn config(&self) -> &BlockStreamConfig {
        &self.inner.config
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn active_senders(&self) -> usize {
        self.inner.senders.len()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.inner.transport.remove_stream_handler(PROTOCOL_ID);
        self.inner.cancel.cancel();
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("peer", &self.inner.transport.local_peer())
            .field("sessions", &self.inner.sessions.len())
            .field("senders", &self.inner.senders.len())
            .finish()
    }
}

// ── Inbound ───────────────────────────────────────────────────────────────────

fn accept(endpoint: &Weak<EndpointInner>, inbound: InboundStream) {
    let Some(inner) = endpoint.upgrade() else {
        return;
    };
    if inner.tasks.is_closed() {
        tracing::debug!(peer = %inbound.remote, "endpoint closing, refusing stream");
        return;
    }
    inner.tasks.spawn(serve(inner.clone(), inbound));
}

async fn serve(inner: Arc<EndpointInner>, inbound: InboundStream) {
    let remote = inbound.remote;
    let sender = match Sender::accept(
        inbound,
        inner.granter.as_ref(),
        inner.collector.clone(),
        &inner.config,
    )
    .await
    {
        Ok(sender) => sender,
        Err(e) => {
            tracing::warn!(peer = %remote, error = %e, "inbound handshake failed");
            return;
        }
    };

    let token = sender.token().clone();
    let reg = inner.senders.insert(token.clone(), remote);
    let outcome = sender.run(inner.cancel.clone()).await;
    inner.senders.remove(&token, reg);
    outcome.settle();
}
