//! Collector, the per-endpoint batch scheduler.
//!
//! Every [`Request`] a Sender opens lands here. The Collector pulls blocks
//! for it from the local store and hands them over one batch at a time.
//!
//! Scheduling is round-robin over requests whose single-slot buffer is free:
//!
//!   queue ──▶ parked (waiting for the consumer to drain its slot)
//!                │ slot free
//!                ▼
//!             ready ──▶ fetch one batch ──▶ slot ──▶ parked
//!
//! A request advances by exactly one batch per turn, so a large retrieval
//! cannot starve smaller ones. Store access itself is not serialized beyond
//! the one fetch in flight.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use blockstream_core::{Block, Cid};

use crate::error::{Error, Result};
use crate::request::{Batch, Request};
use crate::store::DynBlockstore;

/// Counters reported when the Collector stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorStats {
    pub requests: u64,
    pub batches: u64,
    pub blocks: u64,
    pub failed: u64,
}

/// Cheap, cloneable entry point for opening requests against a Collector.
#[derive(Debug, Clone)]
pub struct CollectorHandle {
    queue: mpsc::Sender<Job>,
    next_id: Arc<AtomicU64>,
}

impl CollectorHandle {
    /// Queue a retrieval of `cids`. Waits if the Collector's queue is full.
    pub async fn request(&self, cids: Vec<Cid>) -> Result<Request> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (slot_tx, slot_rx) = mpsc::channel(1);
        let total = cids.len();
        if total > 0 {
            let job = Job {
                id,
                cids: cids.into(),
                carry: None,
                deferred: None,
                slot: slot_tx,
            };
            self.queue
                .send(job)
                .await
                .map_err(|_| Error::CollectorClosed)?;
        }
        Ok(Request::new(id, total, slot_rx))
    }
}

// Collector-side state of one request.
struct Job {
    id: u64,
    cids: VecDeque<Cid>,
    // Fetched but did not fit the previous batch.
    carry: Option<Block>,
    // Failure that happened after part of a batch was already collected.
    deferred: Option<Error>,
    slot: mpsc::Sender<Batch>,
}

impl Job {
    fn is_finished(&self) -> bool {
        self.cids.is_empty() && self.carry.is_none() && self.deferred.is_none()
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("remaining", &self.cids.len())
            .finish()
    }
}

type Parked = BoxFuture<'static, Option<(Job, mpsc::OwnedPermit<Batch>)>>;

pub struct Collector {
    store: DynBlockstore,
    max_batch_bytes: usize,
    queue: mpsc::Receiver<Job>,
    cancel: CancellationToken,
    ready: VecDeque<(Job, mpsc::OwnedPermit<Batch>)>,
    parked: FuturesUnordered<Parked>,
    stats: CollectorStats,
}

impl Collector {
    /// Build a Collector and the handle used to feed it. Nothing runs until
    /// [`Collector::run`] is polled.
    pub fn new(
        store: DynBlockstore,
        max_batch_bytes: usize,
        queue_size: usize,
        cancel: CancellationToken,
    ) -> (Self, CollectorHandle) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let collector = Self {
            store,
            max_batch_bytes,
            queue: rx,
            cancel,
            ready: VecDeque::new(),
            parked: FuturesUnordered::new(),
            stats: CollectorStats::default(),
        };
        let handle = CollectorHandle {
            queue: tx,
            next_id: Arc::new(AtomicU64::new(0)),
        };
        (collector, handle)
    }

    /// Serve requests until cancelled, or until every handle is dropped and
    /// no request is left in flight.
    pub async fn run(mut self) -> CollectorStats {
        let mut queue_open = true;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            // Pick up whatever became runnable without waiting, so newcomers
            // join the rotation between turns.
            while let Ok(job) = self.queue.try_recv() {
                self.admit(job);
            }
            while let Some(Some(parked)) = self.parked.next().now_or_never() {
                if let Some(ready) = parked {
                    self.ready.push_back(ready);
                }
            }

            if let Some((mut job, permit)) = self.ready.pop_front() {
                let batch = next_batch(&self.store, self.max_batch_bytes, &mut job).await;
                self.record(&job, &batch);
                let slot = permit.send(batch);
                if !job.is_finished() {
                    self.park(job, slot);
                }
                continue;
            }

            if !queue_open && self.parked.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                job = self.queue.recv(), if queue_open => match job {
                    Some(job) => self.admit(job),
                    None => queue_open = false,
                },

                Some(parked) = self.parked.next(), if !self.parked.is_empty() => {
                    if let Some(ready) = parked {
                        self.ready.push_back(ready);
                    }
                }
            }
        }

        tracing::debug!(
            in_flight = self.ready.len() + self.parked.len(),
            "collector stopped"
        );
        self.stats
    }

    fn admit(&mut self, job: Job) {
        tracing::debug!(id = job.id, count = job.cids.len(), "collector request queued");
        self.stats.requests += 1;
        let slot = job.slot.clone();
        self.park(job, slot);
    }

    // Wait for the consumer to make room, then become ready. A dropped
    // Request resolves to `None` and the job is discarded.
    fn park(&mut self, job: Job, slot: mpsc::Sender<Batch>) {
        self.parked.push(Box::pin(async move {
            match slot.reserve_owned().await {
                Ok(permit) => Some((job, permit)),
                Err(_) => {
                    tracing::trace!(id = job.id, "request dropped by consumer");
                    None
                }
            }
        }));
    }

    fn record(&mut self, job: &Job, batch: &Batch) {
        match batch {
            Ok(blocks) => {
                self.stats.batches += 1;
                self.stats.blocks += blocks.len() as u64;
            }
            Err(_) => self.stats.failed += 1,
        }
        if job.is_finished() {
            tracing::trace!(id = job.id, "collector request complete");
        }
    }
}

/// Collect the next batch for `job`.
///
/// Blocks are taken in request order until the next one would push the
/// payload past `max_batch_bytes`; that block is kept for the following
/// batch. The first block always goes in, however large. A store failure
/// ends the job: it is returned right away on an empty batch, otherwise
/// after the blocks already collected.
async fn next_batch(store: &DynBlockstore, max_batch_bytes: usize, job: &mut Job) -> Batch {
    if let Some(err) = job.deferred.take() {
        return Err(err);
    }

    let mut blocks = Vec::new();
    let mut size = 0usize;
    if let Some(block) = job.carry.take() {
        size += block.len();
        blocks.push(block);
    }

    while let Some(cid) = job.cids.pop_front() {
        match store.get(cid).await {
            Ok(block) => {
                if !blocks.is_empty() && size + block.len() > max_batch_bytes {
                    job.carry = Some(block);
                    break;
                }
                size += block.len();
                blocks.push(block);
            }
            Err(e) => {
                tracing::debug!(id = job.id, %cid, error = %e, "collector fetch failed");
                job.cids.clear();
                let err = Error::from(e);
                if blocks.is_empty() {
                    return Err(err);
                }
                job.deferred = Some(err);
                break;
            }
        }
    }

    tracing::trace!(id = job.id, count = blocks.len(), bytes = size, "batch collected");
    Ok(blocks)
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("max_batch_bytes", &self.max_batch_bytes)
            .field("ready", &self.ready.len())
            .field("parked", &self.parked.len())
            .finish()
    }
}
