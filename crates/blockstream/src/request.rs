//! Server-side retrieval cursor.
//!
//! A [`Request`] is created by [`CollectorHandle::request`] and pulled with
//! [`Request::next`]. The Collector fills a single-slot buffer behind it, so
//! at most one batch is ever produced ahead of the consumer.
//!
//! [`CollectorHandle::request`]: crate::collector::CollectorHandle::request

use tokio::sync::mpsc;

use blockstream_core::Block;

use crate::error::{Error, Result};

/// One batch as handed over by the Collector.
pub(crate) type Batch = Result<Vec<Block>>;

#[derive(Debug)]
pub struct Request {
    id: u64,
    // Blocks the Collector still owes us. A slot closing while this is
    // non-zero means the Collector went away mid-request.
    remaining: usize,
    slot: mpsc::Receiver<Batch>,
    done: bool,
}

impl Request {
    pub(crate) fn new(id: u64, remaining: usize, slot: mpsc::Receiver<Batch>) -> Self {
        Self {
            id,
            remaining,
            slot,
            done: remaining == 0,
        }
    }

    /// Correlation id, unique within the Collector that issued it.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// True once every batch or the terminal error has been returned.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Wait for the next batch.
    ///
    /// An empty batch means the request is exhausted. An error is terminal:
    /// it is returned once, and every later call yields an empty batch. The
    /// cursor never revives; retrying a retrieval needs a new `Request`.
    pub async fn next(&mut self) -> Result<Vec<Block>> {
        if self.done {
            return Ok(Vec::new());
        }

        match self.slot.recv().await {
            Some(Ok(blocks)) => {
                self.remaining = self.remaining.saturating_sub(blocks.len());
                if self.remaining == 0 {
                    self.finish();
                }
                Ok(blocks)
            }
            Some(Err(e)) => {
                self.finish();
                Err(e)
            }
            None => {
                self.finish();
                Err(Error::CollectorClosed)
            }
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.slot.close();
    }
}
