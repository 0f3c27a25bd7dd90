//! Sender: serves one inbound stream.
//!
//! After the handshake the stream carries any number of REQUESTs. Each one
//! becomes a Collector [`Request`](crate::request::Request) whose batches are
//! written back as RESPONSEs under the same id, followed by an empty
//! end-of-request RESPONSE. A request that fails (bad CID, missing block,
//! a batch too large for one frame) ends with a coded RESPONSE; the stream
//! keeps serving.

use tokio_util::sync::CancellationToken;

use blockstream_core::{BlockStreamConfig, Cid, Token};

use crate::access::{AccessGranter, ReportSender};
use crate::collector::CollectorHandle;
use crate::error::{Error, Result};
use crate::framing::{parse_cids, split, StreamReader, StreamWriter};
use crate::handshake::take_hand;
use crate::transport::{InboundStream, PeerId};

/// How a Sender ended.
#[derive(Debug)]
pub struct SenderOutcome {
    pub token: Token,
    pub remote: PeerId,
    pub requests: u64,
    pub blocks: u64,
    /// `Ok` when the remote closed the stream or the Sender was cancelled.
    pub result: Result<()>,
    report: Option<ReportSender>,
}

impl SenderOutcome {
    /// Log the outcome and hand a terminal error to the access policy.
    pub fn settle(self) {
        match self.result {
            Ok(()) => tracing::info!(
                token = %self.token,
                peer = %self.remote,
                requests = self.requests,
                blocks = self.blocks,
                "sender finished"
            ),
            Err(e) => {
                tracing::warn!(
                    token = %self.token,
                    peer = %self.remote,
                    requests = self.requests,
                    error = %e,
                    "sender failed"
                );
                if let Some(report) = self.report {
                    // The policy may have stopped listening.
                    let _ = report.send(e);
                }
            }
        }
    }
}

pub struct Sender {
    remote: PeerId,
    token: Token,
    report: Option<ReportSender>,
    reader: StreamReader,
    writer: StreamWriter,
    collector: CollectorHandle,
    requests: u64,
    blocks: u64,
}

impl Sender {
    /// Run the responder handshake on `inbound`.
    pub async fn accept(
        inbound: InboundStream,
        granter: &dyn AccessGranter,
        collector: CollectorHandle,
        config: &BlockStreamConfig,
    ) -> Result<Self> {
        let remote = inbound.remote;
        let (mut reader, mut writer) = split(inbound.stream, config.transfer.max_frame_size);
        let grant = take_hand(
            &mut reader,
            &mut writer,
            granter,
            remote,
            config.handshake_timeout(),
        )
        .await?;

        Ok(Self {
            remote,
            token: grant.token,
            report: grant.report,
            reader,
            writer,
            collector,
            requests: 0,
            blocks: 0,
        })
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn remote(&self) -> PeerId {
        self.remote
    }

    /// Serve until the stream closes, fails, or `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> SenderOutcome {
        tracing::info!(token = %self.token, peer = %self.remote, "sender started");
        let result = self.serve(&cancel).await;
        let _ = self.writer.close().await;

        SenderOutcome {
            token: self.token,
            remote: self.remote,
            requests: self.requests,
            blocks: self.blocks,
            result,
            report: self.report,
        }
    }

    async fn serve(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let (id, raw) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                req = self.reader.read_request() => match req {
                    Ok(req) => req,
                    Err(Error::Closed { .. }) => return Ok(()),
                    Err(e) => return Err(e),
                },
            };
            self.requests += 1;

            let cids = match parse_cids(&raw) {
                Ok(cids) => cids,
                Err(e) => {
                    tracing::debug!(peer = %self.remote, id, error = %e, "rejecting request");
                    self.writer.write_response(id, &[], Some(&e)).await?;
                    continue;
                }
            };
            tracing::debug!(peer = %self.remote, id, count = cids.len(), "serving request");

            if !self.serve_request(id, cids, cancel).await? {
                return Ok(());
            }
        }
    }

    // Stream every batch of one request. Returns false if cancelled midway.
    async fn serve_request(
        &mut self,
        id: u32,
        cids: Vec<Cid>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let mut request = tokio::select! {
            _ = cancel.cancelled() => return Ok(false),
            req = self.collector.request(cids) => req?,
        };

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                batch = request.next() => batch,
            };
            match batch {
                Ok(blocks) if blocks.is_empty() => {
                    self.writer.write_response(id, &[], None).await?;
                    return Ok(true);
                }
                Ok(blocks) => {
                    tracing::trace!(peer = %self.remote, id, count = blocks.len(), "writing batch");
                    match self.writer.write_response(id, &blocks, None).await {
                        Ok(()) => self.blocks += blocks.len() as u64,
                        // Nothing was written; only this request is lost.
                        Err(e @ Error::FrameTooLarge { .. }) => {
                            tracing::warn!(peer = %self.remote, id, error = %e, "batch too large to send");
                            self.writer.write_response(id, &[], Some(&e)).await?;
                            return Ok(true);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(Error::CollectorClosed) => {
                    self.writer
                        .write_response(id, &[], Some(&Error::CollectorClosed))
                        .await?;
                    return Err(Error::CollectorClosed);
                }
                Err(e) => {
                    tracing::debug!(peer = %self.remote, id, error = %e, "request failed");
                    self.writer.write_response(id, &[], Some(&e)).await?;
                    return Ok(true);
                }
            }
        }
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("remote", &self.remote)
            .field("token", &self.token)
            .finish()
    }
}
