//! Token handshake, run once on every stream before any REQUEST/RESPONSE.
//!
//!   initiator                       responder
//!   HANDSHAKE{token}  ────────────▶  access check
//!                     ◀────────────  HANDSHAKE{token}   (echo, only if granted)
//!
//! The initiator fails if the echo differs from what it sent. The responder
//! never echoes a rejected token; it just closes the stream.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use blockstream_core::Token;

use crate::access::{AccessGranter, ReportSender};
use crate::error::{Error, Result};
use crate::framing::{MessageReader, MessageWriter};
use crate::transport::PeerId;

/// A token the responder accepted, plus the policy's report channel.
#[derive(Debug)]
pub struct Grant {
    pub token: Token,
    pub report: Option<ReportSender>,
}

/// Initiator side: send `token`, expect it echoed back.
pub async fn give_hand<R, W>(
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    token: &Token,
    timeout: Duration,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    with_timeout(timeout, async {
        writer.write_token(token).await?;
        let echoed = reader.read_token().await?;
        if &echoed != token {
            return Err(Error::HandshakeMismatch {
                expected: token.clone(),
                received: echoed,
            });
        }
        Ok(())
    })
    .await
}

/// Responder side: read a token, ask `granter`, echo it back if granted.
pub async fn take_hand<R, W>(
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    granter: &dyn AccessGranter,
    remote: PeerId,
    timeout: Duration,
) -> Result<Grant>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    with_timeout(timeout, async {
        let token = reader.read_token().await?;
        let report = granter.granted(&token, remote)?;
        writer.write_token(&token).await?;
        Ok(Grant { token, report })
    })
    .await
}

async fn with_timeout<T>(timeout: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| Error::HandshakeTimeout)?
}
