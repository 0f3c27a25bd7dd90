//! Access control. Decides whether a token presented during the handshake
//! may be served, and learns how streams serving it ended.
//!
//! Two policies ship with the crate:
//! - [`PassingGranter`]: grants every token. Useful for tests and closed
//!   deployments where the transport already authenticates peers.
//! - [`TokenRegistry`]: an allow-list. A stream that ends with an error
//!   revokes its token, so a misbehaving requester must be re-granted
//!   out of band before it can handshake again.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;

use blockstream_core::Token;

use crate::error::{Error, Result};
use crate::transport::PeerId;

/// Receives at most one terminal error from the stream a grant was issued for.
pub type ReportSender = oneshot::Sender<Error>;

pub type DynAccessGranter = Arc<dyn AccessGranter>;

pub trait AccessGranter: Send + Sync + 'static {
    /// Check `token` presented by `peer`. `Err` rejects the handshake.
    /// A returned channel is handed the stream's terminal error, if any.
    fn granted(&self, token: &Token, peer: PeerId) -> Result<Option<ReportSender>>;
}

// ── Passing ───────────────────────────────────────────────────────────────────

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassingGranter;

impl PassingGranter {
    pub fn new() -> Self {
        Self
    }
}

impl AccessGranter for PassingGranter {
    fn granted(&self, _token: &Token, _peer: PeerId) -> Result<Option<ReportSender>> {
        Ok(None)
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Allow-list of tokens with revoke-on-error.
#[derive(Debug, Clone, Default)]
pub struct TokenRegistry {
    // token -> number of streams it was granted to
    tokens: Arc<DashMap<Token, u64>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, token: Token) {
        tracing::info!(%token, "token granted");
        self.tokens.entry(token).or_insert(0);
    }

    pub fn revoke(&self, token: &Token) {
        if self.tokens.remove(token).is_some() {
            tracing::info!(%token, "token revoked");
        }
    }

    pub fn is_granted(&self, token: &Token) -> bool {
        self.tokens.contains_key(token)
    }

    /// How many handshakes `token` has passed since it was granted.
    pub fn uses(&self, token: &Token) -> u64 {
        self.tokens.get(token).map(|e| *e.value()).unwrap_or(0)
    }
}

impl AccessGranter for TokenRegistry {
    fn granted(&self, token: &Token, peer: PeerId) -> Result<Option<ReportSender>> {
        match self.tokens.get_mut(token) {
            Some(mut uses) => *uses += 1,
            None => {
                return Err(Error::AccessDenied {
                    token: token.clone(),
                    reason: "token not granted".into(),
                })
            }
        }

        let (tx, rx) = oneshot::channel::<Error>();
        let registry = self.clone();
        let token = token.clone();
        tokio::spawn(async move {
            // A dropped sender means the stream ended cleanly.
            if let Ok(err) = rx.await {
                tracing::warn!(%token, %peer, error = %err, "stream failed, revoking token");
                registry.revoke(&token);
            }
        });

        Ok(Some(tx))
    }
}
