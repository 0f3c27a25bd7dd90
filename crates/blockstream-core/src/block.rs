//! Blocks: immutable payloads addressed by their [`Cid`].

use bytes::Bytes;

use crate::cid::{Cid, HashCode};

/// An immutable payload together with its content identifier.
///
/// Invariant: `cid` is the digest of `data` under `cid.code()`. Every
/// constructor upholds it; there is no way to build a mismatched block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    cid: Cid,
    data: Bytes,
}

impl Block {
    /// Wrap `data`, addressing it by its BLAKE3 digest.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self::with_code(HashCode::Blake3, data)
    }

    pub fn with_code(code: HashCode, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let cid = Cid::sum(code, &data);
        Self { cid, data }
    }

    /// Build a block that claims to be `expected`, verifying the claim.
    pub fn checked(expected: Cid, data: impl Into<Bytes>) -> Result<Self, BlockError> {
        let data = data.into();
        let actual = expected.resum(&data);
        if actual != expected {
            return Err(BlockError::WrongHash { expected, actual });
        }
        Ok(Self { cid: expected, data })
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("data does not match block hash (expected {expected}, got {actual})")]
    WrongHash { expected: Cid, actual: Cid },
}
