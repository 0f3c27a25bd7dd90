//! Content identifiers: self-describing hashes of block payloads.
//!
//! A [`Cid`] names a block by the digest of its bytes. The binary form carries
//! the hash function so the receiver can recompute the digest without any
//! out-of-band agreement:
//!
//!   [version=0x01][hash code][digest length=32][digest ...]
//!
//! Wire size: 35 bytes.

use std::fmt;

use sha2::Digest;

/// Current CID binary format version.
pub const CID_VERSION: u8 = 0x01;

/// Digest length in bytes. Both supported hash functions produce 32 bytes.
pub const DIGEST_LEN: usize = 32;

/// Encoded CID length in bytes.
pub const CID_LEN: usize = 3 + DIGEST_LEN;

// ── Hash codes ────────────────────────────────────────────────────────────────

/// Hash function identifier, using the multihash code table values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum HashCode {
    Sha2_256 = 0x12,
    #[default]
    Blake3 = 0x1e,
}

impl HashCode {
    /// Digest `data` with this hash function.
    pub fn digest(self, data: &[u8]) -> [u8; DIGEST_LEN] {
        match self {
            HashCode::Blake3 => *blake3::hash(data).as_bytes(),
            HashCode::Sha2_256 => sha2::Sha256::digest(data).into(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HashCode::Sha2_256 => "sha2-256",
            HashCode::Blake3 => "blake3",
        }
    }
}

impl TryFrom<u8> for HashCode {
    type Error = CidError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x12 => Ok(HashCode::Sha2_256),
            0x1e => Ok(HashCode::Blake3),
            other => Err(CidError::UnknownHashCode(other)),
        }
    }
}

impl From<HashCode> for u8 {
    fn from(code: HashCode) -> u8 {
        code as u8
    }
}

// ── Cid ───────────────────────────────────────────────────────────────────────

/// Content identifier: hash function plus digest of the block payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid {
    code: HashCode,
    digest: [u8; DIGEST_LEN],
}

impl Cid {
    pub fn new(code: HashCode, digest: [u8; DIGEST_LEN]) -> Self {
        Self { code, digest }
    }

    /// Hash `data` with `code` and return its identifier.
    pub fn sum(code: HashCode, data: &[u8]) -> Self {
        Self::new(code, code.digest(data))
    }

    pub fn code(&self) -> HashCode {
        self.code
    }

    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// Recompute the digest of `data` with this CID's hash function.
    /// The result may differ from `self`.
    pub fn resum(&self, data: &[u8]) -> Cid {
        Cid::sum(self.code, data)
    }

    /// True if `data` hashes to this identifier.
    pub fn matches(&self, data: &[u8]) -> bool {
        self.code.digest(data) == self.digest
    }

    pub fn to_bytes(&self) -> [u8; CID_LEN] {
        let mut out = [0u8; CID_LEN];
        out[0] = CID_VERSION;
        out[1] = self.code.into();
        out[2] = DIGEST_LEN as u8;
        out[3..].copy_from_slice(&self.digest);
        out
    }

    /// Parse the binary form. The whole slice must be consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CidError> {
        if bytes.len() < 3 {
            return Err(CidError::Truncated(bytes.len()));
        }
        if bytes[0] != CID_VERSION {
            return Err(CidError::UnknownVersion(bytes[0]));
        }
        let code = HashCode::try_from(bytes[1])?;
        let len = bytes[2] as usize;
        if len != DIGEST_LEN {
            return Err(CidError::DigestLength(len));
        }
        let body = &bytes[3..];
        if body.len() < DIGEST_LEN {
            return Err(CidError::Truncated(bytes.len()));
        }
        if body.len() > DIGEST_LEN {
            return Err(CidError::TrailingBytes(body.len() - DIGEST_LEN));
        }
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(body);
        Ok(Self { code, digest })
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(self.digest);
        write!(f, "Cid({}:{})", self.code.name(), &hex[..16])
    }
}

impl TryFrom<&[u8]> for Cid {
    type Error = CidError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Cid::from_bytes(bytes)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CidError {
    #[error("cid too short: {0} bytes")]
    Truncated(usize),

    #[error("unknown cid version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("unknown hash code: 0x{0:02x}")]
    UnknownHashCode(u8),

    #[error("unsupported digest length {0}, expected {DIGEST_LEN}")]
    DigestLength(usize),

    #[error("{0} trailing bytes after cid")]
    TrailingBytes(usize),
}
