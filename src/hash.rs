//! Fixed-width content hash, conventionally a SHA-1 of either a blob's
//! raw bytes or a tree's canonical serialized form.

use data_encoding::HEXLOWER;
use sha1::{Digest, Sha1};
use std::fmt;

pub const HASH_LEN: usize = 20;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; HASH_LEN]);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HashError {
    #[error("invalid hash length: {0}, expected {HASH_LEN}")]
    InvalidLength(usize),
    #[error("invalid hex in hash: {0}")]
    InvalidHex(String),
}

impl Hash {
    /// Builds a `Hash` from exactly `HASH_LEN` raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HashError> {
        if bytes.len() != HASH_LEN {
            return Err(HashError::InvalidLength(bytes.len()));
        }
        let mut buf = [0u8; HASH_LEN];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    /// Builds a `Hash` from a 40-character lowercase hex string.
    pub fn from_hex(s: &str) -> Result<Self, HashError> {
        if s.len() != HASH_LEN * 2 {
            return Err(HashError::InvalidLength(s.len()));
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(HashError::InvalidHex(s.to_string()));
        }
        let lower = s.to_ascii_lowercase();
        let decoded = HEXLOWER
            .decode(lower.as_bytes())
            .map_err(|_| HashError::InvalidHex(s.to_string()))?;
        Self::from_bytes(&decoded)
    }

    /// Computes the content hash of a byte slice (used for `Blob::self_hash`
    /// and for a `Tree`'s canonical serialized form).
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        Self::from_bytes(&digest).expect("sha1 output is always 20 bytes")
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}
