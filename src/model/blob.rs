//! Immutable Blob: byte content plus its own SHA-1, kept distinct from
//! the hash a containing Tree's entry uses to reference it.

use crate::hash::Hash;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    self_hash: Hash,
    bytes: bytes::Bytes,
}

impl Blob {
    pub fn new(bytes: impl Into<bytes::Bytes>) -> Self {
        let bytes = bytes.into();
        let self_hash = Hash::of(&bytes);
        Self { self_hash, bytes }
    }

    pub fn self_hash(&self) -> Hash {
        self.self_hash
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_hash_matches_content() {
        let b = Blob::new(&b"hello"[..]);
        assert_eq!(b.self_hash(), Hash::of(b"hello"));
    }

    #[test]
    fn len_tracks_bytes() {
        let b = Blob::new(&b"hello"[..]);
        assert_eq!(b.len(), 5);
    }
}
