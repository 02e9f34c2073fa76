//! The overlay's `SNAPSHOT` marker: the checked-out parent commit(s),
//! persisted beside the overlay so a crash can be distinguished from a
//! parent change. Grounded on
//! `original_source/eden/fs/inodes/overlay/SnapshotMarker.h`.

use std::path::Path;

use crate::error::{EdenError, Result};
use crate::hash::{Hash, HASH_LEN};
use crate::model::ParentCommits;

const MAGIC: &[u8; 4] = b"eden";
const VERSION: u32 = 1;
const LEGACY_HEX_LEN: usize = 40;

/// Encodes and decodes the on-disk `SNAPSHOT` file.
pub struct SnapshotMarker;

impl SnapshotMarker {
    /// `"eden"` + version (u32 BE) + parent1 (20 bytes) + optional parent2
    /// (20 bytes): 28 or 48 bytes total. Anything else is corrupt, except
    /// the legacy 40-hex-character format, which is always accepted on
    /// read but never written.
    pub fn encode(parents: &ParentCommits) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 4 + HASH_LEN * 2);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_be_bytes());
        out.extend_from_slice(parents.parent1().as_bytes());
        if let Some(p2) = parents.parent2() {
            out.extend_from_slice(p2.as_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<ParentCommits> {
        if bytes.len() == LEGACY_HEX_LEN || (bytes.len() > LEGACY_HEX_LEN && bytes[LEGACY_HEX_LEN..].iter().all(u8::is_ascii_whitespace)) {
            let hex = std::str::from_utf8(&bytes[..LEGACY_HEX_LEN])
                .map_err(|_| EdenError::CorruptSnapshot("legacy snapshot is not valid UTF-8".into()))?;
            let hash = Hash::from_hex(hex)
                .map_err(|e| EdenError::CorruptSnapshot(format!("legacy snapshot hex invalid: {e}")))?;
            return Ok(ParentCommits::single(hash));
        }

        if bytes.len() != 4 + 4 + HASH_LEN && bytes.len() != 4 + 4 + HASH_LEN * 2 {
            return Err(EdenError::CorruptSnapshot(format!(
                "snapshot marker has unexpected length {}",
                bytes.len()
            )));
        }
        if &bytes[0..4] != MAGIC {
            return Err(EdenError::CorruptSnapshot("snapshot marker missing magic".into()));
        }
        let version = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(EdenError::CorruptSnapshot(format!(
                "unsupported snapshot marker version {version}"
            )));
        }
        let parent1 = Hash::from_bytes(&bytes[8..8 + HASH_LEN])
            .map_err(|e| EdenError::CorruptSnapshot(e.to_string()))?;
        let parent2 = if bytes.len() == 4 + 4 + HASH_LEN * 2 {
            Some(
                Hash::from_bytes(&bytes[8 + HASH_LEN..8 + HASH_LEN * 2])
                    .map_err(|e| EdenError::CorruptSnapshot(e.to_string()))?,
            )
        } else {
            None
        };
        Ok(ParentCommits::new(parent1, parent2))
    }

    pub fn read(path: &Path) -> Result<ParentCommits> {
        let bytes = std::fs::read(path).map_err(EdenError::from)?;
        Self::decode(&bytes)
    }

    /// Atomic write via temp-file-then-rename, matching the overlay's
    /// other durable writes.
    pub fn write(path: &Path, parents: &ParentCommits) -> Result<()> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, Self::encode(parents)).map_err(EdenError::from)?;
        std::fs::rename(&tmp, path).map_err(EdenError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_single_parent() {
        let parents = ParentCommits::single(Hash::of(b"one"));
        let bytes = SnapshotMarker::encode(&parents);
        assert_eq!(bytes.len(), 28);
        assert_eq!(SnapshotMarker::decode(&bytes).unwrap(), parents);
    }

    #[test]
    fn roundtrip_two_parents() {
        let parents = ParentCommits::new(Hash::of(b"one"), Some(Hash::of(b"two")));
        let bytes = SnapshotMarker::encode(&parents);
        assert_eq!(bytes.len(), 48);
        assert_eq!(SnapshotMarker::decode(&bytes).unwrap(), parents);
    }

    #[test]
    fn legacy_hex_format_is_read_accepted() {
        let hash = Hash::of(b"legacy");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), LEGACY_HEX_LEN);
        let decoded = SnapshotMarker::decode(hex.as_bytes()).unwrap();
        assert_eq!(decoded, ParentCommits::single(hash));
    }

    #[test]
    fn legacy_hex_format_with_trailing_whitespace_is_accepted() {
        let hash = Hash::of(b"legacy");
        let mut bytes = hash.to_hex().into_bytes();
        bytes.push(b'\n');
        let decoded = SnapshotMarker::decode(&bytes).unwrap();
        assert_eq!(decoded, ParentCommits::single(hash));
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let mut bytes = SnapshotMarker::encode(&ParentCommits::single(Hash::of(b"x")));
        bytes[0] = b'X';
        assert!(matches!(
            SnapshotMarker::decode(&bytes),
            Err(EdenError::CorruptSnapshot(_))
        ));
    }

    #[test]
    fn wrong_length_is_corrupt() {
        assert!(matches!(
            SnapshotMarker::decode(&[0u8; 10]),
            Err(EdenError::CorruptSnapshot(_))
        ));
    }

    #[test]
    fn write_never_emits_legacy_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SNAPSHOT");
        let parents = ParentCommits::single(Hash::of(b"fresh"));
        SnapshotMarker::write(&path, &parents).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], MAGIC);
        assert_eq!(SnapshotMarker::read(&path).unwrap(), parents);
    }
}
