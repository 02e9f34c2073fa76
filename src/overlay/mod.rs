//! The persistent record of materialized directories and file bodies,
//! plus the snapshot marker. Trait shape modeled on
//! `castore::directoryservice::DirectoryService`, with the two concrete
//! backends grounded on `castore::directoryservice::redb` (KV-backed) and
//! `castore::blobservice::simplefs` (sharded flat files), generalized
//! per `original_source/eden/fs/inodes/treeoverlay/TreeOverlayStore.h`.

mod fs_backend;
mod fsck;
mod redb_backend;
pub mod snapshot;

pub use fs_backend::FsOverlay;
pub use fsck::{FsckError, FsckErrorKind, OverlayChecker, RepairResult};
pub use redb_backend::RedbOverlay;

use crate::error::Result;
use crate::hash::Hash;
use crate::path::PathComponent;

pub type InodeNumber = u64;

/// One row's worth of directory entries, as persisted by the Overlay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayDir {
    pub entries: Vec<(PathComponent, OverlayEntry)>,
}

impl OverlayDir {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &PathComponent) -> Option<&OverlayEntry> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, e)| e)
    }

    pub fn insert(&mut self, name: PathComponent, entry: OverlayEntry) {
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = entry;
        } else {
            self.entries.push((name, entry));
        }
    }

    pub fn remove(&mut self, name: &PathComponent) -> Option<OverlayEntry> {
        let idx = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayEntryKind {
    Regular,
    Executable,
    Symlink,
    Directory,
}

/// A directory entry as stored in the overlay: the child's inode number,
/// its kind, and whether the child itself has a materialized body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayEntry {
    pub ino: InodeNumber,
    pub kind: OverlayEntryKind,
    pub materialized: bool,
}

/// Three timestamps stored in the fixed overlay file header: atime,
/// mtime, ctime, each `{seconds, nanoseconds}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OverlayTimestamps {
    pub atime: (i64, u32),
    pub mtime: (i64, u32),
    pub ctime: (i64, u32),
}

pub const OVERLAY_HEADER_VERSION: u32 = 1;
pub const OVERLAY_HEADER_LEN: usize = 4 + 4 + 3 * 12; // tag + version + 3 timestamps

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayBodyTag {
    File,
    Directory,
}

/// Serializes the fixed-size overlay file header. All readers must skip
/// exactly this many bytes before the first body byte; all writers must
/// emit it.
pub fn encode_header(tag: OverlayBodyTag, timestamps: OverlayTimestamps) -> [u8; OVERLAY_HEADER_LEN] {
    let mut buf = [0u8; OVERLAY_HEADER_LEN];
    buf[0..4].copy_from_slice(&(tag as u32).to_be_bytes());
    buf[4..8].copy_from_slice(&OVERLAY_HEADER_VERSION.to_be_bytes());
    let mut pos = 8;
    for (secs, nanos) in [timestamps.atime, timestamps.mtime, timestamps.ctime] {
        buf[pos..pos + 8].copy_from_slice(&secs.to_be_bytes());
        buf[pos + 8..pos + 12].copy_from_slice(&nanos.to_be_bytes());
        pos += 12;
    }
    buf
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("overlay body shorter than header")]
    TooShort,
    #[error("unrecognized overlay body tag: {0}")]
    BadTag(u32),
    #[error("unsupported overlay header version: {0}")]
    BadVersion(u32),
}

pub fn decode_header(
    bytes: &[u8],
) -> std::result::Result<(OverlayBodyTag, OverlayTimestamps), HeaderError> {
    if bytes.len() < OVERLAY_HEADER_LEN {
        return Err(HeaderError::TooShort);
    }
    let tag_raw = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    let tag = match tag_raw {
        0 => OverlayBodyTag::File,
        1 => OverlayBodyTag::Directory,
        other => return Err(HeaderError::BadTag(other)),
    };
    let version = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
    if version != OVERLAY_HEADER_VERSION {
        return Err(HeaderError::BadVersion(version));
    }
    let mut pos = 8;
    let mut read_ts = || {
        let secs = i64::from_be_bytes(bytes[pos..pos + 8].try_into().unwrap());
        let nanos = u32::from_be_bytes(bytes[pos + 8..pos + 12].try_into().unwrap());
        pos += 12;
        (secs, nanos)
    };
    let atime = read_ts();
    let mtime = read_ts();
    let ctime = read_ts();
    Ok((tag, OverlayTimestamps { atime, mtime, ctime }))
}

/// An open overlay file body. Positional I/O is used exclusively so
/// concurrent handlers never mutate a shared file position.
pub trait FileDescriptor: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize>;
    fn set_len(&self, len: u64) -> Result<()>;
    fn len(&self) -> Result<u64>;
    fn sync(&self) -> Result<()>;
}

/// Persists materialized directory content, file bodies, and the
/// snapshot marker for one mount.
pub trait Overlay: Send + Sync {
    /// Opens or creates the overlay. Returns the persisted "next inode
    /// number to allocate" if the overlay was shut down cleanly; `None`
    /// otherwise, signalling the caller to run [`OverlayChecker`].
    fn init(&self, create_if_missing: bool) -> Result<Option<InodeNumber>>;

    /// Persists the next-id watermark and releases resources.
    fn close(&self, next_inode_number: InodeNumber) -> Result<()>;

    fn load_dir(&self, id: InodeNumber) -> Result<Option<OverlayDir>>;
    fn save_dir(&self, id: InodeNumber, dir: OverlayDir) -> Result<()>;

    /// Atomic read-then-remove.
    fn load_and_remove_dir(&self, id: InodeNumber) -> Result<Option<OverlayDir>>;

    /// Refuses with `NotEmpty` if the directory has entries.
    fn remove_dir(&self, id: InodeNumber) -> Result<()>;

    fn has_dir(&self, id: InodeNumber) -> Result<bool>;

    /// Whether `add_child`/`remove_child`/`has_child`/`rename_child` are
    /// implemented. Callers MUST check this before calling any of them;
    /// backends that return `false` panic if called anyway.
    fn supports_semantic_operations(&self) -> bool;

    fn add_child(&self, parent: InodeNumber, name: PathComponent, entry: OverlayEntry) -> Result<()> {
        let _ = (parent, name, entry);
        panic!("add_child called on a backend without semantic operations");
    }
    fn remove_child(&self, parent: InodeNumber, name: &PathComponent) -> Result<()> {
        let _ = (parent, name);
        panic!("remove_child called on a backend without semantic operations");
    }
    fn has_child(&self, parent: InodeNumber, name: &PathComponent) -> Result<bool> {
        let _ = (parent, name);
        panic!("has_child called on a backend without semantic operations");
    }
    /// Must be transactional: destination overwrite + source removal +
    /// rename in one unit.
    fn rename_child(
        &self,
        src: InodeNumber,
        dst: InodeNumber,
        src_name: &PathComponent,
        dst_name: &PathComponent,
    ) -> Result<()> {
        let _ = (src, dst, src_name, dst_name);
        panic!("rename_child called on a backend without semantic operations");
    }

    fn create_overlay_file(&self, id: InodeNumber, bytes: &[u8]) -> Result<Box<dyn FileDescriptor>>;
    fn open_overlay_file(
        &self,
        id: InodeNumber,
        expected_tag: OverlayBodyTag,
    ) -> Result<Option<Box<dyn FileDescriptor>>>;
    fn open_overlay_file_no_verify(&self, id: InodeNumber) -> Result<Option<Box<dyn FileDescriptor>>>;
    fn remove_file(&self, id: InodeNumber) -> Result<()>;

    /// Reserved extended attribute storage on overlay file bodies:
    /// `user.sha1` / `user.blake3`.
    fn get_xattr(&self, id: InodeNumber, name: &str) -> Result<Option<Vec<u8>>>;
    fn set_xattr(&self, id: InodeNumber, name: &str, value: &[u8]) -> Result<()>;
    fn remove_xattr(&self, id: InodeNumber, name: &str) -> Result<()>;

    /// Every inode number with a directory or file row, for the
    /// consistency checker.
    fn all_ids(&self) -> Result<Vec<InodeNumber>>;

    fn snapshot_path(&self) -> std::path::PathBuf;
    fn lost_and_found_dir(&self, id: InodeNumber) -> Result<()>;
}

pub const SHA1_XATTR: &str = "user.sha1";
pub const BLAKE3_XATTR: &str = "user.blake3";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let ts = OverlayTimestamps {
            atime: (1, 2),
            mtime: (3, 4),
            ctime: (5, 6),
        };
        let bytes = encode_header(OverlayBodyTag::File, ts);
        let (tag, decoded) = decode_header(&bytes).unwrap();
        assert_eq!(tag, OverlayBodyTag::File);
        assert_eq!(decoded, ts);
    }

    #[test]
    fn header_too_short_fails() {
        assert_eq!(decode_header(&[0u8; 4]), Err(HeaderError::TooShort));
    }

    #[test]
    fn header_bad_version_fails() {
        let mut bytes = encode_header(OverlayBodyTag::Directory, OverlayTimestamps::default());
        bytes[4..8].copy_from_slice(&99u32.to_be_bytes());
        assert_eq!(decode_header(&bytes), Err(HeaderError::BadVersion(99)));
    }

    #[test]
    fn overlay_dir_insert_get_remove() {
        let mut dir = OverlayDir::new();
        let name = PathComponent::try_from("a").unwrap();
        dir.insert(
            name.clone(),
            OverlayEntry {
                ino: 7,
                kind: OverlayEntryKind::Regular,
                materialized: false,
            },
        );
        assert_eq!(dir.get(&name).unwrap().ino, 7);
        dir.remove(&name);
        assert!(dir.is_empty());
    }
}
