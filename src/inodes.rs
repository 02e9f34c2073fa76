//! Per-inode state: the live data tracked for each allocated inode
//! number while the mount is up. Grounded on
//! `castore::fs::inodes::{InodeData, DirectoryInodeData}`'s sum-type
//! state machine, generalized with file materialization state and
//! directory-content tracking, per
//! `original_source/eden/fuse/{InodeBase,FileInode,DirInode}.h`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::hash::Hash;
use crate::model::{Blob, EntryKind};
use crate::overlay::InodeNumber;
use crate::path::PathComponent;

/// A file's state machine. A file starts `Loaded`, backed by a hash in
/// the object store; the first write (or chmod, or similar) moves it to
/// `Materialized`, backed by a row in the overlay. This transition never
/// runs in reverse.
#[derive(Debug, Clone)]
pub enum FileState {
    Loaded {
        backing_hash: Hash,
        cached_blob: Option<Blob>,
        mode_bits: u32,
        rdev: u32,
        creation_time: (i64, u32),
    },
    Materialized {
        mode_bits: u32,
        rdev: u32,
        /// Whether the cached SHA-1 xattr reflects the current overlay
        /// file contents. Cleared on every write, recomputed on demand.
        sha1_valid: bool,
    },
}

#[derive(Debug, Clone)]
pub struct FileInode {
    pub state: FileState,
}

impl FileInode {
    pub fn loaded(backing_hash: Hash, mode_bits: u32, rdev: u32, creation_time: (i64, u32)) -> Self {
        Self {
            state: FileState::Loaded {
                backing_hash,
                cached_blob: None,
                mode_bits,
                rdev,
                creation_time,
            },
        }
    }

    pub fn is_materialized(&self) -> bool {
        matches!(self.state, FileState::Materialized { .. })
    }

    pub fn mode_bits(&self) -> u32 {
        match &self.state {
            FileState::Loaded { mode_bits, .. } => *mode_bits,
            FileState::Materialized { mode_bits, .. } => *mode_bits,
        }
    }

    /// Moves this file into the `Materialized` state. A no-op (returns
    /// `false`) if it's already there, since writing to an already
    /// materialized file never needs to re-derive anything from its
    /// backing hash.
    pub fn materialize(&mut self) -> bool {
        let (mode_bits, rdev) = match &self.state {
            FileState::Loaded { mode_bits, rdev, .. } => (*mode_bits, *rdev),
            FileState::Materialized { .. } => return false,
        };
        self.state = FileState::Materialized {
            mode_bits,
            rdev,
            sha1_valid: false,
        };
        true
    }

    /// Marks the cached SHA-1 stale; called after every write to a
    /// materialized file's overlay body.
    pub fn invalidate_sha1(&mut self) {
        if let FileState::Materialized { sha1_valid, .. } = &mut self.state {
            *sha1_valid = false;
        }
    }

    /// Overwrites this file's reported mode bits, keeping the file-type
    /// bits (`S_IFREG`/`S_IFLNK`/...) already encoded by the caller.
    pub fn set_mode_bits(&mut self, bits: u32) {
        match &mut self.state {
            FileState::Loaded { mode_bits, .. } => *mode_bits = bits,
            FileState::Materialized { mode_bits, .. } => *mode_bits = bits,
        }
    }
}

/// A directory entry as tracked by the live inode graph: which inode
/// number a name currently resolves to, and what kind of node it is.
///
/// `target_hash`/`owner_perm_bits` carry enough of the original tree
/// entry to rebuild a `Loaded` [`FileInode`] if its live `Inode` was
/// evicted by `forget` in the meantime; entries for nodes that never
/// had a backing tree entry (freshly created files, directories) leave
/// `target_hash` `None` since rehydrating those instead checks the
/// overlay for a materialized body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: InodeNumber,
    pub kind: EntryKind,
    pub target_hash: Option<Hash>,
    pub owner_perm_bits: u8,
}

#[derive(Debug, Clone)]
pub struct DirInode {
    /// `Some` while this directory's entries still come from a known
    /// Tree in the object store rather than from the overlay.
    pub tree_hash: Option<Hash>,
    pub materialized: bool,
    /// Whether `entries` reflects `tree_hash`'s actual children yet.
    /// Entries are fetched lazily on first `lookup`/`readdir` of this
    /// directory rather than eagerly when the parent is expanded.
    pub entries_loaded: bool,
    pub entries: HashMap<PathComponent, DirEntry>,
}

impl DirInode {
    pub fn sparse(tree_hash: Hash) -> Self {
        Self {
            tree_hash: Some(tree_hash),
            materialized: false,
            entries_loaded: false,
            entries: HashMap::new(),
        }
    }

    pub fn empty_materialized() -> Self {
        Self {
            tree_hash: None,
            materialized: true,
            entries_loaded: true,
            entries: HashMap::new(),
        }
    }

    /// Marks this directory materialized. Returns `false` if it already
    /// was, so callers (the inode graph) know whether to keep walking
    /// up the ancestor chain.
    pub fn materialize(&mut self) -> bool {
        if self.materialized {
            return false;
        }
        self.materialized = true;
        true
    }
}

#[derive(Debug, Clone)]
pub enum InodeKind {
    File(FileInode),
    Dir(DirInode),
}

/// The full live state of one allocated inode number: its kernel
/// lookup-count refcount plus its file-or-directory payload.
pub struct Inode {
    pub number: InodeNumber,
    lookup_count: AtomicU64,
    pub kind: parking_lot::RwLock<InodeKind>,
}

impl Inode {
    pub fn new(number: InodeNumber, kind: InodeKind) -> Self {
        Self {
            number,
            lookup_count: AtomicU64::new(0),
            kind: parking_lot::RwLock::new(kind),
        }
    }

    /// Increments the kernel lookup-count refcount, as happens on every
    /// successful `lookup`/`readdirplus`/`mknod`-family reply.
    pub fn incref(&self, by: u64) -> u64 {
        self.lookup_count.fetch_add(by, Ordering::SeqCst) + by
    }

    /// Decrements the refcount by `by` (a kernel `forget` count).
    /// Returns the count remaining; zero means the inode is now
    /// evictable.
    pub fn decref(&self, by: u64) -> u64 {
        self.lookup_count.fetch_sub(by, Ordering::SeqCst) - by
    }

    pub fn lookup_count(&self) -> u64 {
        self.lookup_count.load(Ordering::SeqCst)
    }

    pub fn is_dir(&self) -> bool {
        matches!(*self.kind.read(), InodeKind::Dir(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(*self.kind.read(), InodeKind::File(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_materialize_is_one_way_and_idempotent() {
        let mut f = FileInode::loaded(Hash::of(b"x"), 0o644, 0, (0, 0));
        assert!(!f.is_materialized());
        assert!(f.materialize());
        assert!(f.is_materialized());
        assert!(!f.materialize(), "second materialize call is a no-op");
    }

    #[test]
    fn dir_materialize_reports_first_transition_only() {
        let mut d = DirInode::sparse(Hash::of(b"tree"));
        assert!(d.materialize());
        assert!(!d.materialize());
    }

    #[test]
    fn lookup_count_tracks_incref_decref() {
        let inode = Inode::new(5, InodeKind::Dir(DirInode::empty_materialized()));
        assert_eq!(inode.incref(1), 1);
        assert_eq!(inode.incref(2), 3);
        assert_eq!(inode.decref(3), 0);
    }
}
