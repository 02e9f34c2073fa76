//! Open file/directory handle bookkeeping. Grounded on
//! `original_source/eden/fs/fuse/FileHandleMap.{h,cpp}`, with its
//! address-based fast path dropped per the recorded open-question
//! decision: this crate always uses the random-assignment path.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;

use crate::error::{EdenError, Result};
use crate::overlay::{FileDescriptor, InodeNumber};

const MAX_ALLOCATION_ATTEMPTS: u32 = 100;

enum HandlePayload {
    File(Box<dyn FileDescriptor>),
    Dir,
}

struct HandleEntry {
    payload: HandlePayload,
    inode_number: InodeNumber,
}

/// A serialized handle, produced by [`FileHandleMap::serialize_map`] for a
/// graceful restart and consumed by [`FileHandleMap::restore_handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerializedHandle {
    pub handle_id: u64,
    pub is_dir: bool,
    pub inode_number: InodeNumber,
}

/// Assigns file handle numbers and tracks the open file/directory
/// descriptor behind each one. Directory handles carry no descriptor of
/// their own — `readdir` always re-reads through the [`crate::graph::InodeGraph`] —
/// so they're tracked only for their inode number and handle-kind tag.
#[derive(Default)]
pub struct FileHandleMap {
    handles: RwLock<HashMap<u64, HandleEntry>>,
}

impl FileHandleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a fresh handle number for an open file descriptor.
    pub fn record_file_handle(
        &self,
        descriptor: Box<dyn FileDescriptor>,
        inode_number: InodeNumber,
    ) -> Result<u64> {
        self.record(
            HandleEntry {
                payload: HandlePayload::File(descriptor),
                inode_number,
            },
            None,
        )
    }

    /// Assigns a fresh handle number for an open directory.
    pub fn record_dir_handle(&self, inode_number: InodeNumber) -> Result<u64> {
        self.record(
            HandleEntry {
                payload: HandlePayload::Dir,
                inode_number,
            },
            None,
        )
    }

    /// Restores a directory handle at its original number across a
    /// graceful restart. Fails with [`EdenError::Exists`] on a collision.
    pub fn restore_dir_handle(&self, serialized: SerializedHandle) -> Result<()> {
        self.record(
            HandleEntry {
                payload: HandlePayload::Dir,
                inode_number: serialized.inode_number,
            },
            Some(serialized.handle_id),
        )
        .map(|_| ())
    }

    /// Restores a file handle at its original number, given a freshly
    /// reopened descriptor for its inode (the descriptor itself doesn't
    /// survive a restart; only the handle number and inode mapping do).
    pub fn restore_file_handle(
        &self,
        serialized: SerializedHandle,
        descriptor: Box<dyn FileDescriptor>,
    ) -> Result<()> {
        self.record(
            HandleEntry {
                payload: HandlePayload::File(descriptor),
                inode_number: serialized.inode_number,
            },
            Some(serialized.handle_id),
        )
        .map(|_| ())
    }

    fn record(&self, entry: HandleEntry, fixed_number: Option<u64>) -> Result<u64> {
        let mut handles = self.handles.write();
        if let Some(number) = fixed_number {
            if handles.contains_key(&number) {
                return Err(EdenError::Exists);
            }
            handles.insert(number, entry);
            return Ok(number);
        }

        let mut rng = rand::thread_rng();
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let number: u64 = rng.gen();
            if !handles.contains_key(&number) {
                handles.insert(number, entry);
                return Ok(number);
            }
        }
        Err(EdenError::Exhausted)
    }

    /// Returns the inode number a handle refers to, whichever kind it is.
    /// Fails with [`EdenError::BadHandle`] if `fh` isn't tracked.
    pub fn inode_of(&self, fh: u64) -> Result<InodeNumber> {
        self.handles
            .read()
            .get(&fh)
            .map(|e| e.inode_number)
            .ok_or(EdenError::BadHandle)
    }

    /// Runs `f` against the file descriptor behind `fh`. Fails with
    /// [`EdenError::BadHandle`] if untracked, [`EdenError::IsDir`] if `fh`
    /// names a directory handle.
    pub fn with_file<R>(&self, fh: u64, f: impl FnOnce(&dyn FileDescriptor) -> Result<R>) -> Result<R> {
        let handles = self.handles.read();
        let entry = handles.get(&fh).ok_or(EdenError::BadHandle)?;
        match &entry.payload {
            HandlePayload::File(fd) => f(fd.as_ref()),
            HandlePayload::Dir => Err(EdenError::IsDir),
        }
    }

    /// Fails with [`EdenError::BadHandle`] if untracked, [`EdenError::NotDir`]
    /// if `dh` names a file handle.
    pub fn check_dir_handle(&self, dh: u64) -> Result<InodeNumber> {
        let handles = self.handles.read();
        let entry = handles.get(&dh).ok_or(EdenError::BadHandle)?;
        match entry.payload {
            HandlePayload::Dir => Ok(entry.inode_number),
            HandlePayload::File(_) => Err(EdenError::NotDir),
        }
    }

    /// Drops the association for `fh`. Fails with [`EdenError::BadHandle`]
    /// if it wasn't tracked.
    pub fn forget(&self, fh: u64) -> Result<()> {
        self.handles
            .write()
            .remove(&fh)
            .map(|_| ())
            .ok_or(EdenError::BadHandle)
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots the current handle table for a graceful restart,
    /// clearing it in the process (matching the destructive
    /// `serializeMap` shape, which releases the handles it serializes so
    /// the underlying descriptors can be torn down without waiting for an
    /// explicit `release`/`releasedir`).
    pub fn serialize_map(&self) -> Vec<SerializedHandle> {
        let mut handles = self.handles.write();
        let result = handles
            .iter()
            .map(|(&handle_id, entry)| SerializedHandle {
                handle_id,
                is_dir: matches!(entry.payload, HandlePayload::Dir),
                inode_number: entry.inode_number,
            })
            .collect();
        handles.clear();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubFd;
    impl FileDescriptor for StubFd {
        fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize> {
            Ok(0)
        }
        fn write_at(&self, _offset: u64, buf: &[u8]) -> Result<usize> {
            Ok(buf.len())
        }
        fn set_len(&self, _len: u64) -> Result<()> {
            Ok(())
        }
        fn len(&self) -> Result<u64> {
            Ok(0)
        }
        fn sync(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn record_and_lookup_file_handle() {
        let map = FileHandleMap::new();
        let fh = map.record_file_handle(Box::new(StubFd), 42).unwrap();
        assert_eq!(map.inode_of(fh).unwrap(), 42);
        assert!(map.with_file(fh, |_| Ok(())).is_ok());
    }

    #[test]
    fn dir_handle_rejects_file_access() {
        let map = FileHandleMap::new();
        let dh = map.record_dir_handle(7).unwrap();
        assert_eq!(map.with_file(dh, |_| Ok(())), Err(EdenError::IsDir));
        assert_eq!(map.check_dir_handle(dh).unwrap(), 7);
    }

    #[test]
    fn file_handle_rejects_dir_access() {
        let map = FileHandleMap::new();
        let fh = map.record_file_handle(Box::new(StubFd), 7).unwrap();
        assert_eq!(map.check_dir_handle(fh), Err(EdenError::NotDir));
    }

    #[test]
    fn unknown_handle_is_bad_handle() {
        let map = FileHandleMap::new();
        assert_eq!(map.inode_of(999), Err(EdenError::BadHandle));
    }

    #[test]
    fn forget_removes_the_entry() {
        let map = FileHandleMap::new();
        let fh = map.record_dir_handle(1).unwrap();
        map.forget(fh).unwrap();
        assert_eq!(map.forget(fh), Err(EdenError::BadHandle));
    }

    #[test]
    fn serialize_map_clears_the_table() {
        let map = FileHandleMap::new();
        map.record_dir_handle(1).unwrap();
        map.record_file_handle(Box::new(StubFd), 2).unwrap();
        let serialized = map.serialize_map();
        assert_eq!(serialized.len(), 2);
        assert!(map.is_empty());
    }

    #[test]
    fn restore_dir_handle_reproduces_the_mapping() {
        let map = FileHandleMap::new();
        let serialized = SerializedHandle {
            handle_id: 123,
            is_dir: true,
            inode_number: 9,
        };
        map.restore_dir_handle(serialized).unwrap();
        assert_eq!(map.check_dir_handle(123).unwrap(), 9);
    }

    #[test]
    fn restore_handle_collision_is_exists() {
        let map = FileHandleMap::new();
        let serialized = SerializedHandle {
            handle_id: 5,
            is_dir: true,
            inode_number: 1,
        };
        map.restore_dir_handle(serialized).unwrap();
        assert_eq!(map.restore_dir_handle(serialized), Err(EdenError::Exists));
    }
}
