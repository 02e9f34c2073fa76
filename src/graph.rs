//! The live inode graph: ties the name index, the in-memory inode
//! table, the overlay, and the object store together into the
//! operations the dispatcher needs. Grounded on
//! `castore::fs::mod.rs`'s `TvixStoreFs` (lookup/readdir driving lazy
//! expansion of tree children into inodes) and
//! `original_source/eden/fuse/InodeDispatcher.cpp` (lookup-count
//! refcounting, rename/unlink error shapes).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{EdenError, Result};
use crate::hash::Hash;
use crate::inodes::{DirEntry, DirInode, FileInode, FileState, Inode, InodeKind};
use crate::model::{Blob, EntryKind, Tree};
use crate::namemgr::{NameManager, ROOT_NODE_ID};
use crate::objectstore::ObjectStore;
use crate::overlay::{
    FileDescriptor, InodeNumber, Overlay, OverlayBodyTag, OverlayDir, OverlayEntry,
    OverlayEntryKind, BLAKE3_XATTR, SHA1_XATTR,
};
use crate::path::PathComponent;

fn entry_kind_to_overlay(kind: EntryKind) -> OverlayEntryKind {
    match kind {
        EntryKind::Regular => OverlayEntryKind::Regular,
        EntryKind::Executable => OverlayEntryKind::Executable,
        EntryKind::Symlink => OverlayEntryKind::Symlink,
        EntryKind::Directory => OverlayEntryKind::Directory,
    }
}

fn mode_bits_for(kind: EntryKind, owner_perm_bits: u8) -> u32 {
    let base = match kind {
        EntryKind::Directory => libc::S_IFDIR,
        EntryKind::Symlink => libc::S_IFLNK,
        _ => libc::S_IFREG,
    };
    base as u32 | owner_perm_bits as u32
}

/// Fields needed to build an attribute reply for one inode, gathered
/// under a single pass over its lock. See [`InodeGraph::attr_info`].
#[derive(Debug, Clone, Copy)]
pub struct AttrInfo {
    pub is_dir: bool,
    pub mode_bits: u32,
    pub rdev: u32,
    pub size: u64,
}

/// The in-memory graph of live inodes for one mount. Inode numbers are
/// allocated and named through a [`NameManager`]; their file/directory
/// payload is fetched from the [`ObjectStore`] on first access and, once
/// materialized, read back from the [`Overlay`].
pub struct InodeGraph {
    object_store: Arc<dyn ObjectStore>,
    overlay: Arc<dyn Overlay>,
    names: NameManager,
    inodes: RwLock<HashMap<InodeNumber, Arc<Inode>>>,
    next_handle: AtomicU64,
}

impl InodeGraph {
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        overlay: Arc<dyn Overlay>,
        root_tree_hash: Hash,
    ) -> Result<Self> {
        let names = NameManager::new();
        let mut inodes = HashMap::new();
        inodes.insert(
            ROOT_NODE_ID,
            Arc::new(Inode::new(
                ROOT_NODE_ID,
                InodeKind::Dir(DirInode::sparse(root_tree_hash)),
            )),
        );
        let graph = Self {
            object_store,
            overlay,
            names,
            inodes: RwLock::new(inodes),
            next_handle: AtomicU64::new(1),
        };
        graph.ensure_dir_populated(ROOT_NODE_ID)?;
        Ok(graph)
    }

    fn get_inode(&self, ino: InodeNumber) -> Result<Arc<Inode>> {
        self.inodes.read().get(&ino).cloned().ok_or(EdenError::NoEntry)
    }

    /// Loads a directory's children from the object store the first
    /// time it's accessed, allocating an inode number (and a minimal
    /// stub `Inode`) for each child that doesn't have one yet.
    fn ensure_dir_populated(&self, ino: InodeNumber) -> Result<()> {
        let inode = self.get_inode(ino)?;
        let tree_hash = {
            let kind = inode.kind.read();
            match &*kind {
                InodeKind::Dir(dir) if dir.entries_loaded => return Ok(()),
                InodeKind::Dir(dir) => dir.tree_hash,
                InodeKind::File(_) => return Err(EdenError::NotDir),
            }
        };
        let Some(tree_hash) = tree_hash else {
            // materialized directory with no backing tree: nothing to load.
            let mut kind = inode.kind.write();
            if let InodeKind::Dir(dir) = &mut *kind {
                dir.entries_loaded = true;
            }
            return Ok(());
        };
        let tree = self
            .object_store
            .get_tree(&tree_hash)?
            .ok_or(EdenError::NoEntry)?;

        let mut entries = HashMap::new();
        for entry in tree.entries() {
            let node = self.names.get_or_create(ino, &entry.name);
            let child_kind = match entry.kind {
                EntryKind::Directory => InodeKind::Dir(DirInode::sparse(entry.target_hash)),
                _ => InodeKind::File(FileInode::loaded(
                    entry.target_hash,
                    mode_bits_for(entry.kind, entry.owner_perm_bits),
                    0,
                    (0, 0),
                )),
            };
            self.inodes
                .write()
                .entry(node.node_id)
                .or_insert_with(|| Arc::new(Inode::new(node.node_id, child_kind)));
            entries.insert(
                entry.name.clone(),
                DirEntry {
                    ino: node.node_id,
                    kind: entry.kind,
                    target_hash: Some(entry.target_hash),
                    owner_perm_bits: entry.owner_perm_bits,
                },
            );
        }

        let mut kind = inode.kind.write();
        if let InodeKind::Dir(dir) = &mut *kind {
            dir.entries = entries;
            dir.entries_loaded = true;
        }
        Ok(())
    }

    /// Resolves `name` inside `parent`, incrementing its lookup count by
    /// one on success, as the kernel's `lookup` contract requires.
    pub fn lookup(&self, parent: InodeNumber, name: &PathComponent) -> Result<InodeNumber> {
        self.ensure_dir_populated(parent)?;
        let parent_inode = self.get_inode(parent)?;
        let entry = {
            let kind = parent_inode.kind.read();
            match &*kind {
                InodeKind::Dir(dir) => dir.entries.get(name).copied(),
                InodeKind::File(_) => return Err(EdenError::NotDir),
            }
        }
        .ok_or(EdenError::NoEntry)?;
        self.rehydrate(entry)?.incref(1);
        Ok(entry.ino)
    }

    /// Returns the live `Inode` for `entry.ino`, reconstructing it from
    /// the backing tree hash (or, if materialized since, the overlay) if
    /// a prior `forget` evicted it from the in-memory table. A directory
    /// still referenced through `entry` is never in this position: see
    /// the eviction policy note in `forget`.
    fn rehydrate(&self, entry: DirEntry) -> Result<Arc<Inode>> {
        if let Some(inode) = self.inodes.read().get(&entry.ino).cloned() {
            return Ok(inode);
        }
        let mode_bits = mode_bits_for(entry.kind, entry.owner_perm_bits);
        let state = if self.overlay.open_overlay_file_no_verify(entry.ino)?.is_some() {
            FileState::Materialized {
                mode_bits,
                rdev: 0,
                sha1_valid: false,
            }
        } else {
            let target_hash = entry.target_hash.ok_or(EdenError::NoEntry)?;
            FileState::Loaded {
                backing_hash: target_hash,
                cached_blob: None,
                mode_bits,
                rdev: 0,
                creation_time: (0, 0),
            }
        };
        let inode = Arc::new(Inode::new(entry.ino, InodeKind::File(FileInode { state })));
        self.inodes.write().insert(entry.ino, inode.clone());
        Ok(inode)
    }

    /// Processes a kernel `forget(ino, count)`. If the lookup count
    /// reaches zero, the name-index entry (once it has been unlinked) is
    /// evicted immediately, freeing the inode number for reuse.
    ///
    /// A live file `Inode` not yet unlinked is also dropped from the
    /// in-memory table at this point: `lookup`/`rehydrate` can always
    /// rebuild one from its parent's cached tree entry (or the overlay,
    /// if it was materialized since). A directory's `entries` map is
    /// the only record of its topology once its backing tree has been
    /// fully superseded by overlay-only children (`mkdir`, materialized
    /// renames), so directories stay resident until unlinked.
    pub fn forget(&self, ino: InodeNumber, count: u64) {
        if ino == ROOT_NODE_ID {
            return;
        }
        let Some(inode) = self.inodes.read().get(&ino).cloned() else {
            return;
        };
        if inode.decref(count) == 0 {
            let unlinked = self
                .names
                .get_node_by_id(ino)
                .map(|n| n.unlinked)
                .unwrap_or(true);
            if unlinked {
                self.inodes.write().remove(&ino);
                self.names.evict(ino);
            } else if inode.is_file() {
                self.inodes.write().remove(&ino);
            }
        }
    }

    pub fn readdir(&self, ino: InodeNumber) -> Result<Vec<(PathComponent, DirEntry)>> {
        self.ensure_dir_populated(ino)?;
        let inode = self.get_inode(ino)?;
        let kind = inode.kind.read();
        match &*kind {
            InodeKind::Dir(dir) => Ok(dir
                .entries
                .iter()
                .map(|(name, entry)| (name.clone(), *entry))
                .collect()),
            InodeKind::File(_) => Err(EdenError::NotDir),
        }
    }

    pub fn is_dir(&self, ino: InodeNumber) -> Result<bool> {
        Ok(self.get_inode(ino)?.is_dir())
    }

    /// Whether a file inode has been materialized into the overlay. Used
    /// by the dispatcher to tell whether a read had to import content
    /// from the backing object store.
    pub fn is_materialized(&self, ino: InodeNumber) -> Result<bool> {
        let inode = self.get_inode(ino)?;
        let kind = inode.kind.read();
        match &*kind {
            InodeKind::File(file) => Ok(file.is_materialized()),
            InodeKind::Dir(dir) => Ok(dir.materialized),
        }
    }

    /// Materializes a file's content into the overlay (first write).
    /// Materializing a directory propagates up the ancestor chain,
    /// stopping as soon as an already-materialized ancestor is found.
    pub fn materialize_file(&self, ino: InodeNumber) -> Result<()> {
        let inode = self.get_inode(ino)?;
        let bytes = {
            let mut kind = inode.kind.write();
            let InodeKind::File(file) = &mut *kind else {
                return Err(EdenError::IsDir);
            };
            if file.is_materialized() {
                return Ok(());
            }
            let backing_hash = match &file.state {
                FileState::Loaded { backing_hash, .. } => *backing_hash,
                FileState::Materialized { .. } => unreachable!(),
            };
            let blob = self
                .object_store
                .get_blob(&backing_hash)?
                .unwrap_or_else(|| Blob::new(Vec::new()));
            file.materialize();
            blob.bytes().to_vec()
        };
        self.overlay.create_overlay_file(ino, &bytes)?;
        self.materialize_ancestors(ino)?;
        Ok(())
    }

    fn materialize_ancestors(&self, ino: InodeNumber) -> Result<()> {
        let mut current = ino;
        loop {
            let Some(node) = self.names.get_node_by_id(current) else {
                return Ok(());
            };
            if node.node_id == ROOT_NODE_ID {
                let inode = self.get_inode(ROOT_NODE_ID)?;
                let mut kind = inode.kind.write();
                if let InodeKind::Dir(dir) = &mut *kind {
                    if !dir.materialize() {
                        return Ok(());
                    }
                }
                return Ok(());
            }
            let parent = node.parent;
            let parent_inode = self.get_inode(parent)?;
            let continued = {
                let mut kind = parent_inode.kind.write();
                match &mut *kind {
                    InodeKind::Dir(dir) => dir.materialize(),
                    InodeKind::File(_) => false,
                }
            };
            if !continued {
                return Ok(());
            }
            current = parent;
        }
    }

    pub fn read_file(&self, ino: InodeNumber, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let inode = self.get_inode(ino)?;
        let kind = inode.kind.read();
        let InodeKind::File(file) = &*kind else {
            return Err(EdenError::IsDir);
        };
        match &file.state {
            FileState::Materialized { .. } => {
                let fd = self
                    .overlay
                    .open_overlay_file(ino, OverlayBodyTag::File)?
                    .ok_or(EdenError::NoEntry)?;
                fd.read_at(offset, buf)
            }
            FileState::Loaded { backing_hash, .. } => {
                let blob = self
                    .object_store
                    .get_blob(backing_hash)?
                    .ok_or(EdenError::NoEntry)?;
                let bytes = blob.bytes();
                let offset = offset as usize;
                if offset >= bytes.len() {
                    return Ok(0);
                }
                let n = buf.len().min(bytes.len() - offset);
                buf[..n].copy_from_slice(&bytes[offset..offset + n]);
                Ok(n)
            }
        }
    }

    pub fn write_file(&self, ino: InodeNumber, offset: u64, buf: &[u8]) -> Result<usize> {
        self.materialize_file(ino)?;
        let inode = self.get_inode(ino)?;
        {
            let mut kind = inode.kind.write();
            let InodeKind::File(file) = &mut *kind else {
                return Err(EdenError::IsDir);
            };
            file.invalidate_sha1();
        }
        let fd = self
            .overlay
            .open_overlay_file(ino, OverlayBodyTag::File)?
            .ok_or(EdenError::NoEntry)?;
        fd.write_at(offset, buf)
    }

    /// Returns (computing if necessary) the content SHA-1 of a
    /// materialized file, caching it in the overlay's `user.sha1` xattr.
    pub fn get_sha1(&self, ino: InodeNumber) -> Result<Hash> {
        let inode = self.get_inode(ino)?;
        let materialized = {
            let kind = inode.kind.read();
            let InodeKind::File(file) = &*kind else {
                return Err(EdenError::IsDir);
            };
            file.is_materialized()
        };
        if !materialized {
            let kind = inode.kind.read();
            let InodeKind::File(file) = &*kind else {
                return Err(EdenError::IsDir);
            };
            let backing_hash = match &file.state {
                FileState::Loaded { backing_hash, .. } => *backing_hash,
                FileState::Materialized { .. } => unreachable!(),
            };
            return self
                .object_store
                .get_sha1_for_blob(&backing_hash)?
                .ok_or(EdenError::NoEntry);
        }

        if let Some(cached) = self.overlay.get_xattr(ino, SHA1_XATTR)? {
            if let Ok(hash) = Hash::from_bytes(&cached) {
                return Ok(hash);
            }
        }

        let fd = self
            .overlay
            .open_overlay_file(ino, OverlayBodyTag::File)?
            .ok_or(EdenError::NoEntry)?;
        let len = fd.len()?;
        let mut contents = vec![0u8; len as usize];
        fd.read_at(0, &mut contents)?;
        let hash = Hash::of(&contents);

        self.overlay.set_xattr(ino, SHA1_XATTR, hash.as_bytes())?;
        {
            let mut kind = inode.kind.write();
            if let InodeKind::File(file) = &mut *kind {
                if let FileState::Materialized { sha1_valid, .. } = &mut file.state {
                    *sha1_valid = true;
                }
            }
        }
        Ok(hash)
    }

    pub fn unlink(&self, parent: InodeNumber, name: &PathComponent) -> Result<()> {
        self.ensure_dir_populated(parent)?;
        let parent_inode = self.get_inode(parent)?;
        let child_ino = {
            let mut kind = parent_inode.kind.write();
            let InodeKind::Dir(dir) = &mut *kind else {
                return Err(EdenError::NotDir);
            };
            let entry = dir.entries.get(name).copied().ok_or(EdenError::NoEntry)?;
            if entry.kind == EntryKind::Directory {
                return Err(EdenError::IsDir);
            }
            dir.entries.remove(name);
            entry.ino
        };

        self.names.unlink(parent, name)?;
        if self.overlay.supports_semantic_operations() {
            if self.overlay.has_child(parent, name).unwrap_or(false) {
                self.overlay.remove_child(parent, name)?;
            }
        } else if let Some(mut row) = self.overlay.load_dir(parent)? {
            row.remove(name);
            self.overlay.save_dir(parent, row)?;
        }
        self.overlay.remove_file(child_ino)?;
        Ok(())
    }

    pub fn rmdir(&self, parent: InodeNumber, name: &PathComponent) -> Result<()> {
        self.ensure_dir_populated(parent)?;
        let parent_inode = self.get_inode(parent)?;
        let child_ino = {
            let mut kind = parent_inode.kind.write();
            let InodeKind::Dir(dir) = &mut *kind else {
                return Err(EdenError::NotDir);
            };
            let entry = dir.entries.get(name).copied().ok_or(EdenError::NoEntry)?;
            if entry.kind != EntryKind::Directory {
                return Err(EdenError::NotDir);
            }
            entry.ino
        };
        self.ensure_dir_populated(child_ino)?;
        {
            let child_inode = self.get_inode(child_ino)?;
            let kind = child_inode.kind.read();
            if let InodeKind::Dir(dir) = &*kind {
                if !dir.entries.is_empty() {
                    return Err(EdenError::NotEmpty);
                }
            }
        }

        {
            let mut kind = parent_inode.kind.write();
            if let InodeKind::Dir(dir) = &mut *kind {
                dir.entries.remove(name);
            }
        }
        self.names.unlink(parent, name)?;
        if self.overlay.supports_semantic_operations() {
            if self.overlay.has_child(parent, name).unwrap_or(false) {
                self.overlay.remove_child(parent, name)?;
            }
        } else if let Some(mut row) = self.overlay.load_dir(parent)? {
            row.remove(name);
            self.overlay.save_dir(parent, row)?;
        }
        self.overlay.remove_dir(child_ino)?;
        Ok(())
    }

    /// Renames `(old_parent, old_name)` to `(new_parent, new_name)`.
    /// Refuses cross-mount renames ([`EdenError::CrossMount`] — this
    /// graph only ever models a single mount, so it's raised by callers,
    /// not here) and renames onto a non-empty directory
    /// ([`EdenError::NotEmpty`]).
    pub fn rename(
        &self,
        old_parent: InodeNumber,
        old_name: &PathComponent,
        new_parent: InodeNumber,
        new_name: &PathComponent,
    ) -> Result<()> {
        self.ensure_dir_populated(old_parent)?;
        self.ensure_dir_populated(new_parent)?;

        let moved_entry = {
            let old_parent_inode = self.get_inode(old_parent)?;
            let kind = old_parent_inode.kind.read();
            let InodeKind::Dir(dir) = &*kind else {
                return Err(EdenError::NotDir);
            };
            *dir.entries.get(old_name).ok_or(EdenError::NoEntry)?
        };

        let existing = {
            let new_parent_inode = self.get_inode(new_parent)?;
            let kind = new_parent_inode.kind.read();
            let InodeKind::Dir(dir) = &*kind else {
                return Err(EdenError::NotDir);
            };
            dir.entries.get(new_name).copied()
        };

        if let Some(existing) = existing {
            if existing.kind == EntryKind::Directory {
                self.ensure_dir_populated(existing.ino)?;
                let existing_inode = self.get_inode(existing.ino)?;
                let kind = existing_inode.kind.read();
                if let InodeKind::Dir(dir) = &*kind {
                    if !dir.entries.is_empty() {
                        return Err(EdenError::NotEmpty);
                    }
                }
            }
            self.names.unlink(new_parent, new_name)?;
        }

        {
            let old_parent_inode = self.get_inode(old_parent)?;
            let mut kind = old_parent_inode.kind.write();
            if let InodeKind::Dir(dir) = &mut *kind {
                dir.entries.remove(old_name);
            }
        }
        {
            let new_parent_inode = self.get_inode(new_parent)?;
            let mut kind = new_parent_inode.kind.write();
            if let InodeKind::Dir(dir) = &mut *kind {
                dir.entries.insert(new_name.clone(), moved_entry);
            }
        }
        self.names.rename(old_parent, old_name, new_parent, new_name)?;

        if self.overlay.supports_semantic_operations() {
            self.overlay
                .rename_child(old_parent, new_parent, old_name, new_name)?;
        } else {
            let mut old_row = self.overlay.load_dir(old_parent)?.unwrap_or_default();
            let entry = old_row.remove(old_name);
            self.overlay.save_dir(old_parent, old_row)?;
            if let Some(entry) = entry {
                let mut new_row = self.overlay.load_dir(new_parent)?.unwrap_or_default();
                new_row.insert(new_name.clone(), entry);
                self.overlay.save_dir(new_parent, new_row)?;
            }
        }
        self.materialize_ancestors(old_parent)?;
        self.materialize_ancestors(new_parent)?;
        Ok(())
    }

    pub fn mkdir(&self, parent: InodeNumber, name: &PathComponent) -> Result<InodeNumber> {
        self.ensure_dir_populated(parent)?;
        let parent_inode = self.get_inode(parent)?;
        {
            let kind = parent_inode.kind.read();
            let InodeKind::Dir(dir) = &*kind else {
                return Err(EdenError::NotDir);
            };
            if dir.entries.contains_key(name) {
                return Err(EdenError::Exists);
            }
        }

        let node = self.names.get_or_create(parent, name);
        let child = Arc::new(Inode::new(
            node.node_id,
            InodeKind::Dir(DirInode::empty_materialized()),
        ));
        self.inodes.write().insert(node.node_id, child);

        {
            let mut kind = parent_inode.kind.write();
            if let InodeKind::Dir(dir) = &mut *kind {
                dir.entries.insert(
                    name.clone(),
                    DirEntry {
                        ino: node.node_id,
                        kind: EntryKind::Directory,
                        target_hash: None,
                        owner_perm_bits: 0,
                    },
                );
            }
        }

        self.overlay.save_dir(node.node_id, OverlayDir::new())?;
        if self.overlay.supports_semantic_operations() {
            self.overlay.add_child(
                parent,
                name.clone(),
                OverlayEntry {
                    ino: node.node_id,
                    kind: OverlayEntryKind::Directory,
                    materialized: true,
                },
            )?;
        } else {
            let mut row = self.overlay.load_dir(parent)?.unwrap_or_default();
            row.insert(
                name.clone(),
                OverlayEntry {
                    ino: node.node_id,
                    kind: OverlayEntryKind::Directory,
                    materialized: true,
                },
            );
            self.overlay.save_dir(parent, row)?;
        }
        self.materialize_ancestors(node.node_id)?;
        Ok(node.node_id)
    }

    pub fn create_file(
        &self,
        parent: InodeNumber,
        name: &PathComponent,
        mode_bits: u32,
    ) -> Result<InodeNumber> {
        self.create_file_entry(parent, name, EntryKind::Regular, mode_bits, 0, Vec::new())
    }

    /// Creates a device/fifo/socket node. The backing tree model has no
    /// representation for these (trees only ever name regular/executable/
    /// symlink/directory children), so such nodes live purely in the
    /// overlay and are tagged `EntryKind::Regular` for directory-listing
    /// purposes; their real type lives only in `mode_bits`.
    pub fn mknod(
        &self,
        parent: InodeNumber,
        name: &PathComponent,
        mode_bits: u32,
        rdev: u32,
    ) -> Result<InodeNumber> {
        self.create_file_entry(parent, name, EntryKind::Regular, mode_bits, rdev, Vec::new())
    }

    /// Creates a symlink whose target is stored as the file's body, the
    /// same way a content-addressed tree entry of kind `Symlink` stores
    /// its target as the referenced blob's bytes.
    pub fn symlink(
        &self,
        parent: InodeNumber,
        name: &PathComponent,
        target: &[u8],
    ) -> Result<InodeNumber> {
        self.create_file_entry(
            parent,
            name,
            EntryKind::Symlink,
            libc::S_IFLNK as u32 | 0o777,
            0,
            target.to_vec(),
        )
    }

    fn create_file_entry(
        &self,
        parent: InodeNumber,
        name: &PathComponent,
        entry_kind: EntryKind,
        mode_bits: u32,
        rdev: u32,
        body: Vec<u8>,
    ) -> Result<InodeNumber> {
        self.ensure_dir_populated(parent)?;
        let parent_inode = self.get_inode(parent)?;
        {
            let kind = parent_inode.kind.read();
            let InodeKind::Dir(dir) = &*kind else {
                return Err(EdenError::NotDir);
            };
            if dir.entries.contains_key(name) {
                return Err(EdenError::Exists);
            }
        }

        let node = self.names.get_or_create(parent, name);
        let child = Arc::new(Inode::new(
            node.node_id,
            InodeKind::File(FileInode {
                state: FileState::Materialized {
                    mode_bits,
                    rdev,
                    sha1_valid: false,
                },
            }),
        ));
        self.inodes.write().insert(node.node_id, child);

        {
            let mut kind = parent_inode.kind.write();
            if let InodeKind::Dir(dir) = &mut *kind {
                dir.entries.insert(
                    name.clone(),
                    DirEntry {
                        ino: node.node_id,
                        kind: entry_kind,
                        target_hash: None,
                        owner_perm_bits: (mode_bits & 0o777) as u8,
                    },
                );
            }
        }

        self.overlay.create_overlay_file(node.node_id, &body)?;
        let overlay_kind = entry_kind_to_overlay(entry_kind);
        if self.overlay.supports_semantic_operations() {
            self.overlay.add_child(
                parent,
                name.clone(),
                OverlayEntry {
                    ino: node.node_id,
                    kind: overlay_kind,
                    materialized: true,
                },
            )?;
        } else {
            let mut row = self.overlay.load_dir(parent)?.unwrap_or_default();
            row.insert(
                name.clone(),
                OverlayEntry {
                    ino: node.node_id,
                    kind: overlay_kind,
                    materialized: true,
                },
            );
            self.overlay.save_dir(parent, row)?;
        }
        self.materialize_ancestors(node.node_id)?;
        Ok(node.node_id)
    }

    /// Reads a symlink's full target. Works whether or not the symlink
    /// has been materialized, the same as an ordinary file read.
    pub fn read_symlink(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        let info = self.attr_info(ino)?;
        if info.is_dir {
            return Err(EdenError::IsDir);
        }
        let mut buf = vec![0u8; info.size as usize];
        self.read_file(ino, 0, &mut buf)?;
        Ok(buf)
    }

    /// Gathers the fields the dispatcher needs to build an attribute
    /// reply for one inode. Directories report a fixed `0o755` mode and
    /// their child count as `size`, mirroring `castore`'s `gen_file_attr`
    /// treatment of `DirectoryInodeData` (no per-directory permission bits
    /// are tracked, only a content-derived size).
    pub fn attr_info(&self, ino: InodeNumber) -> Result<AttrInfo> {
        let inode = self.get_inode(ino)?;
        enum Snapshot {
            Dir { len: u64 },
            File { state: FileState },
        }
        let snapshot = {
            let kind = inode.kind.read();
            match &*kind {
                InodeKind::Dir(dir) => Snapshot::Dir {
                    len: dir.entries.len() as u64,
                },
                InodeKind::File(file) => Snapshot::File {
                    state: file.state.clone(),
                },
            }
        };
        match snapshot {
            Snapshot::Dir { len } => Ok(AttrInfo {
                is_dir: true,
                mode_bits: libc::S_IFDIR as u32 | 0o755,
                rdev: 0,
                size: len,
            }),
            Snapshot::File { state } => {
                let (mode_bits, rdev, size) = match state {
                    FileState::Materialized { mode_bits, rdev, .. } => {
                        let len = self
                            .overlay
                            .open_overlay_file(ino, OverlayBodyTag::File)?
                            .map(|fd| fd.len())
                            .transpose()?
                            .unwrap_or(0);
                        (mode_bits, rdev, len)
                    }
                    FileState::Loaded { mode_bits, rdev, backing_hash, .. } => {
                        let len = self
                            .object_store
                            .get_blob(&backing_hash)?
                            .map(|b| b.len())
                            .unwrap_or(0);
                        (mode_bits, rdev, len)
                    }
                };
                Ok(AttrInfo {
                    is_dir: false,
                    mode_bits,
                    rdev,
                    size,
                })
            }
        }
    }

    /// Sets a file's mode bits. A no-op for directories: `DirInode`
    /// tracks no permission bits of its own (see [`Self::attr_info`]).
    pub fn set_mode_bits(&self, ino: InodeNumber, mode_bits: u32) -> Result<()> {
        let inode = self.get_inode(ino)?;
        let mut kind = inode.kind.write();
        if let InodeKind::File(file) = &mut *kind {
            file.set_mode_bits(mode_bits);
        }
        Ok(())
    }

    /// Truncates a file to `len`, materializing it first if needed.
    pub fn truncate_file(&self, ino: InodeNumber, len: u64) -> Result<()> {
        self.materialize_file(ino)?;
        let fd = self
            .overlay
            .open_overlay_file(ino, OverlayBodyTag::File)?
            .ok_or(EdenError::NoEntry)?;
        fd.set_len(len)?;
        let inode = self.get_inode(ino)?;
        let mut kind = inode.kind.write();
        if let InodeKind::File(file) = &mut *kind {
            file.invalidate_sha1();
        }
        Ok(())
    }

    /// Flushes a materialized file's overlay body to stable storage.
    /// A no-op for files never written to.
    pub fn sync_file(&self, ino: InodeNumber) -> Result<()> {
        let inode = self.get_inode(ino)?;
        let materialized = {
            let kind = inode.kind.read();
            match &*kind {
                InodeKind::File(file) => file.is_materialized(),
                InodeKind::Dir(_) => return Err(EdenError::IsDir),
            }
        };
        if materialized {
            if let Some(fd) = self.overlay.open_overlay_file(ino, OverlayBodyTag::File)? {
                fd.sync()?;
            }
        }
        Ok(())
    }

    pub fn names(&self) -> &NameManager {
        &self.names
    }

    pub fn allocate_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }
}

// Quieted: `BLAKE3_XATTR` is part of the public overlay API surface this
// graph could use for a future content-defined-chunking cache; nothing
// in this module reads it yet.
#[allow(dead_code)]
fn _reference_blake3_xattr() -> &'static str {
    BLAKE3_XATTR
}
