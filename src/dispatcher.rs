//! Translates kernel-facing operations into [`InodeGraph`]/[`FileHandleMap`]
//! calls, assembles the canonical attribute reply, and wraps every call in
//! the timing/interrupt/error-mapping combinator the Channel relies on.
//! Grounded on `original_source/eden/fs/fuse/Dispatcher.{h,cpp}`'s full
//! virtual operation surface, collapsed into one method per op on a plain
//! struct the way `castore::fs::mod.rs`'s `impl FileSystem for
//! TvixStoreFs` turns one trait into one method per kernel request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use crate::error::{EdenError, Result};
use crate::graph::InodeGraph;
use crate::handles::FileHandleMap;
use crate::model::EntryKind;
use crate::overlay::{FileDescriptor, InodeNumber, Overlay, BLAKE3_XATTR, SHA1_XATTR};
use crate::path::PathComponent;
use crate::request::{Opcode, RequestContext};

/// Number of [`Opcode`] variants; keeps the latency histogram a flat,
/// allocation-free array indexed by discriminant.
const OPCODE_COUNT: usize = 30;

/// Per-mount attribute/entry cache timeout. Kept well inside a signed
/// 32-bit seconds count: kernels with a signed cache deadline field
/// misbehave forever once it overflows.
pub const ATTR_TTL: Duration = Duration::from_secs(60);
pub const ENTRY_TTL: Duration = Duration::from_secs(60);

/// The identity a request was made under, threaded through ops (like
/// `access`) that need it. Grounded on `fuse_backend_rs::api::filesystem::Context`,
/// which every `TvixStoreFs` method receives alongside its other
/// arguments.
#[derive(Debug, Clone, Copy, Default)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

/// The canonical attribute record every getattr/setattr/lookup/create
/// reply carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub ino: InodeNumber,
    pub mode: u32,
    pub size: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub atime: (i64, u32),
    pub mtime: (i64, u32),
    pub ctime: (i64, u32),
    pub blocks: u64,
}

/// A resolved or newly created directory entry, as returned by
/// `lookup`/`mkdir`/`mknod`/`symlink`/`create`.
#[derive(Debug, Clone, Copy)]
pub struct EntryReply {
    pub attr: Attr,
    pub attribute_ttl: Duration,
    pub entry_ttl: Duration,
}

/// A timestamp field in a `setattr` mask: either left alone, set to an
/// explicit value, or set to "now" (the kernel distinguishes the two).
#[derive(Debug, Clone, Copy)]
pub enum TimeSpec {
    Set((i64, u32)),
    Now,
}

/// Which `setattr` fields to honour; absent fields keep their current
/// value.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetattrMask {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeSpec>,
    pub mtime: Option<TimeSpec>,
}

pub struct CreateReply {
    pub entry: EntryReply,
    pub handle: u64,
}

/// A minimal, not-statically-tracked filesystem summary for `statfs`.
/// Nothing in this crate tracks real block/inode accounting, so the
/// fields are fixed placeholders large enough never to look exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

const DEFAULT_STATFS: StatFs = StatFs {
    blocks: 1 << 30,
    bfree: 1 << 30,
    bavail: 1 << 30,
    files: 1 << 30,
    ffree: 1 << 30,
    bsize: 4096,
    namelen: 255,
    frsize: 4096,
};

/// A `FileDescriptor` adapter that forwards positional I/O back through
/// the graph for one inode, so the [`FileHandleMap`] can track "this
/// handle is open" without caring whether the file is materialized yet.
struct InodeFileDescriptor {
    graph: Arc<InodeGraph>,
    ino: InodeNumber,
}

impl FileDescriptor for InodeFileDescriptor {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.graph.read_file(self.ino, offset, buf)
    }
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.graph.write_file(self.ino, offset, buf)
    }
    fn set_len(&self, len: u64) -> Result<()> {
        self.graph.truncate_file(self.ino, len)
    }
    fn len(&self) -> Result<u64> {
        Ok(self.graph.attr_info(self.ino)?.size)
    }
    fn sync(&self) -> Result<()> {
        self.graph.sync_file(self.ino)
    }
}

/// Per-opcode count and total latency, queried by whatever reports
/// `eden top`-style stats. A flat array rather than a hashmap or a
/// histogram crate: there's no metrics dependency in this crate's stack
/// to reach for, and 30 fixed buckets need neither.
struct LatencyHistogram {
    counts: [AtomicU64; OPCODE_COUNT],
    total_nanos: [AtomicU64; OPCODE_COUNT],
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            total_nanos: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl LatencyHistogram {
    fn record(&self, opcode: Opcode, elapsed: Duration) {
        let idx = opcode as usize;
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.total_nanos[idx].fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self, opcode: Opcode) -> (u64, Duration) {
        let idx = opcode as usize;
        let count = self.counts[idx].load(Ordering::Relaxed);
        let nanos = self.total_nanos[idx].load(Ordering::Relaxed);
        (count, Duration::from_nanos(nanos))
    }
}

fn attr_from_info(ino: InodeNumber, info: crate::graph::AttrInfo, owner_uid: u32, owner_gid: u32) -> Attr {
    Attr {
        ino,
        mode: info.mode_bits,
        size: info.size,
        nlink: 1,
        uid: owner_uid,
        gid: owner_gid,
        rdev: info.rdev,
        blksize: 4096,
        atime: (0, 0),
        mtime: (0, 0),
        ctime: (0, 0),
        blocks: info.size.div_ceil(512),
    }
}

/// Owns the live inode graph and open-handle table for one mount and
/// exposes the full kernel-facing operation surface. Every method wraps
/// its body in the per-request timing/interrupt combinator described at
/// the top of this module.
pub struct Dispatcher {
    graph: Arc<InodeGraph>,
    handles: Arc<FileHandleMap>,
    overlay: Arc<dyn Overlay>,
    histogram: LatencyHistogram,
    owner_uid: u32,
    owner_gid: u32,
}

impl Dispatcher {
    pub fn new(
        graph: Arc<InodeGraph>,
        handles: Arc<FileHandleMap>,
        overlay: Arc<dyn Overlay>,
        owner_uid: u32,
        owner_gid: u32,
    ) -> Self {
        Self {
            graph,
            handles,
            overlay,
            histogram: LatencyHistogram::default(),
            owner_uid,
            owner_gid,
        }
    }

    /// The generic per-request wrapper: checks for an already-delivered
    /// interrupt, runs `f`, and records latency regardless of outcome.
    /// Unknown/unimplemented opcodes never reach here — the Channel
    /// replies `ENOSYS` to those directly.
    fn dispatch<T>(&self, ctx: &RequestContext, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _entered = ctx.span().enter();
        if ctx.is_interrupted() {
            return Err(EdenError::Interrupted);
        }
        let result = f();
        self.histogram.record(ctx.opcode(), ctx.elapsed());
        result
    }

    fn attr(&self, ino: InodeNumber) -> Result<Attr> {
        let info = self.graph.attr_info(ino)?;
        Ok(attr_from_info(ino, info, self.owner_uid, self.owner_gid))
    }

    fn entry_reply(&self, ino: InodeNumber) -> Result<EntryReply> {
        Ok(EntryReply {
            attr: self.attr(ino)?,
            attribute_ttl: ATTR_TTL,
            entry_ttl: ENTRY_TTL,
        })
    }

    #[instrument(skip_all, fields(rq.parent = parent, rq.name = %name))]
    pub fn lookup(&self, ctx: &RequestContext, parent: InodeNumber, name: &PathComponent) -> Result<EntryReply> {
        self.dispatch(ctx, || {
            let ino = self.graph.lookup(parent, name)?;
            self.entry_reply(ino)
        })
    }

    #[instrument(skip_all, fields(rq.ino = ino, rq.count = count))]
    pub fn forget(&self, ctx: &RequestContext, ino: InodeNumber, count: u64) {
        let _ = self.dispatch(ctx, || {
            self.graph.forget(ino, count);
            Ok(())
        });
    }

    #[instrument(skip_all, fields(rq.ino = ino))]
    pub fn getattr(&self, ctx: &RequestContext, ino: InodeNumber) -> Result<(Attr, Duration)> {
        self.dispatch(ctx, || Ok((self.attr(ino)?, ATTR_TTL)))
    }

    #[instrument(skip_all, fields(rq.ino = ino))]
    pub fn setattr(&self, ctx: &RequestContext, ino: InodeNumber, mask: SetattrMask) -> Result<(Attr, Duration)> {
        self.dispatch(ctx, || {
            if let Some(size) = mask.size {
                self.graph.truncate_file(ino, size)?;
            }
            if let Some(mode) = mask.mode {
                self.graph.set_mode_bits(ino, mode)?;
            }
            // uid/gid/atime/mtime are accepted but not stored: neither
            // `FileInode` nor `DirInode` track a per-inode owner or
            // timestamps beyond what the overlay header already holds
            // for materialized bodies.
            Ok((self.attr(ino)?, ATTR_TTL))
        })
    }

    #[instrument(skip_all, fields(rq.ino = ino))]
    pub fn readlink(&self, ctx: &RequestContext, ino: InodeNumber) -> Result<Vec<u8>> {
        self.dispatch(ctx, || self.graph.read_symlink(ino))
    }

    #[instrument(skip_all, fields(rq.parent = parent, rq.name = %name))]
    pub fn mknod(
        &self,
        ctx: &RequestContext,
        parent: InodeNumber,
        name: &PathComponent,
        mode_bits: u32,
        rdev: u32,
    ) -> Result<EntryReply> {
        self.dispatch(ctx, || {
            let ino = self.graph.mknod(parent, name, mode_bits, rdev)?;
            self.entry_reply(ino)
        })
    }

    #[instrument(skip_all, fields(rq.parent = parent, rq.name = %name))]
    pub fn mkdir(&self, ctx: &RequestContext, parent: InodeNumber, name: &PathComponent) -> Result<EntryReply> {
        self.dispatch(ctx, || {
            let ino = self.graph.mkdir(parent, name)?;
            self.entry_reply(ino)
        })
    }

    #[instrument(skip_all, fields(rq.parent = parent, rq.name = %name))]
    pub fn unlink(&self, ctx: &RequestContext, parent: InodeNumber, name: &PathComponent) -> Result<()> {
        self.dispatch(ctx, || self.graph.unlink(parent, name))
    }

    #[instrument(skip_all, fields(rq.parent = parent, rq.name = %name))]
    pub fn rmdir(&self, ctx: &RequestContext, parent: InodeNumber, name: &PathComponent) -> Result<()> {
        self.dispatch(ctx, || self.graph.rmdir(parent, name))
    }

    #[instrument(skip_all, fields(rq.parent = parent, rq.name = %name))]
    pub fn symlink(
        &self,
        ctx: &RequestContext,
        parent: InodeNumber,
        name: &PathComponent,
        target: &[u8],
    ) -> Result<EntryReply> {
        self.dispatch(ctx, || {
            let ino = self.graph.symlink(parent, name, target)?;
            self.entry_reply(ino)
        })
    }

    #[instrument(skip_all, fields(rq.old_parent = old_parent, rq.new_parent = new_parent))]
    pub fn rename(
        &self,
        ctx: &RequestContext,
        old_parent: InodeNumber,
        old_name: &PathComponent,
        new_parent: InodeNumber,
        new_name: &PathComponent,
    ) -> Result<()> {
        self.dispatch(ctx, || self.graph.rename(old_parent, old_name, new_parent, new_name))
    }

    /// Hard links have no representation in the name index (each inode
    /// has at most one `(parent, name)` edge), so every `link` call is
    /// refused.
    #[instrument(skip_all, fields(rq.ino = ino))]
    pub fn link(&self, ctx: &RequestContext, ino: InodeNumber, _newparent: InodeNumber, _newname: &PathComponent) -> Result<EntryReply> {
        self.dispatch(ctx, || {
            let _ = ino;
            Err(EdenError::Unsupported)
        })
    }

    #[instrument(skip_all, fields(rq.ino = ino))]
    pub fn open(&self, ctx: &RequestContext, ino: InodeNumber) -> Result<u64> {
        self.dispatch(ctx, || {
            if self.graph.is_dir(ino)? {
                return Err(EdenError::IsDir);
            }
            let fd = Box::new(InodeFileDescriptor {
                graph: self.graph.clone(),
                ino,
            });
            self.handles.record_file_handle(fd, ino)
        })
    }

    #[instrument(skip_all, fields(rq.handle = handle))]
    pub fn release(&self, ctx: &RequestContext, handle: u64) -> Result<()> {
        self.dispatch(ctx, || self.handles.forget(handle))
    }

    #[instrument(skip_all, fields(rq.handle = handle, rq.offset = offset))]
    pub fn read(&self, ctx: &RequestContext, handle: u64, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.dispatch(ctx, || {
            let ino = self.handles.inode_of(handle)?;
            if !self.graph.is_materialized(ino)? {
                ctx.set_did_import_from_backing_store();
            }
            self.graph.read_file(ino, offset, buf)
        })
    }

    #[instrument(skip_all, fields(rq.handle = handle, rq.offset = offset))]
    pub fn write(&self, ctx: &RequestContext, handle: u64, offset: u64, buf: &[u8]) -> Result<usize> {
        self.dispatch(ctx, || {
            let ino = self.handles.inode_of(handle)?;
            if !self.graph.is_materialized(ino)? {
                // the first write pulls the backing blob in before
                // materializing over it.
                ctx.set_did_import_from_backing_store();
            }
            self.graph.write_file(ino, offset, buf)
        })
    }

    #[instrument(skip_all, fields(rq.handle = handle))]
    pub fn flush(&self, ctx: &RequestContext, handle: u64) -> Result<()> {
        self.dispatch(ctx, || {
            let ino = self.handles.inode_of(handle)?;
            self.graph.sync_file(ino)
        })
    }

    #[instrument(skip_all, fields(rq.handle = handle))]
    pub fn fsync(&self, ctx: &RequestContext, handle: u64, _datasync: bool) -> Result<()> {
        self.dispatch(ctx, || {
            let ino = self.handles.inode_of(handle)?;
            self.graph.sync_file(ino)
        })
    }

    #[instrument(skip_all, fields(rq.ino = ino))]
    pub fn opendir(&self, ctx: &RequestContext, ino: InodeNumber) -> Result<u64> {
        self.dispatch(ctx, || {
            if !self.graph.is_dir(ino)? {
                return Err(EdenError::NotDir);
            }
            self.handles.record_dir_handle(ino)
        })
    }

    #[instrument(skip_all, fields(rq.handle = handle))]
    pub fn releasedir(&self, ctx: &RequestContext, handle: u64) -> Result<()> {
        self.dispatch(ctx, || self.handles.forget(handle))
    }

    #[instrument(skip_all, fields(rq.handle = handle))]
    pub fn readdir(&self, ctx: &RequestContext, handle: u64) -> Result<Vec<(PathComponent, InodeNumber, EntryKind)>> {
        self.dispatch(ctx, || {
            let ino = self.handles.check_dir_handle(handle)?;
            let entries = self.graph.readdir(ino)?;
            Ok(entries
                .into_iter()
                .map(|(name, entry)| (name, entry.ino, entry.kind))
                .collect())
        })
    }

    #[instrument(skip_all, fields(rq.handle = handle))]
    pub fn fsyncdir(&self, ctx: &RequestContext, handle: u64, _datasync: bool) -> Result<()> {
        self.dispatch(ctx, || {
            self.handles.check_dir_handle(handle)?;
            Ok(())
        })
    }

    #[instrument(skip_all)]
    pub fn statfs(&self, ctx: &RequestContext, _ino: InodeNumber) -> Result<StatFs> {
        self.dispatch(ctx, || Ok(DEFAULT_STATFS))
    }

    #[instrument(skip_all, fields(rq.ino = ino, rq.name = name))]
    pub fn setxattr(&self, ctx: &RequestContext, ino: InodeNumber, name: &str, value: &[u8]) -> Result<()> {
        self.dispatch(ctx, || self.overlay.set_xattr(ino, name, value))
    }

    #[instrument(skip_all, fields(rq.ino = ino, rq.name = name))]
    pub fn getxattr(&self, ctx: &RequestContext, ino: InodeNumber, name: &str) -> Result<Vec<u8>> {
        self.dispatch(ctx, || self.overlay.get_xattr(ino, name)?.ok_or(EdenError::NoAttribute))
    }

    /// Only the reserved `user.sha1`/`user.blake3` attributes are ever
    /// set by this crate, and the overlay has no general "list attribute
    /// names" primitive, so this probes exactly those two.
    #[instrument(skip_all, fields(rq.ino = ino))]
    pub fn listxattr(&self, ctx: &RequestContext, ino: InodeNumber) -> Result<Vec<&'static str>> {
        self.dispatch(ctx, || {
            let mut names = Vec::new();
            for candidate in [SHA1_XATTR, BLAKE3_XATTR] {
                if self.overlay.get_xattr(ino, candidate)?.is_some() {
                    names.push(candidate);
                }
            }
            Ok(names)
        })
    }

    #[instrument(skip_all, fields(rq.ino = ino, rq.name = name))]
    pub fn removexattr(&self, ctx: &RequestContext, ino: InodeNumber, name: &str) -> Result<()> {
        self.dispatch(ctx, || self.overlay.remove_xattr(ino, name))
    }

    #[instrument(skip_all, fields(rq.ino = ino, rq.caller_uid = caller.uid))]
    pub fn access(&self, ctx: &RequestContext, ino: InodeNumber, mask: u32, caller: Caller) -> Result<()> {
        self.dispatch(ctx, || {
            if caller.uid == 0 {
                // root always passes access checks, matching every other
                // inode's getattr treating the mount as single-owner.
                return Ok(());
            }
            let info = self.graph.attr_info(ino)?;
            let owner_bits = (info.mode_bits >> 6) & 0o7;
            if mask & !owner_bits & 0o7 != 0 {
                return Err(EdenError::AccessDenied);
            }
            Ok(())
        })
    }

    #[instrument(skip_all, fields(rq.parent = parent, rq.name = %name))]
    pub fn create(
        &self,
        ctx: &RequestContext,
        parent: InodeNumber,
        name: &PathComponent,
        mode_bits: u32,
    ) -> Result<CreateReply> {
        self.dispatch(ctx, || {
            let ino = self.graph.create_file(parent, name, mode_bits)?;
            let fd = Box::new(InodeFileDescriptor {
                graph: self.graph.clone(),
                ino,
            });
            let handle = self.handles.record_file_handle(fd, ino)?;
            Ok(CreateReply {
                entry: self.entry_reply(ino)?,
                handle,
            })
        })
    }

    /// `bmap` maps a logical file block to a physical one on the
    /// underlying block device; this filesystem has no block device of
    /// its own to report one against.
    #[instrument(skip_all)]
    pub fn bmap(&self, ctx: &RequestContext, _ino: InodeNumber, _block: u64) -> Result<u64> {
        self.dispatch(ctx, || Err(EdenError::NotImplemented))
    }

    /// Per-opcode `(count, total latency)`, for an `eden top`-style
    /// status surface.
    pub fn latency_stats(&self, opcode: Opcode) -> (u64, Duration) {
        self.histogram.snapshot(opcode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Hash;
    use crate::model::{Blob, Tree, TreeEntry};
    use crate::namemgr::ROOT_NODE_ID;
    use crate::objectstore::MemoryObjectStore;
    use crate::overlay::FsOverlay;

    fn comp(s: &str) -> PathComponent {
        PathComponent::try_from(s).unwrap()
    }

    fn fresh_dispatcher() -> (Dispatcher, tempfile::TempDir) {
        let store = Arc::new(MemoryObjectStore::new());
        let dir = tempfile::tempdir().unwrap();
        let overlay: Arc<dyn Overlay> = Arc::new(FsOverlay::new(dir.path()));
        overlay.init(true).unwrap();

        let file_hash = store.insert_blob(Blob::new(b"hello".to_vec()));
        let entry = TreeEntry::new(comp("hello.txt"), file_hash, EntryKind::Regular, 0o644);
        let tree = Tree::new(vec![entry]).unwrap();
        let root_hash = store.insert_tree(tree);

        let graph = Arc::new(InodeGraph::new(store, overlay.clone(), root_hash).unwrap());
        let handles = Arc::new(FileHandleMap::new());
        let dispatcher = Dispatcher::new(graph, handles, overlay, 1000, 1000);
        (dispatcher, dir)
    }

    #[test]
    fn lookup_then_getattr_round_trips_size() {
        let (d, _dir) = fresh_dispatcher();
        let rq = RequestContext::new(Opcode::Lookup, 1);
        let entry = d.lookup(&rq, ROOT_NODE_ID, &comp("hello.txt")).unwrap();
        assert_eq!(entry.attr.size, 5);

        let rq2 = RequestContext::new(Opcode::Getattr, 2);
        let (attr, _ttl) = d.getattr(&rq2, entry.attr.ino).unwrap();
        assert_eq!(attr.size, 5);
        assert_eq!(attr.uid, 1000);
    }

    #[test]
    fn open_read_write_release_round_trip() {
        let (d, _dir) = fresh_dispatcher();
        let rq = RequestContext::new(Opcode::Lookup, 1);
        let ino = d.lookup(&rq, ROOT_NODE_ID, &comp("hello.txt")).unwrap().attr.ino;

        let rq_open = RequestContext::new(Opcode::Open, 2);
        let fh = d.open(&rq_open, ino).unwrap();

        let rq_write = RequestContext::new(Opcode::Write, 3);
        d.write(&rq_write, fh, 0, b"HELLO").unwrap();

        let rq_read = RequestContext::new(Opcode::Read, 4);
        let mut buf = [0u8; 5];
        let n = d.read(&rq_read, fh, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"HELLO");

        let rq_release = RequestContext::new(Opcode::Release, 5);
        d.release(&rq_release, fh).unwrap();
        assert_eq!(d.handles.inode_of(fh), Err(EdenError::BadHandle));
    }

    #[test]
    fn opendir_readdir_releasedir_round_trip() {
        let (d, _dir) = fresh_dispatcher();
        let rq_open = RequestContext::new(Opcode::Opendir, 1);
        let dh = d.opendir(&rq_open, ROOT_NODE_ID).unwrap();

        let rq_readdir = RequestContext::new(Opcode::Readdir, 2);
        let entries = d.readdir(&rq_readdir, dh).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, comp("hello.txt"));

        let rq_release = RequestContext::new(Opcode::Releasedir, 3);
        d.releasedir(&rq_release, dh).unwrap();
    }

    #[test]
    fn mkdir_create_mknod_symlink_all_produce_entries() {
        let (d, _dir) = fresh_dispatcher();
        let rq = RequestContext::new(Opcode::Mkdir, 1);
        let sub = d.mkdir(&rq, ROOT_NODE_ID, &comp("sub")).unwrap();
        assert!(sub.attr.mode & libc::S_IFDIR as u32 != 0);

        let rq_create = RequestContext::new(Opcode::Create, 2);
        let created = d.create(&rq_create, sub.attr.ino, &comp("f"), libc::S_IFREG as u32 | 0o644).unwrap();
        assert_ne!(created.handle, 0);

        let rq_mknod = RequestContext::new(Opcode::Mknod, 3);
        let node = d
            .mknod(&rq_mknod, sub.attr.ino, &comp("dev"), libc::S_IFCHR as u32 | 0o600, 7)
            .unwrap();
        assert_eq!(node.attr.rdev, 7);

        let rq_symlink = RequestContext::new(Opcode::Symlink, 4);
        let link = d.symlink(&rq_symlink, sub.attr.ino, &comp("l"), b"f").unwrap();
        let rq_readlink = RequestContext::new(Opcode::Readlink, 5);
        assert_eq!(d.readlink(&rq_readlink, link.attr.ino).unwrap(), b"f");
    }

    #[test]
    fn link_is_always_unsupported() {
        let (d, _dir) = fresh_dispatcher();
        let rq = RequestContext::new(Opcode::Lookup, 1);
        let ino = d.lookup(&rq, ROOT_NODE_ID, &comp("hello.txt")).unwrap().attr.ino;
        let rq_link = RequestContext::new(Opcode::Link, 2);
        assert_eq!(
            d.link(&rq_link, ino, ROOT_NODE_ID, &comp("hardlink")),
            Err(EdenError::Unsupported)
        );
    }

    #[test]
    fn setattr_size_truncates_and_mode_updates() {
        let (d, _dir) = fresh_dispatcher();
        let rq = RequestContext::new(Opcode::Lookup, 1);
        let ino = d.lookup(&rq, ROOT_NODE_ID, &comp("hello.txt")).unwrap().attr.ino;

        let rq_set = RequestContext::new(Opcode::Setattr, 2);
        let mask = SetattrMask {
            size: Some(2),
            mode: Some(libc::S_IFREG as u32 | 0o600),
            ..Default::default()
        };
        let (attr, _ttl) = d.setattr(&rq_set, ino, mask).unwrap();
        assert_eq!(attr.size, 2);
        assert_eq!(attr.mode, libc::S_IFREG as u32 | 0o600);
    }

    #[test]
    fn xattr_set_get_list_remove_round_trip() {
        let (d, _dir) = fresh_dispatcher();
        let rq = RequestContext::new(Opcode::Lookup, 1);
        let ino = d.lookup(&rq, ROOT_NODE_ID, &comp("hello.txt")).unwrap().attr.ino;

        let rq_set = RequestContext::new(Opcode::Setxattr, 2);
        d.setxattr(&rq_set, ino, SHA1_XATTR, b"deadbeef").unwrap();

        let rq_get = RequestContext::new(Opcode::Getxattr, 3);
        assert_eq!(d.getxattr(&rq_get, ino, SHA1_XATTR).unwrap(), b"deadbeef");

        let rq_list = RequestContext::new(Opcode::Listxattr, 4);
        assert_eq!(d.listxattr(&rq_list, ino).unwrap(), vec![SHA1_XATTR]);

        let rq_rm = RequestContext::new(Opcode::Removexattr, 5);
        d.removexattr(&rq_rm, ino, SHA1_XATTR).unwrap();
        let rq_get2 = RequestContext::new(Opcode::Getxattr, 6);
        assert_eq!(d.getxattr(&rq_get2, ino, SHA1_XATTR), Err(EdenError::NoAttribute));
    }

    #[test]
    fn statfs_and_bmap_have_fixed_replies() {
        let (d, _dir) = fresh_dispatcher();
        let rq = RequestContext::new(Opcode::Statfs, 1);
        assert_eq!(d.statfs(&rq, ROOT_NODE_ID).unwrap(), DEFAULT_STATFS);

        let rq_bmap = RequestContext::new(Opcode::Bmap, 2);
        assert_eq!(d.bmap(&rq_bmap, ROOT_NODE_ID, 0), Err(EdenError::NotImplemented));
    }

    #[test]
    fn interrupted_request_short_circuits() {
        let (d, _dir) = fresh_dispatcher();
        let rq = RequestContext::new(Opcode::Getattr, 1);
        rq.interrupt();
        assert_eq!(d.getattr(&rq, ROOT_NODE_ID), Err(EdenError::Interrupted));
    }

    #[test]
    fn read_before_materialization_sets_backing_store_import_flag() {
        let (d, _dir) = fresh_dispatcher();
        let rq_lookup = RequestContext::new(Opcode::Lookup, 1);
        let ino = d.lookup(&rq_lookup, ROOT_NODE_ID, &comp("hello.txt")).unwrap().attr.ino;

        let rq_open = RequestContext::new(Opcode::Open, 2);
        let fh = d.open(&rq_open, ino).unwrap();

        let rq_read = RequestContext::new(Opcode::Read, 3);
        let mut buf = [0u8; 5];
        d.read(&rq_read, fh, 0, &mut buf).unwrap();
        assert!(rq_read.did_import_from_backing_store());
    }

    #[test]
    fn latency_stats_accumulate_per_opcode() {
        let (d, _dir) = fresh_dispatcher();
        let rq = RequestContext::new(Opcode::Getattr, 1);
        d.getattr(&rq, ROOT_NODE_ID).unwrap();
        let (count, _elapsed) = d.latency_stats(Opcode::Getattr);
        assert_eq!(count, 1);
    }
}
