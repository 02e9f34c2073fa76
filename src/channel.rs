//! Kernel device framing and the session loop that drives it. Grounded
//! on `original_source/eden/fuse/Channel.{h,cpp}` (invalidate up-calls,
//! session lifecycle) and `castore::fs::fuse::mod.rs`'s `FuseDaemon`
//! (the `threadpool`-backed accept loop shape), with the actual wire
//! format defined by this crate rather than delegated to a FUSE binding
//! crate, per this module's own framing responsibility.
//!
//! Every message, in either direction, is a fixed [`HEADER_LEN`]-byte
//! header followed by an opcode-specific body. A read shorter than the
//! header, or whose declared length disagrees with what was actually
//! read, is treated as an unrecoverable transport error: the session
//! reports it and terminates rather than trying to resynchronize.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use threadpool::ThreadPool;
use tracing::{error, instrument, warn};

use crate::dispatcher::{
    Attr, Caller, CreateReply, Dispatcher, EntryReply, SetattrMask, StatFs, TimeSpec,
};
use crate::error::{EdenError, Result};
use crate::overlay::InodeNumber;
use crate::path::PathComponent;
use crate::request::{Opcode, RequestContext};

/// `{length, opcode, unique, node_id, uid, gid, pid}`, big-endian. This
/// crate's own minimal kernel-request header; `length` is the total
/// message length including these 36 bytes.
pub const HEADER_LEN: usize = 4 + 4 + 8 + 8 + 4 + 4 + 4;

/// Reserved opcode values handled by the channel itself, never reaching
/// the [`Dispatcher`].
pub const OPCODE_INIT: u32 = 0;
pub const OPCODE_INTERRUPT: u32 = 1;

/// The protocol major version this crate speaks. INIT requests naming a
/// different major fail the handshake outright.
pub const PROTOCOL_MAJOR: u32 = 7;
pub const PROTOCOL_MINOR: u32 = 31;

/// Capabilities this server supports; intersected with whatever the
/// kernel offers during INIT.
pub const CAP_ATOMIC_TRUNCATE: u32 = 1 << 0;
pub const CAP_ASYNC_READ: u32 = 1 << 1;
pub const CAP_BIG_WRITES: u32 = 1 << 2;
const SUPPORTED_CAPABILITIES: u32 = CAP_ATOMIC_TRUNCATE | CAP_ASYNC_READ | CAP_BIG_WRITES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub length: u32,
    pub opcode: u32,
    pub unique: u64,
    pub node_id: InodeNumber,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}
fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}
fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_u32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < self.pos + n {
            return Err(EdenError::Io("message body truncated".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn name(&mut self) -> Result<PathComponent> {
        let raw = self.bytes()?;
        PathComponent::try_from(bytes::Bytes::from(raw))
            .map_err(|e| EdenError::Io(format!("invalid name in request: {e}")))
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// Parses the fixed header off the front of a received message and
/// validates its declared length against what was actually read.
pub fn decode_header(msg: &[u8]) -> Result<(MessageHeader, &[u8])> {
    if msg.len() < HEADER_LEN {
        return Err(EdenError::Io("short read: message smaller than header".into()));
    }
    let mut c = Cursor::new(msg);
    let length = c.u32()?;
    let opcode = c.u32()?;
    let unique = c.u64()?;
    let node_id = c.u64()?;
    let uid = c.u32()?;
    let gid = c.u32()?;
    let pid = c.u32()?;
    if length as usize != msg.len() {
        return Err(EdenError::Io(format!(
            "declared length {length} does not match received {}",
            msg.len()
        )));
    }
    Ok((
        MessageHeader {
            length,
            opcode,
            unique,
            node_id,
            uid,
            gid,
            pid,
        },
        &msg[HEADER_LEN..],
    ))
}

fn encode_message(header_template: &MessageHeader, opcode: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    write_u32(&mut out, (HEADER_LEN + body.len()) as u32);
    write_u32(&mut out, opcode);
    write_u64(&mut out, header_template.unique);
    write_u64(&mut out, header_template.node_id);
    write_u32(&mut out, header_template.uid);
    write_u32(&mut out, header_template.gid);
    write_u32(&mut out, header_template.pid);
    out.extend_from_slice(body);
    out
}

/// Reply opcode used for every successful and erroring reply; the
/// kernel tells the two apart by body shape (an error reply's body is
/// just the four-byte errno).
const OPCODE_REPLY: u32 = u32::MAX;

fn encode_error_reply(header: &MessageHeader, errno: i32) -> Vec<u8> {
    let mut body = Vec::new();
    write_u32(&mut body, errno as u32);
    encode_message(header, OPCODE_REPLY, &body)
}

fn encode_ok_reply(header: &MessageHeader, body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    write_u32(&mut out, 0);
    out.extend_from_slice(&body);
    encode_message(header, OPCODE_REPLY, &out)
}

fn write_timespec(buf: &mut Vec<u8>, ts: (i64, u32)) {
    buf.extend_from_slice(&ts.0.to_be_bytes());
    write_u32(buf, ts.1);
}

fn encode_attr(attr: &Attr) -> Vec<u8> {
    let mut b = Vec::new();
    write_u64(&mut b, attr.ino);
    write_u32(&mut b, attr.mode);
    write_u64(&mut b, attr.size);
    write_u32(&mut b, attr.nlink);
    write_u32(&mut b, attr.uid);
    write_u32(&mut b, attr.gid);
    write_u32(&mut b, attr.rdev);
    write_u32(&mut b, attr.blksize);
    write_timespec(&mut b, attr.atime);
    write_timespec(&mut b, attr.mtime);
    write_timespec(&mut b, attr.ctime);
    write_u64(&mut b, attr.blocks);
    b
}

fn encode_entry_reply(entry: &EntryReply) -> Vec<u8> {
    let mut b = Vec::new();
    write_u64(&mut b, entry.attribute_ttl.as_millis() as u64);
    write_u64(&mut b, entry.entry_ttl.as_millis() as u64);
    b.extend(encode_attr(&entry.attr));
    b
}

/// Every opcode the kernel can send that this crate actually services.
/// Any opcode not in this table replies `ENOSYS`, per this module's
/// framing responsibility.
fn decode_opcode(code: u32) -> Option<Opcode> {
    use Opcode::*;
    Some(match code {
        10 => Lookup,
        11 => Forget,
        12 => Getattr,
        13 => Setattr,
        14 => Readlink,
        15 => Mknod,
        16 => Mkdir,
        17 => Unlink,
        18 => Rmdir,
        19 => Symlink,
        20 => Rename,
        21 => Link,
        22 => Open,
        23 => Read,
        24 => Write,
        25 => Flush,
        26 => Release,
        27 => Fsync,
        28 => Opendir,
        29 => Readdir,
        30 => Releasedir,
        31 => Fsyncdir,
        32 => Statfs,
        33 => Setxattr,
        34 => Getxattr,
        35 => Listxattr,
        36 => Removexattr,
        37 => Access,
        38 => Create,
        39 => Bmap,
        _ => return None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitRequest {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitParams {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
}

fn decode_init_request(body: &[u8]) -> Result<InitRequest> {
    let mut c = Cursor::new(body);
    Ok(InitRequest {
        major: c.u32()?,
        minor: c.u32()?,
        max_readahead: c.u32()?,
        flags: c.u32()?,
    })
}

fn encode_init_params(params: &InitParams) -> Vec<u8> {
    let mut b = Vec::new();
    write_u32(&mut b, params.major);
    write_u32(&mut b, params.minor);
    write_u32(&mut b, params.max_readahead);
    write_u32(&mut b, params.flags);
    b
}

/// Picks the major we speak (must match the kernel's exactly), the
/// lesser of the two minors, and the flag intersection.
fn negotiate_init(kernel: &InitRequest) -> Result<InitParams> {
    if kernel.major != PROTOCOL_MAJOR {
        return Err(EdenError::InitProtocolViolation(format!(
            "unsupported protocol major {} (we speak {PROTOCOL_MAJOR})",
            kernel.major
        )));
    }
    Ok(InitParams {
        major: PROTOCOL_MAJOR,
        minor: kernel.minor.min(PROTOCOL_MINOR),
        max_readahead: kernel.max_readahead,
        flags: kernel.flags & SUPPORTED_CAPABILITIES,
    })
}

/// Why a session loop stopped: distinguishes a kernel-initiated unmount
/// from an explicit graceful restart from ordinary object teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The kernel device was closed (ordinary unmount).
    Unmounted,
    /// An explicit graceful-restart request surrendered the device.
    Takeover,
    /// The `Channel` was dropped by its owner.
    Destructor,
}

/// The transport a [`Channel`] frames its wire protocol over. A real
/// mount backs this with the actual kernel device fd; tests use
/// [`MemoryTransport`].
pub trait KernelTransport: Send + Sync {
    /// Reads one complete framed message. `Ok(None)` means the kernel
    /// closed the device; that's an ordinary (`Unmounted`) session end,
    /// not an error.
    fn receive(&self) -> Result<Option<Vec<u8>>>;

    fn send(&self, message: &[u8]) -> Result<()>;

    /// Tells the kernel to drop any cached pages/attributes for `ino`.
    /// `len == 0` means "to end of file".
    fn invalidate_inode(&self, ino: InodeNumber, offset: i64, len: i64) -> Result<()>;

    /// Tells the kernel to drop a cached directory entry.
    fn invalidate_entry(&self, parent: InodeNumber, name: &PathComponent) -> Result<()>;
}

/// An in-memory [`KernelTransport`] for tests: an inbound queue the test
/// feeds, an outbound log the test inspects, and recorded invalidation
/// calls.
#[derive(Default)]
pub struct MemoryTransport {
    inbound: Mutex<std::collections::VecDeque<Vec<u8>>>,
    outbound: Mutex<Vec<Vec<u8>>>,
    invalidated_inodes: Mutex<Vec<(InodeNumber, i64, i64)>>,
    invalidated_entries: Mutex<Vec<(InodeNumber, PathComponent)>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_inbound(&self, message: Vec<u8>) {
        self.inbound.lock().push_back(message);
    }

    pub fn outbound_messages(&self) -> Vec<Vec<u8>> {
        self.outbound.lock().clone()
    }

    pub fn invalidated_inodes(&self) -> Vec<(InodeNumber, i64, i64)> {
        self.invalidated_inodes.lock().clone()
    }
}

impl KernelTransport for MemoryTransport {
    fn receive(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.inbound.lock().pop_front())
    }

    fn send(&self, message: &[u8]) -> Result<()> {
        self.outbound.lock().push(message.to_vec());
        Ok(())
    }

    fn invalidate_inode(&self, ino: InodeNumber, offset: i64, len: i64) -> Result<()> {
        self.invalidated_inodes.lock().push((ino, offset, len));
        Ok(())
    }

    fn invalidate_entry(&self, parent: InodeNumber, name: &PathComponent) -> Result<()> {
        self.invalidated_entries.lock().push((parent, name.clone()));
        Ok(())
    }
}

/// Tracks outstanding requests so a shutdown can wait for them instead
/// of cancelling in-flight work, and holds the interrupt flag for each
/// one so a kernel `INTERRUPT` message can find it by unique id.
#[derive(Default)]
struct OutstandingRequests {
    count: Mutex<u64>,
    drained: Condvar,
    by_unique: RwLock<HashMap<u64, Arc<RequestContext>>>,
}

impl OutstandingRequests {
    fn begin(&self, ctx: Arc<RequestContext>, unique: u64) {
        *self.count.lock() += 1;
        self.by_unique.write().insert(unique, ctx);
    }

    fn end(&self, unique: u64) {
        self.by_unique.write().remove(&unique);
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn interrupt(&self, unique: u64) {
        if let Some(ctx) = self.by_unique.read().get(&unique) {
            ctx.interrupt();
        }
    }

    fn wait_for_drain(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.drained.wait(&mut count);
        }
    }
}

/// Owns one mount's kernel device framing and session loop. Holds no
/// inode state of its own: every request is handed to a [`Dispatcher`]
/// after being decoded off the wire.
pub struct Channel<T: KernelTransport> {
    transport: Arc<T>,
    outstanding: Arc<OutstandingRequests>,
    exit_requested: AtomicBool,
    next_unique: AtomicU64,
}

impl<T: KernelTransport + 'static> Channel<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            outstanding: Arc::new(OutstandingRequests::default()),
            exit_requested: AtomicBool::new(false),
            next_unique: AtomicU64::new(1),
        }
    }

    /// Performs the INIT handshake. Must be the first message observed
    /// on a fresh mount; any other opcode, or a closed device, fails the
    /// mount outright rather than being routed through the dispatcher.
    #[instrument(skip(self))]
    pub fn perform_handshake(&self) -> Result<InitParams> {
        let msg = self
            .transport
            .receive()?
            .ok_or(EdenError::UnmountedDuringInit)?;
        let (header, body) = decode_header(&msg)?;
        if header.opcode != OPCODE_INIT {
            return Err(EdenError::InitProtocolViolation(format!(
                "first message must be INIT, got opcode {}",
                header.opcode
            )));
        }
        let kernel_init = decode_init_request(body)?;
        let negotiated = negotiate_init(&kernel_init)?;
        let reply = encode_message(&header, OPCODE_REPLY, &encode_init_params(&negotiated));
        self.transport.send(&reply)?;
        Ok(negotiated)
    }

    /// Requests that [`Self::run_session`] return after the current
    /// message finishes, without waiting for the kernel to close the
    /// device. Used for both graceful restart and plain shutdown; the
    /// caller distinguishes them via the `reason` it passes to
    /// [`Self::run_session`]'s caller, not via this method.
    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
    }

    /// Repeatedly reads one framed message, dispatches it, and writes
    /// the reply, until the kernel closes the device, [`Self::request_exit`]
    /// is called, or an unrecoverable transport error is observed.
    #[instrument(skip(self, dispatcher))]
    pub fn run_session(&self, dispatcher: &Dispatcher) -> Result<StopReason> {
        loop {
            if self.exit_requested.load(Ordering::SeqCst) {
                return Ok(StopReason::Takeover);
            }
            let Some(msg) = self.transport.receive()? else {
                return Ok(StopReason::Unmounted);
            };
            let (header, body) = decode_header(&msg)?;

            if header.opcode == OPCODE_INTERRUPT {
                if body.len() >= 8 {
                    let target = u64::from_be_bytes(body[0..8].try_into().unwrap());
                    self.outstanding.interrupt(target);
                }
                continue;
            }

            self.handle_one(dispatcher, header, body);
        }
    }

    fn handle_one(&self, dispatcher: &Dispatcher, header: MessageHeader, body: &[u8]) {
        let Some(opcode) = decode_opcode(header.opcode) else {
            warn!(opcode = header.opcode, "unrecognized opcode, replying ENOSYS");
            let _ = self
                .transport
                .send(&encode_error_reply(&header, libc::ENOSYS));
            return;
        };

        let ctx = Arc::new(RequestContext::new(opcode, header.unique));
        self.outstanding.begin(ctx.clone(), header.unique);

        // forget has no reply at all: the kernel never expects one.
        if opcode == Opcode::Forget {
            let mut c = Cursor::new(body);
            if let (Ok(ino), Ok(count)) = (Ok::<u64, EdenError>(header.node_id), c.u64()) {
                dispatcher.forget(&ctx, ino, count);
            }
            self.outstanding.end(header.unique);
            return;
        }

        let result = self.invoke(dispatcher, &ctx, opcode, &header, body);
        let reply = match result {
            Ok(body) => encode_ok_reply(&header, body),
            Err(e) => encode_error_reply(&header, e.to_errno()),
        };
        if let Err(e) = self.transport.send(&reply) {
            error!(error = %e, "failed writing reply, tearing down session");
        }
        self.outstanding.end(header.unique);
    }

    fn invoke(
        &self,
        d: &Dispatcher,
        ctx: &RequestContext,
        opcode: Opcode,
        header: &MessageHeader,
        body: &[u8],
    ) -> Result<Vec<u8>> {
        let mut c = Cursor::new(body);
        match opcode {
            Opcode::Lookup => {
                let name = c.name()?;
                let entry = d.lookup(ctx, header.node_id, &name)?;
                Ok(encode_entry_reply(&entry))
            }
            Opcode::Getattr => {
                let (attr, ttl) = d.getattr(ctx, header.node_id)?;
                let mut b = Vec::new();
                write_u64(&mut b, ttl.as_millis() as u64);
                b.extend(encode_attr(&attr));
                Ok(b)
            }
            Opcode::Setattr => {
                let mask = decode_setattr_mask(&mut c)?;
                let (attr, ttl) = d.setattr(ctx, header.node_id, mask)?;
                let mut b = Vec::new();
                write_u64(&mut b, ttl.as_millis() as u64);
                b.extend(encode_attr(&attr));
                Ok(b)
            }
            Opcode::Readlink => {
                let target = d.readlink(ctx, header.node_id)?;
                let mut b = Vec::new();
                write_bytes(&mut b, &target);
                Ok(b)
            }
            Opcode::Mknod => {
                let name = c.name()?;
                let mode = c.u32()?;
                let rdev = c.u32()?;
                let entry = d.mknod(ctx, header.node_id, &name, mode, rdev)?;
                Ok(encode_entry_reply(&entry))
            }
            Opcode::Mkdir => {
                let name = c.name()?;
                let entry = d.mkdir(ctx, header.node_id, &name)?;
                Ok(encode_entry_reply(&entry))
            }
            Opcode::Unlink => {
                let name = c.name()?;
                d.unlink(ctx, header.node_id, &name)?;
                Ok(Vec::new())
            }
            Opcode::Rmdir => {
                let name = c.name()?;
                d.rmdir(ctx, header.node_id, &name)?;
                Ok(Vec::new())
            }
            Opcode::Symlink => {
                let name = c.name()?;
                let target = c.bytes()?;
                let entry = d.symlink(ctx, header.node_id, &name, &target)?;
                Ok(encode_entry_reply(&entry))
            }
            Opcode::Rename => {
                let old_name = c.name()?;
                let new_parent = c.u64()?;
                let new_name = c.name()?;
                d.rename(ctx, header.node_id, &old_name, new_parent, &new_name)?;
                Ok(Vec::new())
            }
            Opcode::Link => {
                let new_parent = c.u64()?;
                let new_name = c.name()?;
                let entry = d.link(ctx, header.node_id, new_parent, &new_name)?;
                Ok(encode_entry_reply(&entry))
            }
            Opcode::Open => {
                let handle = d.open(ctx, header.node_id)?;
                let mut b = Vec::new();
                write_u64(&mut b, handle);
                Ok(b)
            }
            Opcode::Read => {
                let handle = c.u64()?;
                let offset = c.u64()?;
                let size = c.u32()? as usize;
                let mut buf = vec![0u8; size];
                let n = d.read(ctx, handle, offset, &mut buf)?;
                buf.truncate(n);
                Ok(buf)
            }
            Opcode::Write => {
                let handle = c.u64()?;
                let offset = c.u64()?;
                let data = c.bytes()?;
                let n = d.write(ctx, handle, offset, &data)?;
                let mut b = Vec::new();
                write_u32(&mut b, n as u32);
                Ok(b)
            }
            Opcode::Flush => {
                let handle = c.u64()?;
                d.flush(ctx, handle)?;
                Ok(Vec::new())
            }
            Opcode::Release => {
                let handle = c.u64()?;
                d.release(ctx, handle)?;
                Ok(Vec::new())
            }
            Opcode::Fsync => {
                let handle = c.u64()?;
                let datasync = c.u32()? != 0;
                d.fsync(ctx, handle, datasync)?;
                Ok(Vec::new())
            }
            Opcode::Opendir => {
                let handle = d.opendir(ctx, header.node_id)?;
                let mut b = Vec::new();
                write_u64(&mut b, handle);
                Ok(b)
            }
            Opcode::Readdir => {
                let handle = c.u64()?;
                let entries = d.readdir(ctx, handle)?;
                Ok(encode_readdir(&entries))
            }
            Opcode::Releasedir => {
                let handle = c.u64()?;
                d.releasedir(ctx, handle)?;
                Ok(Vec::new())
            }
            Opcode::Fsyncdir => {
                let handle = c.u64()?;
                let datasync = c.u32()? != 0;
                d.fsyncdir(ctx, handle, datasync)?;
                Ok(Vec::new())
            }
            Opcode::Statfs => {
                let stats = d.statfs(ctx, header.node_id)?;
                Ok(encode_statfs(&stats))
            }
            Opcode::Setxattr => {
                let name = c.bytes()?;
                let name = std::str::from_utf8(&name)
                    .map_err(|_| EdenError::Io("non-utf8 xattr name".into()))?;
                let value = c.bytes()?;
                d.setxattr(ctx, header.node_id, name, &value)?;
                Ok(Vec::new())
            }
            Opcode::Getxattr => {
                let name = c.bytes()?;
                let name = std::str::from_utf8(&name)
                    .map_err(|_| EdenError::Io("non-utf8 xattr name".into()))?;
                let value = d.getxattr(ctx, header.node_id, name)?;
                let mut b = Vec::new();
                write_bytes(&mut b, &value);
                Ok(b)
            }
            Opcode::Listxattr => {
                let names = d.listxattr(ctx, header.node_id)?;
                let mut b = Vec::new();
                write_u32(&mut b, names.len() as u32);
                for name in names {
                    write_bytes(&mut b, name.as_bytes());
                }
                Ok(b)
            }
            Opcode::Removexattr => {
                let name = c.bytes()?;
                let name = std::str::from_utf8(&name)
                    .map_err(|_| EdenError::Io("non-utf8 xattr name".into()))?;
                d.removexattr(ctx, header.node_id, name)?;
                Ok(Vec::new())
            }
            Opcode::Access => {
                let mask = c.u32()?;
                let caller = Caller {
                    uid: header.uid,
                    gid: header.gid,
                    pid: header.pid,
                };
                d.access(ctx, header.node_id, mask, caller)?;
                Ok(Vec::new())
            }
            Opcode::Create => {
                let name = c.name()?;
                let mode = c.u32()?;
                let created = d.create(ctx, header.node_id, &name, mode)?;
                Ok(encode_create_reply(&created))
            }
            Opcode::Bmap => {
                let block = c.u64()?;
                let mapped = d.bmap(ctx, header.node_id, block)?;
                let mut b = Vec::new();
                write_u64(&mut b, mapped);
                Ok(b)
            }
            Opcode::Forget => unreachable!("forget is handled before invoke()"),
        }
    }

    /// Signals the kernel to drop its cached attributes/pages for `ino`.
    pub fn invalidate_inode(&self, ino: InodeNumber, offset: i64, len: i64) -> Result<()> {
        self.transport.invalidate_inode(ino, offset, len)
    }

    /// Signals the kernel to drop a cached directory entry.
    pub fn invalidate_entry(&self, parent: InodeNumber, name: &PathComponent) -> Result<()> {
        self.transport.invalidate_entry(parent, name)
    }

    /// Blocks until every in-flight request has been replied to.
    /// Destruction waits rather than cancels, per this module's
    /// outstanding-request contract.
    pub fn wait_for_outstanding(&self) {
        self.outstanding.wait_for_drain();
    }

    pub fn next_unique(&self) -> u64 {
        self.next_unique.fetch_add(1, Ordering::SeqCst)
    }
}

fn decode_setattr_mask(c: &mut Cursor<'_>) -> Result<SetattrMask> {
    let present = c.u32()?;
    let mut mask = SetattrMask::default();
    if present & 1 != 0 {
        mask.mode = Some(c.u32()?);
    }
    if present & (1 << 1) != 0 {
        mask.uid = Some(c.u32()?);
    }
    if present & (1 << 2) != 0 {
        mask.gid = Some(c.u32()?);
    }
    if present & (1 << 3) != 0 {
        mask.size = Some(c.u64()?);
    }
    if present & (1 << 4) != 0 {
        mask.atime = Some(decode_timespec(c)?);
    }
    if present & (1 << 5) != 0 {
        mask.mtime = Some(decode_timespec(c)?);
    }
    Ok(mask)
}

fn decode_timespec(c: &mut Cursor<'_>) -> Result<TimeSpec> {
    let tag = c.u32()?;
    if tag == 0 {
        return Ok(TimeSpec::Now);
    }
    let secs = c.i64()?;
    let nanos = c.u32()?;
    Ok(TimeSpec::Set((secs, nanos)))
}

fn encode_readdir(entries: &[(PathComponent, InodeNumber, crate::model::EntryKind)]) -> Vec<u8> {
    let mut b = Vec::new();
    write_u32(&mut b, entries.len() as u32);
    for (name, ino, kind) in entries {
        write_bytes(&mut b, name.as_bytes());
        write_u64(&mut b, *ino);
        write_u32(
            &mut b,
            match kind {
                crate::model::EntryKind::Regular => 0,
                crate::model::EntryKind::Executable => 1,
                crate::model::EntryKind::Symlink => 2,
                crate::model::EntryKind::Directory => 3,
            },
        );
    }
    b
}

fn encode_statfs(stats: &StatFs) -> Vec<u8> {
    let mut b = Vec::new();
    write_u64(&mut b, stats.blocks);
    write_u64(&mut b, stats.bfree);
    write_u64(&mut b, stats.bavail);
    write_u64(&mut b, stats.files);
    write_u64(&mut b, stats.ffree);
    write_u32(&mut b, stats.bsize);
    write_u32(&mut b, stats.namelen);
    write_u32(&mut b, stats.frsize);
    b
}

fn encode_create_reply(created: &CreateReply) -> Vec<u8> {
    let mut b = Vec::new();
    write_u64(&mut b, created.handle);
    b.extend(encode_entry_reply(&created.entry));
    b
}

/// Builds the accept loop for a mount: one [`Channel`] paired with one
/// [`Dispatcher`], run across a fixed-size `threadpool`, the same shape
/// as `castore::fs::fuse::mod.rs`'s `FuseDaemon` build-out.
/// Default worker pool size, matching this crate's concurrency model
/// of a fixed-size blocking thread pool around a dozen or so workers.
pub const DEFAULT_WORKER_THREADS: usize = 16;

pub struct SessionRunner<T: KernelTransport + 'static> {
    channel: Arc<Channel<T>>,
    pool: ThreadPool,
}

impl<T: KernelTransport + 'static> SessionRunner<T> {
    pub fn new(channel: Arc<Channel<T>>, num_threads: usize) -> Self {
        let pool = threadpool::Builder::new()
            .num_threads(num_threads.max(1))
            .thread_name("eden-channel".to_string())
            .build();
        Self { channel, pool }
    }

    /// Builds a runner with [`DEFAULT_WORKER_THREADS`] workers.
    pub fn with_default_pool_size(channel: Arc<Channel<T>>) -> Self {
        Self::new(channel, DEFAULT_WORKER_THREADS)
    }

    /// Spawns `num_threads` workers, each pulling messages off the same
    /// [`Channel`] and dispatching them concurrently, the way
    /// `castore::fs::fuse::mod.rs`'s `FuseDaemon` starts one
    /// `FuseServer` per pool thread. Blocks until every worker's
    /// `run_session` returns, then reports whichever `StopReason` was
    /// observed first.
    pub fn run(&self, dispatcher: Arc<Dispatcher>) -> Result<StopReason> {
        let first_reason: Arc<Mutex<Option<Result<StopReason>>>> = Arc::new(Mutex::new(None));
        for _ in 0..self.pool.max_count() {
            let channel = self.channel.clone();
            let dispatcher = dispatcher.clone();
            let first_reason = first_reason.clone();
            self.pool.execute(move || {
                let result = channel.run_session(&dispatcher);
                channel.request_exit();
                let mut slot = first_reason.lock();
                if slot.is_none() {
                    *slot = Some(result);
                }
            });
        }
        self.pool.join();
        first_reason
            .lock()
            .take()
            .unwrap_or(Ok(StopReason::Destructor))
    }

    pub fn request_exit(&self) {
        self.channel.request_exit();
    }

    pub fn wait_for_outstanding(&self) {
        self.channel.wait_for_outstanding();
    }

    pub fn join_workers(&self) {
        self.pool.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::InodeGraph;
    use crate::handles::FileHandleMap;
    use crate::hash::Hash;
    use crate::model::{Blob, Tree, TreeEntry};
    use crate::namemgr::ROOT_NODE_ID;
    use crate::objectstore::MemoryObjectStore;
    use crate::overlay::{FsOverlay, Overlay};

    fn comp(s: &str) -> PathComponent {
        PathComponent::try_from(s).unwrap()
    }

    fn fresh_dispatcher() -> (Dispatcher, tempfile::TempDir) {
        let store = Arc::new(MemoryObjectStore::new());
        let dir = tempfile::tempdir().unwrap();
        let overlay: Arc<dyn Overlay> = Arc::new(FsOverlay::new(dir.path()));
        overlay.init(true).unwrap();

        let file_hash = store.insert_blob(Blob::new(b"hello".to_vec()));
        let entry = TreeEntry::new(comp("hello.txt"), file_hash, crate::model::EntryKind::Regular, 0o644);
        let tree = Tree::new(vec![entry]).unwrap();
        let root_hash = store.insert_tree(tree);

        let graph = Arc::new(InodeGraph::new(store, overlay.clone(), root_hash).unwrap());
        let handles = Arc::new(FileHandleMap::new());
        (Dispatcher::new(graph, handles, overlay, 1000, 1000), dir)
    }

    fn init_message(unique: u64) -> Vec<u8> {
        let header = MessageHeader {
            length: 0,
            opcode: OPCODE_INIT,
            unique,
            node_id: 0,
            uid: 0,
            gid: 0,
            pid: 0,
        };
        let body = encode_init_params(&InitParams {
            major: PROTOCOL_MAJOR,
            minor: PROTOCOL_MINOR,
            max_readahead: 4096,
            flags: SUPPORTED_CAPABILITIES,
        });
        encode_message(&header, OPCODE_INIT, &body)
    }

    fn lookup_message(unique: u64, parent: InodeNumber, name: &str) -> Vec<u8> {
        let header = MessageHeader {
            length: 0,
            opcode: 10,
            unique,
            node_id: parent,
            uid: 0,
            gid: 0,
            pid: 0,
        };
        let mut body = Vec::new();
        write_bytes(&mut body, name.as_bytes());
        encode_message(&header, 10, &body)
    }

    #[test]
    fn header_roundtrip_rejects_short_read() {
        assert!(decode_header(&[0u8; 4]).is_err());
    }

    #[test]
    fn header_roundtrip_rejects_length_mismatch() {
        let mut msg = vec![0u8; HEADER_LEN];
        msg[0..4].copy_from_slice(&999u32.to_be_bytes());
        assert!(decode_header(&msg).is_err());
    }

    #[test]
    fn handshake_negotiates_minor_and_flags() {
        let transport = Arc::new(MemoryTransport::new());
        transport.push_inbound(init_message(1));
        let channel = Channel::new(transport.clone());
        let params = channel.perform_handshake().unwrap();
        assert_eq!(params.major, PROTOCOL_MAJOR);
        assert_eq!(params.minor, PROTOCOL_MINOR);
        assert_eq!(params.flags, SUPPORTED_CAPABILITIES);
        assert_eq!(transport.outbound_messages().len(), 1);
    }

    #[test]
    fn handshake_rejects_non_init_first_message() {
        let transport = Arc::new(MemoryTransport::new());
        transport.push_inbound(lookup_message(1, ROOT_NODE_ID, "hello.txt"));
        let channel = Channel::new(transport);
        assert!(matches!(
            channel.perform_handshake(),
            Err(EdenError::InitProtocolViolation(_))
        ));
    }

    #[test]
    fn handshake_on_closed_device_is_unmounted_during_init() {
        let transport = Arc::new(MemoryTransport::new());
        let channel = Channel::new(transport);
        assert_eq!(channel.perform_handshake(), Err(EdenError::UnmountedDuringInit));
    }

    #[test]
    fn run_session_services_lookup_and_then_unmounts() {
        let (dispatcher, _dir) = fresh_dispatcher();
        let transport = Arc::new(MemoryTransport::new());
        transport.push_inbound(lookup_message(7, ROOT_NODE_ID, "hello.txt"));
        let channel = Channel::new(transport.clone());

        let reason = channel.run_session(&dispatcher).unwrap();
        assert_eq!(reason, StopReason::Unmounted);

        let replies = transport.outbound_messages();
        assert_eq!(replies.len(), 1);
        let (header, body) = decode_header(&replies[0]).unwrap();
        assert_eq!(header.unique, 7);
        assert_eq!(u32::from_be_bytes(body[0..4].try_into().unwrap()), 0);
    }

    #[test]
    fn unknown_opcode_replies_enosys() {
        let (dispatcher, _dir) = fresh_dispatcher();
        let transport = Arc::new(MemoryTransport::new());
        let header = MessageHeader {
            length: 0,
            opcode: 250,
            unique: 3,
            node_id: ROOT_NODE_ID,
            uid: 0,
            gid: 0,
            pid: 0,
        };
        let msg = encode_message(&header, 250, &[]);
        transport.push_inbound(msg);
        let channel = Channel::new(transport.clone());
        channel.run_session(&dispatcher).unwrap();

        let replies = transport.outbound_messages();
        let (_h, body) = decode_header(&replies[0]).unwrap();
        let errno = u32::from_be_bytes(body[0..4].try_into().unwrap());
        assert_eq!(errno as i32, libc::ENOSYS);
    }

    #[test]
    fn forget_gets_no_reply() {
        let (dispatcher, _dir) = fresh_dispatcher();
        let ino = dispatcher
            .lookup(
                &RequestContext::new(Opcode::Lookup, 1),
                ROOT_NODE_ID,
                &comp("hello.txt"),
            )
            .unwrap()
            .attr
            .ino;

        let transport = Arc::new(MemoryTransport::new());
        let header = MessageHeader {
            length: 0,
            opcode: 11,
            unique: 9,
            node_id: ino,
            uid: 0,
            gid: 0,
            pid: 0,
        };
        let mut body = Vec::new();
        write_u64(&mut body, 1);
        let msg = encode_message(&header, 11, &body);
        transport.push_inbound(msg);

        let channel = Channel::new(transport.clone());
        channel.run_session(&dispatcher).unwrap();
        assert!(transport.outbound_messages().is_empty());
    }

    #[test]
    fn interrupt_message_sets_the_target_requests_flag() {
        let transport = Arc::new(MemoryTransport::new());
        let channel = Channel::new(transport.clone());
        let ctx = Arc::new(RequestContext::new(Opcode::Read, 42));
        channel.outstanding.begin(ctx.clone(), 42);

        let header = MessageHeader {
            length: 0,
            opcode: OPCODE_INTERRUPT,
            unique: 1,
            node_id: 0,
            uid: 0,
            gid: 0,
            pid: 0,
        };
        let mut body = Vec::new();
        write_u64(&mut body, 42);
        transport.push_inbound(encode_message(&header, OPCODE_INTERRUPT, &body));

        let (dispatcher, _dir) = fresh_dispatcher();
        let reason = channel.run_session(&dispatcher).unwrap();
        assert_eq!(reason, StopReason::Unmounted);
        assert!(ctx.is_interrupted());
    }

    #[test]
    fn wait_for_outstanding_returns_once_drained() {
        let transport = Arc::new(MemoryTransport::new());
        let channel = Channel::new(transport);
        let ctx = Arc::new(RequestContext::new(Opcode::Read, 5));
        channel.outstanding.begin(ctx, 5);
        channel.outstanding.end(5);
        channel.wait_for_outstanding();
    }

    #[test]
    fn invalidate_calls_reach_the_transport() {
        let transport = Arc::new(MemoryTransport::new());
        let channel = Channel::new(transport.clone());
        channel.invalidate_inode(ROOT_NODE_ID, 0, 0).unwrap();
        channel.invalidate_entry(ROOT_NODE_ID, &comp("x")).unwrap();
        assert_eq!(transport.invalidated_inodes(), vec![(ROOT_NODE_ID, 0, 0)]);
    }
}
