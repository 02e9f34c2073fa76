//! End-to-end scenarios exercising the public surface together: the
//! inode graph, the dispatcher wrapping it, the overlay's consistency
//! checker, the snapshot marker, and a full kernel session over a
//! `MemoryTransport`. Grounded on `castore/src/fs/tests.rs`'s role as
//! the crate's top-level behavioral test suite.

use std::sync::Arc;

use eden_core::channel::{
    decode_header, Channel, MemoryTransport, StopReason, CAP_ASYNC_READ, CAP_ATOMIC_TRUNCATE,
    CAP_BIG_WRITES, HEADER_LEN, OPCODE_INIT, PROTOCOL_MAJOR, PROTOCOL_MINOR,
};
use eden_core::graph::InodeGraph;
use eden_core::handles::FileHandleMap;
use eden_core::hash::Hash;
use eden_core::model::{Blob, EntryKind, ParentCommits, Tree, TreeEntry};
use eden_core::namemgr::ROOT_NODE_ID;
use eden_core::objectstore::MemoryObjectStore;
use eden_core::overlay::snapshot::SnapshotMarker;
use eden_core::overlay::{FsOverlay, Overlay, OverlayChecker, OverlayDir};
use eden_core::path::PathComponent;
use eden_core::request::{Opcode, RequestContext};
use eden_core::{Dispatcher, EdenError};

fn comp(s: &str) -> PathComponent {
    PathComponent::try_from(s).unwrap()
}

/// Builds a graph with a single root-level file `hello.txt` backed by
/// the object store, over a fresh `FsOverlay`.
fn fresh_dispatcher() -> (Dispatcher, Arc<MemoryObjectStore>, tempfile::TempDir) {
    let store = Arc::new(MemoryObjectStore::new());
    let dir = tempfile::tempdir().unwrap();
    let overlay: Arc<dyn Overlay> = Arc::new(FsOverlay::new(dir.path()));
    overlay.init(true).unwrap();

    let file_hash = store.insert_blob(Blob::new(b"hello".to_vec()));
    let entry = TreeEntry::new(comp("hello.txt"), file_hash, EntryKind::Regular, 0o644);
    let tree = Tree::new(vec![entry]).unwrap();
    let root_hash = store.insert_tree(tree);

    let graph = Arc::new(InodeGraph::new(store.clone(), overlay.clone(), root_hash).unwrap());
    let handles = Arc::new(FileHandleMap::new());
    (Dispatcher::new(graph, handles, overlay, 1000, 1000), store, dir)
}

#[test]
fn write_materializes_a_loaded_file_and_persists_content() {
    let (d, _store, _dir) = fresh_dispatcher();

    let rq = RequestContext::new(Opcode::Lookup, 1);
    let ino = d.lookup(&rq, ROOT_NODE_ID, &comp("hello.txt")).unwrap().attr.ino;

    let rq = RequestContext::new(Opcode::Open, 2);
    let handle = d.open(&rq, ino).unwrap();

    let rq = RequestContext::new(Opcode::Write, 3);
    let written = d.write(&rq, handle, 0, b"goodbye").unwrap();
    assert_eq!(written, 7);

    let mut buf = [0u8; 7];
    let rq = RequestContext::new(Opcode::Read, 4);
    let n = d.read(&rq, handle, 0, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"goodbye");

    let rq = RequestContext::new(Opcode::Getattr, 5);
    let (attr, _ttl) = d.getattr(&rq, ino).unwrap();
    assert_eq!(attr.size, 7);
}

#[test]
fn rename_moves_entry_between_directories() {
    let (d, _store, _dir) = fresh_dispatcher();

    let rq = RequestContext::new(Opcode::Mkdir, 1);
    let sub = d.mkdir(&rq, ROOT_NODE_ID, &comp("sub")).unwrap().attr.ino;

    let rq = RequestContext::new(Opcode::Rename, 2);
    d.rename(&rq, ROOT_NODE_ID, &comp("hello.txt"), sub, &comp("moved.txt"))
        .unwrap();

    let rq = RequestContext::new(Opcode::Lookup, 3);
    assert_eq!(
        d.lookup(&rq, ROOT_NODE_ID, &comp("hello.txt")),
        Err(EdenError::NoEntry)
    );

    let rq = RequestContext::new(Opcode::Lookup, 4);
    let moved = d.lookup(&rq, sub, &comp("moved.txt")).unwrap();
    assert_eq!(moved.attr.size, 5);
}

#[test]
fn forget_evicts_an_unlinked_inode_from_the_name_index() {
    let (d, _store, _dir) = fresh_dispatcher();

    let rq = RequestContext::new(Opcode::Lookup, 1);
    let ino = d.lookup(&rq, ROOT_NODE_ID, &comp("hello.txt")).unwrap().attr.ino;

    let rq = RequestContext::new(Opcode::Unlink, 2);
    d.unlink(&rq, ROOT_NODE_ID, &comp("hello.txt")).unwrap();

    // The graph itself (reached only through the dispatcher's methods
    // here) still holds the inode alive until forget drops the last
    // kernel lookup reference.
    let rq = RequestContext::new(Opcode::Forget, 3);
    d.forget(&rq, ino, 1);

    let rq = RequestContext::new(Opcode::Getattr, 4);
    assert_eq!(d.getattr(&rq, ino), Err(EdenError::NoEntry));
}

#[test]
fn forget_without_unlink_reuses_the_same_inode_number_on_relookup() {
    let (d, _store, _dir) = fresh_dispatcher();

    let rq = RequestContext::new(Opcode::Lookup, 1);
    let ino = d.lookup(&rq, ROOT_NODE_ID, &comp("hello.txt")).unwrap().attr.ino;
    let rq = RequestContext::new(Opcode::Lookup, 2);
    let ino_again = d.lookup(&rq, ROOT_NODE_ID, &comp("hello.txt")).unwrap().attr.ino;
    assert_eq!(ino, ino_again);

    let rq = RequestContext::new(Opcode::Forget, 3);
    d.forget(&rq, ino, 2);

    // The inode was never unlinked, so a fresh lookup resolves the same
    // name back to the same number even though the live inode entry
    // itself was evicted in between.
    let rq = RequestContext::new(Opcode::Lookup, 4);
    let relooked_up = d.lookup(&rq, ROOT_NODE_ID, &comp("hello.txt")).unwrap().attr.ino;
    assert_eq!(relooked_up, ino);
}

#[test]
fn fsck_finds_no_errors_on_a_freshly_initialized_overlay() {
    let dir = tempfile::tempdir().unwrap();
    let overlay = FsOverlay::new(dir.path());
    overlay.init(true).unwrap();
    overlay.save_dir(1, OverlayDir::new()).unwrap();

    let mut checker = OverlayChecker::new(&overlay);
    checker.scan_for_errors(Some(2)).unwrap();
    assert!(checker.errors().is_empty());
}

#[test]
fn fsck_flags_an_orphan_inode_with_no_reachable_parent() {
    let dir = tempfile::tempdir().unwrap();
    let overlay = FsOverlay::new(dir.path());
    overlay.init(true).unwrap();
    overlay.save_dir(1, OverlayDir::new()).unwrap();
    // A directory row exists for inode 99 but nothing in the reachable
    // tree references it.
    overlay.save_dir(99, OverlayDir::new()).unwrap();

    let mut checker = OverlayChecker::new(&overlay);
    checker.scan_for_errors(Some(100)).unwrap();
    assert!(!checker.errors().is_empty());
}

#[test]
fn snapshot_marker_roundtrips_through_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("SNAPSHOT");
    let parents = ParentCommits::single(Hash::of(b"commit-a"));

    SnapshotMarker::write(&path, &parents).unwrap();
    let read_back = SnapshotMarker::read(&path).unwrap();

    assert_eq!(read_back.parent1(), parents.parent1());
    assert_eq!(read_back.parent2(), None);
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}
fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn init_message(unique: u64) -> Vec<u8> {
    let mut body = Vec::new();
    write_u32(&mut body, PROTOCOL_MAJOR);
    write_u32(&mut body, PROTOCOL_MINOR);
    write_u32(&mut body, 4096);
    write_u32(&mut body, CAP_ATOMIC_TRUNCATE | CAP_ASYNC_READ | CAP_BIG_WRITES);

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    write_u32(&mut out, (HEADER_LEN + body.len()) as u32);
    write_u32(&mut out, OPCODE_INIT);
    write_u64(&mut out, unique);
    write_u64(&mut out, 0);
    write_u32(&mut out, 0);
    write_u32(&mut out, 0);
    write_u32(&mut out, 0);
    out.extend_from_slice(&body);
    out
}

fn lookup_message(unique: u64, parent: u64, name: &str) -> Vec<u8> {
    let mut body = Vec::new();
    write_u32(&mut body, name.len() as u32);
    body.extend_from_slice(name.as_bytes());

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    write_u32(&mut out, (HEADER_LEN + body.len()) as u32);
    write_u32(&mut out, 10); // lookup opcode
    write_u64(&mut out, unique);
    write_u64(&mut out, parent);
    write_u32(&mut out, 0);
    write_u32(&mut out, 0);
    write_u32(&mut out, 0);
    out.extend_from_slice(&body);
    out
}

#[test]
fn full_session_negotiates_init_then_services_a_lookup() {
    let (dispatcher, _store, _dir) = fresh_dispatcher();

    let transport = Arc::new(MemoryTransport::new());
    transport.push_inbound(init_message(1));
    let channel = Channel::new(transport.clone());

    let params = channel.perform_handshake().unwrap();
    assert_eq!(params.major, PROTOCOL_MAJOR);
    assert_eq!(params.minor, PROTOCOL_MINOR);

    transport.push_inbound(lookup_message(2, ROOT_NODE_ID, "hello.txt"));
    let reason = channel.run_session(&dispatcher).unwrap();
    assert_eq!(reason, StopReason::Unmounted);

    let replies = transport.outbound_messages();
    // One reply for the INIT handshake, one for the lookup.
    assert_eq!(replies.len(), 2);
    let (header, body) = decode_header(&replies[1]).unwrap();
    assert_eq!(header.unique, 2);
    assert_eq!(u32::from_be_bytes(body[0..4].try_into().unwrap()), 0);

    channel.wait_for_outstanding();
}
