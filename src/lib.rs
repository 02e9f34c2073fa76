//! `eden-core`: a source-control-aware virtual filesystem core.
//!
//! This crate implements the pieces that sit between a kernel FUSE
//! channel and a content-addressed source repository: a wire-framed
//! request/reply channel, a live inode graph backed by a lazily
//! populated name index, a persistent overlay store for materialized
//! data, and a pluggable object store for the immutable, read-only
//! repository content the mount is checked out against.
//!
//! Mount lifecycle, the import pipeline, the management RPC surface,
//! status/diff, and graceful-restart handoff of other daemon state are
//! out of scope; see `DESIGN.md` for the full boundary.

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod graph;
pub mod handles;
pub mod hash;
pub mod inodes;
pub mod logging;
pub mod model;
pub mod namemgr;
pub mod objectstore;
pub mod overlay;
pub mod path;
pub mod request;

pub use dispatcher::Dispatcher;
pub use error::{EdenError, Result};
pub use graph::InodeGraph;
pub use handles::FileHandleMap;
pub use hash::Hash;
pub use namemgr::NameManager;
pub use objectstore::ObjectStore;
pub use overlay::Overlay;
