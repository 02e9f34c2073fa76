//! The content-addressed object model: immutable Trees and Blobs, plus
//! the parent-commit record used by the snapshot marker.

mod blob;
mod parent_commits;
mod tree;

pub use blob::Blob;
pub use parent_commits::ParentCommits;
pub use tree::{EntryKind, Tree, TreeEntry};
