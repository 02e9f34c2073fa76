//! In-memory object store, for tests and as a reference implementation.
//! Grounded on `castore::directoryservice::memory::MemoryDirectoryService`.

use parking_lot::RwLock;
use std::collections::HashMap;

use super::ObjectStore;
use crate::error::Result;
use crate::hash::Hash;
use crate::model::{Blob, Tree};

#[derive(Default)]
pub struct MemoryObjectStore {
    trees: RwLock<HashMap<Hash, Tree>>,
    blobs: RwLock<HashMap<Hash, Blob>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_tree(&self, tree: Tree) -> Hash {
        let hash = tree.self_hash();
        self.trees.write().insert(hash, tree);
        hash
    }

    pub fn insert_blob(&self, blob: Blob) -> Hash {
        let hash = blob.self_hash();
        self.blobs.write().insert(hash, blob);
        hash
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get_tree(&self, hash: &Hash) -> Result<Option<Tree>> {
        Ok(self.trees.read().get(hash).cloned())
    }

    fn get_blob(&self, hash: &Hash) -> Result<Option<Blob>> {
        Ok(self.blobs.read().get(hash).cloned())
    }

    fn get_sha1_for_blob(&self, hash: &Hash) -> Result<Option<Hash>> {
        Ok(self.blobs.read().get(hash).map(|b| b.self_hash()))
    }

    fn put_tree(&self, hash: Hash, bytes: Vec<u8>) -> Result<()> {
        let tree = Tree::parse(&bytes).map_err(|e| {
            crate::error::EdenError::BackendUnavailable(format!("invalid tree bytes: {e}"))
        })?;
        self.trees.write().insert(hash, tree);
        Ok(())
    }

    fn put_blob(&self, bytes: Vec<u8>) -> Result<Hash> {
        let blob = Blob::new(bytes);
        let hash = blob.self_hash();
        self.blobs.write().insert(hash, blob);
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryKind, TreeEntry};
    use crate::path::PathComponent;

    #[test]
    fn get_blob_roundtrip() {
        let store = MemoryObjectStore::new();
        let hash = store.put_blob(b"hello".to_vec()).unwrap();
        let blob = store.get_blob(&hash).unwrap().unwrap();
        assert_eq!(blob.bytes(), b"hello");
        assert_eq!(store.get_sha1_for_blob(&hash).unwrap(), Some(hash));
    }

    #[test]
    fn missing_hash_returns_none() {
        let store = MemoryObjectStore::new();
        assert!(store.get_blob(&Hash::of(b"nope")).unwrap().is_none());
    }

    #[test]
    fn tree_roundtrip() {
        let store = MemoryObjectStore::new();
        let entry = TreeEntry::new(
            PathComponent::try_from("a").unwrap(),
            Hash::of(b"a"),
            EntryKind::Regular,
            0o644,
        );
        let tree = Tree::new(vec![entry]).unwrap();
        let hash = store.insert_tree(tree.clone());
        assert_eq!(store.get_tree(&hash).unwrap(), Some(tree));
    }
}
