//! Immutable, content-addressed Tree entries. Modeled on
//! `castore::nodes::directory::Directory`, generalized with file-type
//! and executable-bit attributes and dropping the content-dedup
//! allocation scheme that module also does (out of scope here: the
//! grounding is the sorted-unique-entries invariant and digest
//! derivation, not castore's inode interning).

use crate::hash::Hash;
use crate::path::PathComponent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Executable,
    Symlink,
    Directory,
}

/// One entry inside a [`Tree`]. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: PathComponent,
    pub target_hash: Hash,
    pub kind: EntryKind,
    pub owner_perm_bits: u8,
}

impl TreeEntry {
    pub fn new(name: PathComponent, target_hash: Hash, kind: EntryKind, owner_perm_bits: u8) -> Self {
        Self {
            name,
            target_hash,
            kind,
            owner_perm_bits,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("duplicate entry name: {0:?}")]
    DuplicateName(Vec<u8>),
    #[error("entries not in sorted order at {0:?}")]
    WrongSorting(Vec<u8>),
}

/// An immutable, content-addressed Tree: a sorted, name-unique sequence
/// of [`TreeEntry`] values. `self_hash` is derived from the serialized
/// form of `entries` — the same order the upstream import tool emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    self_hash: Hash,
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// Builds a Tree from an already name-sorted, name-unique entry list,
    /// deriving `self_hash` from their canonical serialization.
    pub fn new(entries: Vec<TreeEntry>) -> Result<Self, TreeError> {
        for w in entries.windows(2) {
            match w[0].name.as_bytes().cmp(w[1].name.as_bytes()) {
                std::cmp::Ordering::Less => {}
                std::cmp::Ordering::Equal => {
                    return Err(TreeError::DuplicateName(w[1].name.as_bytes().to_vec()))
                }
                std::cmp::Ordering::Greater => {
                    return Err(TreeError::WrongSorting(w[1].name.as_bytes().to_vec()))
                }
            }
        }
        let self_hash = Hash::of(&serialize_entries(&entries));
        Ok(Self { self_hash, entries })
    }

    pub fn self_hash(&self) -> Hash {
        self.self_hash
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn get(&self, name: &[u8]) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_bytes().cmp(name))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    /// Serializes this tree's entries, the inverse of parsing with
    /// [`Tree::new`] from the same bytes: `parse(serialize(t)) == t`.
    pub fn serialize(&self) -> Vec<u8> {
        serialize_entries(&self.entries)
    }

    /// Parses a tree from its canonical serialized form, as produced by
    /// [`Tree::serialize`].
    pub fn parse(bytes: &[u8]) -> Result<Self, TreeError> {
        let mut entries = Vec::new();
        let mut rest = bytes;
        while !rest.is_empty() {
            let (entry, tail) = parse_entry(rest);
            entries.push(entry);
            rest = tail;
        }
        Tree::new(entries)
    }
}

fn kind_tag(kind: EntryKind) -> u8 {
    match kind {
        EntryKind::Regular => 0,
        EntryKind::Executable => 1,
        EntryKind::Symlink => 2,
        EntryKind::Directory => 3,
    }
}

fn tag_kind(tag: u8) -> EntryKind {
    match tag {
        0 => EntryKind::Regular,
        1 => EntryKind::Executable,
        2 => EntryKind::Symlink,
        _ => EntryKind::Directory,
    }
}

fn serialize_entries(entries: &[TreeEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for e in entries {
        let name = e.name.as_bytes();
        out.extend_from_slice(&(name.len() as u32).to_be_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(e.target_hash.as_bytes());
        out.push(kind_tag(e.kind));
        out.push(e.owner_perm_bits);
    }
    out
}

fn parse_entry(bytes: &[u8]) -> (TreeEntry, &[u8]) {
    let name_len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let mut pos = 4;
    let name_bytes = &bytes[pos..pos + name_len];
    pos += name_len;
    let hash = Hash::from_bytes(&bytes[pos..pos + crate::hash::HASH_LEN]).unwrap();
    pos += crate::hash::HASH_LEN;
    let kind = tag_kind(bytes[pos]);
    pos += 1;
    let owner_perm_bits = bytes[pos];
    pos += 1;
    let name = PathComponent::try_from(bytes::Bytes::copy_from_slice(name_bytes)).unwrap();
    (
        TreeEntry::new(name, hash, kind, owner_perm_bits),
        &bytes[pos..],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> TreeEntry {
        TreeEntry::new(
            PathComponent::try_from(name).unwrap(),
            Hash::of(name.as_bytes()),
            EntryKind::Regular,
            0o644,
        )
    }

    #[test]
    fn sorted_unique_entries_build() {
        let t = Tree::new(vec![entry("a"), entry("b"), entry("c")]).unwrap();
        assert_eq!(t.entries().len(), 3);
    }

    #[test]
    fn rejects_duplicate_name() {
        assert_eq!(
            Tree::new(vec![entry("a"), entry("a")]),
            Err(TreeError::DuplicateName(b"a".to_vec()))
        );
    }

    #[test]
    fn rejects_unsorted() {
        assert_eq!(
            Tree::new(vec![entry("b"), entry("a")]),
            Err(TreeError::WrongSorting(b"a".to_vec()))
        );
    }

    #[test]
    fn serialize_roundtrip() {
        let t = Tree::new(vec![entry("a"), entry("b")]).unwrap();
        let bytes = t.serialize();
        let parsed = Tree::parse(&bytes).unwrap();
        assert_eq!(t, parsed);
    }

    #[test]
    fn digest_is_stable_for_same_entries() {
        let t1 = Tree::new(vec![entry("a"), entry("b")]).unwrap();
        let t2 = Tree::new(vec![entry("a"), entry("b")]).unwrap();
        assert_eq!(t1.self_hash(), t2.self_hash());
    }

    #[test]
    fn get_finds_entry_by_name() {
        let t = Tree::new(vec![entry("a"), entry("m"), entry("z")]).unwrap();
        assert!(t.get(b"m").is_some());
        assert!(t.get(b"missing").is_none());
    }
}
