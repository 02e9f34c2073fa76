//! Consistency checker ("fsck") for the overlay, run after an unclean
//! shutdown. Grounded on
//! `original_source/eden/fs/inodes/fscatalog/OverlayChecker.h`: walk the
//! directory graph from the root, flag anything that doesn't hang
//! together, and offer best-effort repair.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use super::{InodeNumber, Overlay, OverlayEntryKind};
use crate::error::Result;

pub const ROOT_INODE: InodeNumber = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsckErrorKind {
    /// A shard subdirectory could not be listed. Reserved for backends
    /// that expose raw directory enumeration; the generic checker here,
    /// driven entirely through the [`Overlay`] trait, cannot observe
    /// shard layout and never produces this variant itself.
    ShardEnumFailure(String),
    /// A file was found in a shard directory that isn't a valid overlay
    /// row. Same caveat as `ShardEnumFailure`.
    UnexpectedFile(String),
    /// A shard subdirectory's name doesn't parse as a shard id.
    UnexpectedShard(String),
    /// An inode's stored row failed to decode.
    InodeDataError(InodeNumber, String),
    /// A directory entry claims its child is materialized, but no
    /// overlay row exists for it.
    MissingMaterialized(InodeNumber),
    /// An inode has a row but isn't reachable from the root.
    OrphanInode(InodeNumber),
    /// An inode is reachable through more than one parent entry.
    HardLinkedInode(InodeNumber),
    /// The persisted next-inode-number watermark doesn't match the
    /// largest inode number actually observed.
    BadNextInode {
        found: Option<InodeNumber>,
        expected: InodeNumber,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}")]
pub struct FsckError {
    pub kind: FsckErrorKind,
}

impl FsckError {
    fn new(kind: FsckErrorKind) -> Self {
        Self { kind }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairResult {
    pub repair_dir: PathBuf,
    pub total_errors: u32,
    pub fixed_errors: u32,
}

/// Scans an [`Overlay`] for structural problems and can attempt repair.
pub struct OverlayChecker<'a> {
    overlay: &'a dyn Overlay,
    errors: Vec<FsckError>,
    max_inode_seen: InodeNumber,
}

impl<'a> OverlayChecker<'a> {
    pub fn new(overlay: &'a dyn Overlay) -> Self {
        Self {
            overlay,
            errors: Vec::new(),
            max_inode_seen: ROOT_INODE,
        }
    }

    pub fn errors(&self) -> &[FsckError] {
        &self.errors
    }

    /// The corrected next-inode-number watermark, derived from the
    /// largest inode number actually reachable in the overlay.
    pub fn next_inode_number(&self) -> InodeNumber {
        self.max_inode_seen + 1
    }

    /// Walks the directory graph from the root, recording every problem
    /// it finds. Must be called before [`Self::errors`] or
    /// [`Self::repair_errors`] return anything meaningful.
    pub fn scan_for_errors(&mut self, persisted_next_inode: Option<InodeNumber>) -> Result<()> {
        let all_ids: HashSet<InodeNumber> = self.overlay.all_ids()?.into_iter().collect();
        let mut visit_count: HashMap<InodeNumber, u32> = HashMap::new();
        self.walk(ROOT_INODE, &mut visit_count)?;

        for (&id, &count) in &visit_count {
            self.max_inode_seen = self.max_inode_seen.max(id);
            if count > 1 {
                self.errors.push(FsckError::new(FsckErrorKind::HardLinkedInode(id)));
            }
        }

        for id in all_ids {
            self.max_inode_seen = self.max_inode_seen.max(id);
            if id != ROOT_INODE && !visit_count.contains_key(&id) {
                self.errors.push(FsckError::new(FsckErrorKind::OrphanInode(id)));
            }
        }

        let expected = self.next_inode_number();
        if persisted_next_inode != Some(expected) {
            self.errors.push(FsckError::new(FsckErrorKind::BadNextInode {
                found: persisted_next_inode,
                expected,
            }));
        }

        Ok(())
    }

    fn walk(&mut self, id: InodeNumber, visit_count: &mut HashMap<InodeNumber, u32>) -> Result<()> {
        *visit_count.entry(id).or_insert(0) += 1;
        if visit_count[&id] > 1 {
            // Already walked this subtree once; don't recurse again or
            // every descendant would be double-counted as hard-linked.
            return Ok(());
        }

        let dir = match self.overlay.load_dir(id) {
            Ok(Some(dir)) => dir,
            Ok(None) => {
                self.errors.push(FsckError::new(FsckErrorKind::InodeDataError(
                    id,
                    "directory row missing for reachable inode".into(),
                )));
                return Ok(());
            }
            Err(e) => {
                self.errors
                    .push(FsckError::new(FsckErrorKind::InodeDataError(id, e.to_string())));
                return Ok(());
            }
        };

        for (_name, entry) in &dir.entries {
            if entry.materialized {
                let materialized_present = match entry.kind {
                    OverlayEntryKind::Directory => self.overlay.has_dir(entry.ino)?,
                    _ => self
                        .overlay
                        .open_overlay_file_no_verify(entry.ino)?
                        .is_some(),
                };
                if !materialized_present {
                    self.errors
                        .push(FsckError::new(FsckErrorKind::MissingMaterialized(entry.ino)));
                }
            }
            if entry.kind == OverlayEntryKind::Directory {
                self.walk(entry.ino, visit_count)?;
            }
        }
        Ok(())
    }

    /// Attempts to fix whatever `scan_for_errors` found. Returns `None`
    /// if there was nothing to do.
    pub fn repair_errors(&mut self, repair_dir: PathBuf) -> Result<Option<RepairResult>> {
        if self.errors.is_empty() {
            return Ok(None);
        }
        let total_errors = self.errors.len() as u32;
        let mut fixed_errors = 0u32;

        for error in &self.errors {
            match &error.kind {
                FsckErrorKind::OrphanInode(id) => {
                    self.overlay.lost_and_found_dir(*id)?;
                    fixed_errors += 1;
                }
                FsckErrorKind::BadNextInode { expected, .. } => {
                    self.overlay.close(*expected)?;
                    fixed_errors += 1;
                }
                FsckErrorKind::MissingMaterialized(_)
                | FsckErrorKind::HardLinkedInode(_)
                | FsckErrorKind::InodeDataError(_, _)
                | FsckErrorKind::ShardEnumFailure(_)
                | FsckErrorKind::UnexpectedFile(_)
                | FsckErrorKind::UnexpectedShard(_) => {
                    // These require human judgment (which copy to keep,
                    // which parent wins) and are left unfixed, reported
                    // instead so the mount owner can decide.
                }
            }
        }

        Ok(Some(RepairResult {
            repair_dir,
            total_errors,
            fixed_errors,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::{FsOverlay, OverlayEntry};
    use crate::path::PathComponent;

    fn comp(s: &str) -> PathComponent {
        PathComponent::try_from(s).unwrap()
    }

    #[test]
    fn clean_overlay_has_no_errors() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = FsOverlay::new(dir.path());
        overlay.init(true).unwrap();
        overlay.save_dir(ROOT_INODE, super::super::OverlayDir::new()).unwrap();

        let mut checker = OverlayChecker::new(&overlay);
        checker.scan_for_errors(Some(ROOT_INODE + 1)).unwrap();
        assert!(checker.errors().is_empty());
    }

    #[test]
    fn missing_materialized_child_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = FsOverlay::new(dir.path());
        overlay.init(true).unwrap();

        let mut root = super::super::OverlayDir::new();
        root.insert(
            comp("ghost.txt"),
            OverlayEntry {
                ino: 2,
                kind: OverlayEntryKind::Regular,
                materialized: true,
            },
        );
        overlay.save_dir(ROOT_INODE, root).unwrap();

        let mut checker = OverlayChecker::new(&overlay);
        checker.scan_for_errors(Some(3)).unwrap();
        assert_eq!(
            checker.errors(),
            &[FsckError::new(FsckErrorKind::MissingMaterialized(2))]
        );
    }

    #[test]
    fn orphan_inode_is_reported_and_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = FsOverlay::new(dir.path());
        overlay.init(true).unwrap();
        overlay.save_dir(ROOT_INODE, super::super::OverlayDir::new()).unwrap();
        overlay.save_dir(99, super::super::OverlayDir::new()).unwrap();

        let mut checker = OverlayChecker::new(&overlay);
        checker.scan_for_errors(Some(100)).unwrap();
        assert_eq!(
            checker.errors(),
            &[FsckError::new(FsckErrorKind::OrphanInode(99))]
        );

        let result = checker
            .repair_errors(dir.path().join("lost+found"))
            .unwrap()
            .unwrap();
        assert_eq!(result.total_errors, 1);
        assert_eq!(result.fixed_errors, 1);
    }

    #[test]
    fn bad_next_inode_watermark_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = FsOverlay::new(dir.path());
        overlay.init(true).unwrap();
        overlay.save_dir(ROOT_INODE, super::super::OverlayDir::new()).unwrap();

        let mut checker = OverlayChecker::new(&overlay);
        checker.scan_for_errors(Some(500)).unwrap();
        assert_eq!(
            checker.errors(),
            &[FsckError::new(FsckErrorKind::BadNextInode {
                found: Some(500),
                expected: ROOT_INODE + 1,
            })]
        );
    }
}
