//! Flat-file overlay backend: one file per directory row, one file per
//! materialized file body, sharded by inode number. Grounded on
//! `castore::blobservice::simplefs::SimpleFilesystemBlobService`'s
//! `blobs/B3DIGEST[:2]/B3DIGEST[2:]` sharding scheme.
//!
//! `supports_semantic_operations()` is `false`: callers must
//! read-modify-write through `load_dir`/`save_dir`.

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{
    encode_header, FileDescriptor, HeaderError, InodeNumber, Overlay, OverlayBodyTag, OverlayDir,
    OverlayEntry, OverlayEntryKind, OverlayTimestamps, OVERLAY_HEADER_LEN,
};
use crate::error::{EdenError, Result};
use crate::path::PathComponent;

pub struct FsOverlay {
    root: PathBuf,
    next_inode_lock: Mutex<()>,
}

impl FsOverlay {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            next_inode_lock: Mutex::new(()),
        }
    }

    fn shard_dir(&self, kind: &str, id: InodeNumber) -> PathBuf {
        self.root.join(kind).join(format!("{:02x}", id % 256))
    }

    fn row_path(&self, kind: &str, id: InodeNumber) -> PathBuf {
        self.shard_dir(kind, id).join(id.to_string())
    }

    fn ensure_shard(&self, kind: &str, id: InodeNumber) -> Result<PathBuf> {
        let dir = self.shard_dir(kind, id);
        fs::create_dir_all(&dir).map_err(EdenError::from)?;
        Ok(dir.join(id.to_string()))
    }

    fn clean_marker(&self) -> PathBuf {
        self.root.join("clean-shutdown")
    }

    fn next_inode_path(&self) -> PathBuf {
        self.root.join("next-inode")
    }

    fn xattr_path(&self, id: InodeNumber, name: &str) -> PathBuf {
        self.shard_dir("xattrs", id)
            .join(format!("{id}.{}", name.replace('.', "_")))
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

struct FsFileDescriptor {
    file: Arc<File>,
}

/// Every method here operates on the logical body, past the fixed
/// overlay header: offsets are shifted by [`OVERLAY_HEADER_LEN`] before
/// touching the underlying file, transparently to callers.
impl FileDescriptor for FsFileDescriptor {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        Ok(self
            .file
            .read_at(buf, offset + OVERLAY_HEADER_LEN as u64)
            .map_err(EdenError::from)?)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        Ok(self
            .file
            .write_at(buf, offset + OVERLAY_HEADER_LEN as u64)
            .map_err(EdenError::from)?)
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.file
            .set_len(len + OVERLAY_HEADER_LEN as u64)
            .map_err(EdenError::from)
    }

    fn len(&self) -> Result<u64> {
        let raw = self.file.metadata().map_err(EdenError::from)?.len();
        Ok(raw.saturating_sub(OVERLAY_HEADER_LEN as u64))
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(EdenError::from)
    }
}

/// Serializes an [`OverlayDir`] to bytes (length-prefixed entries),
/// mirroring the entry encoding used for [`crate::model::Tree`].
fn serialize_overlay_dir(dir: &OverlayDir) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(dir.entries.len() as u32).to_be_bytes());
    for (name, entry) in &dir.entries {
        let name_bytes = name.as_bytes();
        out.extend_from_slice(&(name_bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(name_bytes);
        out.extend_from_slice(&entry.ino.to_be_bytes());
        out.push(match entry.kind {
            OverlayEntryKind::Regular => 0,
            OverlayEntryKind::Executable => 1,
            OverlayEntryKind::Symlink => 2,
            OverlayEntryKind::Directory => 3,
        });
        out.push(entry.materialized as u8);
    }
    out
}

fn deserialize_overlay_dir(bytes: &[u8]) -> Result<OverlayDir> {
    let err = || EdenError::BackendUnavailable("corrupt overlay directory row".into());
    if bytes.len() < 4 {
        return Err(err());
    }
    let count = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let mut pos = 4;
    let mut dir = OverlayDir::new();
    for _ in 0..count {
        if bytes.len() < pos + 4 {
            return Err(err());
        }
        let name_len = u32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if bytes.len() < pos + name_len + 8 + 1 + 1 {
            return Err(err());
        }
        let name_bytes = &bytes[pos..pos + name_len];
        pos += name_len;
        let ino = u64::from_be_bytes(bytes[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let kind = match bytes[pos] {
            0 => OverlayEntryKind::Regular,
            1 => OverlayEntryKind::Executable,
            2 => OverlayEntryKind::Symlink,
            _ => OverlayEntryKind::Directory,
        };
        pos += 1;
        let materialized = bytes[pos] != 0;
        pos += 1;
        let name = PathComponent::try_from(bytes::Bytes::copy_from_slice(name_bytes))
            .map_err(|_| err())?;
        dir.insert(
            name,
            OverlayEntry {
                ino,
                kind,
                materialized,
            },
        );
    }
    Ok(dir)
}

impl Overlay for FsOverlay {
    fn init(&self, create_if_missing: bool) -> Result<Option<InodeNumber>> {
        if !self.root.exists() {
            if !create_if_missing {
                return Err(EdenError::BackendUnavailable(format!(
                    "overlay root {} does not exist",
                    self.root.display()
                )));
            }
            fs::create_dir_all(&self.root).map_err(EdenError::from)?;
        }
        for kind in ["dirs", "files", "xattrs"] {
            fs::create_dir_all(self.root.join(kind)).map_err(EdenError::from)?;
        }
        fs::create_dir_all(self.root.join("lost+found")).map_err(EdenError::from)?;

        let was_clean = self.clean_marker().exists();
        let _ = fs::remove_file(self.clean_marker());

        if !was_clean {
            return Ok(None);
        }

        match fs::read(self.next_inode_path()) {
            Ok(bytes) if bytes.len() == 8 => {
                Ok(Some(u64::from_be_bytes(bytes.try_into().unwrap())))
            }
            _ => Ok(None),
        }
    }

    fn close(&self, next_inode_number: InodeNumber) -> Result<()> {
        let _guard = self.next_inode_lock.lock();
        atomic_write(&self.next_inode_path(), &next_inode_number.to_be_bytes())
            .map_err(EdenError::from)?;
        fs::write(self.clean_marker(), []).map_err(EdenError::from)?;
        Ok(())
    }

    fn load_dir(&self, id: InodeNumber) -> Result<Option<OverlayDir>> {
        match fs::read(self.row_path("dirs", id)) {
            Ok(bytes) => Ok(Some(deserialize_overlay_dir(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EdenError::from(e)),
        }
    }

    fn save_dir(&self, id: InodeNumber, dir: OverlayDir) -> Result<()> {
        let path = self.ensure_shard("dirs", id)?;
        atomic_write(&path, &serialize_overlay_dir(&dir)).map_err(EdenError::from)
    }

    fn load_and_remove_dir(&self, id: InodeNumber) -> Result<Option<OverlayDir>> {
        let path = self.row_path("dirs", id);
        let dir = self.load_dir(id)?;
        if dir.is_some() {
            let _ = fs::remove_file(path);
        }
        Ok(dir)
    }

    fn remove_dir(&self, id: InodeNumber) -> Result<()> {
        if let Some(dir) = self.load_dir(id)? {
            if !dir.is_empty() {
                return Err(EdenError::NotEmpty);
            }
        }
        let _ = fs::remove_file(self.row_path("dirs", id));
        Ok(())
    }

    fn has_dir(&self, id: InodeNumber) -> Result<bool> {
        Ok(self.row_path("dirs", id).exists())
    }

    fn supports_semantic_operations(&self) -> bool {
        false
    }

    fn create_overlay_file(&self, id: InodeNumber, bytes: &[u8]) -> Result<Box<dyn FileDescriptor>> {
        let path = self.ensure_shard("files", id)?;
        let header = encode_header(OverlayBodyTag::File, OverlayTimestamps::default());
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(EdenError::from)?;
        file.write_at(&header, 0).map_err(EdenError::from)?;
        file.write_at(bytes, OVERLAY_HEADER_LEN as u64)
            .map_err(EdenError::from)?;
        Ok(Box::new(FsFileDescriptor {
            file: Arc::new(file),
        }))
    }

    fn open_overlay_file(
        &self,
        id: InodeNumber,
        expected_tag: OverlayBodyTag,
    ) -> Result<Option<Box<dyn FileDescriptor>>> {
        let path = self.row_path("files", id);
        let file = match File::options().read(true).write(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EdenError::from(e)),
        };
        let mut header_buf = [0u8; OVERLAY_HEADER_LEN];
        file.read_at(&mut header_buf, 0).map_err(EdenError::from)?;
        let (tag, _) = super::decode_header(&header_buf).map_err(|e| match e {
            HeaderError::TooShort => {
                EdenError::CorruptSnapshot("overlay file body shorter than header".into())
            }
            other => EdenError::CorruptSnapshot(other.to_string()),
        })?;
        if tag != expected_tag {
            return Err(EdenError::CorruptSnapshot(format!(
                "overlay file {id} has tag {tag:?}, expected {expected_tag:?}"
            )));
        }
        Ok(Some(Box::new(FsFileDescriptor {
            file: Arc::new(file),
        })))
    }

    fn open_overlay_file_no_verify(&self, id: InodeNumber) -> Result<Option<Box<dyn FileDescriptor>>> {
        let path = self.row_path("files", id);
        match File::options().read(true).write(true).open(&path) {
            Ok(f) => Ok(Some(Box::new(FsFileDescriptor { file: Arc::new(f) }))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EdenError::from(e)),
        }
    }

    fn remove_file(&self, id: InodeNumber) -> Result<()> {
        match fs::remove_file(self.row_path("files", id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EdenError::from(e)),
        }
    }

    fn get_xattr(&self, id: InodeNumber, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.xattr_path(id, name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EdenError::from(e)),
        }
    }

    fn set_xattr(&self, id: InodeNumber, name: &str, value: &[u8]) -> Result<()> {
        fs::create_dir_all(self.shard_dir("xattrs", id)).map_err(EdenError::from)?;
        atomic_write(&self.xattr_path(id, name), value).map_err(EdenError::from)
    }

    fn remove_xattr(&self, id: InodeNumber, name: &str) -> Result<()> {
        match fs::remove_file(self.xattr_path(id, name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EdenError::from(e)),
        }
    }

    fn all_ids(&self) -> Result<Vec<InodeNumber>> {
        let mut ids = std::collections::BTreeSet::new();
        for kind in ["dirs", "files"] {
            let base = self.root.join(kind);
            if !base.exists() {
                continue;
            }
            for shard in fs::read_dir(&base).map_err(EdenError::from)? {
                let shard = shard.map_err(EdenError::from)?;
                if !shard.path().is_dir() {
                    continue;
                }
                for entry in fs::read_dir(shard.path()).map_err(EdenError::from)? {
                    let entry = entry.map_err(EdenError::from)?;
                    if let Some(name) = entry.file_name().to_str() {
                        if let Ok(id) = name.parse::<u64>() {
                            ids.insert(id);
                        }
                    }
                }
            }
        }
        Ok(ids.into_iter().collect())
    }

    fn snapshot_path(&self) -> PathBuf {
        self.root.join("SNAPSHOT")
    }

    fn lost_and_found_dir(&self, id: InodeNumber) -> Result<()> {
        let lost = self.root.join("lost+found");
        fs::create_dir_all(&lost).map_err(EdenError::from)?;
        if let Some(dir) = self.load_dir(id)? {
            let bytes = serialize_overlay_dir(&dir);
            atomic_write(&lost.join(id.to_string()), &bytes).map_err(EdenError::from)?;
        }
        Ok(())
    }
}
