//! Crate-wide error kinds and their mapping to errno values at the
//! Channel boundary.

use thiserror::Error;

/// The closed set of error kinds the core engine can produce.
///
/// Every handler returns a `Result<_, EdenError>`; the Dispatcher's
/// per-request wrapper translates the error kind into the errno reply
/// the kernel channel expects.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EdenError {
    #[error("no such entry")]
    NoEntry,
    #[error("no such extended attribute")]
    NoAttribute,
    #[error("bad file handle")]
    BadHandle,
    #[error("is a directory")]
    IsDir,
    #[error("not a directory")]
    NotDir,
    #[error("entry already exists")]
    Exists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("overlay is read-only")]
    ReadOnly,
    #[error("rename would cross mount points")]
    CrossMount,
    #[error("access denied")]
    AccessDenied,
    #[error("operation interrupted")]
    Interrupted,
    #[error("operation timed out")]
    Timeout,
    #[error("handle space exhausted")]
    Exhausted,
    #[error("operation not implemented")]
    NotImplemented,
    #[error("snapshot file is corrupt: {0}")]
    CorruptSnapshot(String),
    #[error("backing store unavailable: {0}")]
    BackendUnavailable(String),
    #[error("mount failed: {0}")]
    MountFailed(String),
    #[error("hard links are not supported")]
    Unsupported,
    #[error("initialization protocol violation: {0}")]
    InitProtocolViolation(String),
    #[error("kernel device closed before INIT was received")]
    UnmountedDuringInit,
    #[error("I/O error: {0}")]
    Io(String),
}

impl EdenError {
    /// Maps an error kind to its fixed errno value.
    ///
    /// `MountFailed` has no errno: it is never routed to the kernel, only
    /// reported to whoever is driving the mount.
    pub fn to_errno(&self) -> i32 {
        match self {
            EdenError::NoEntry => libc::ENOENT,
            #[cfg(target_os = "linux")]
            EdenError::NoAttribute => libc::ENODATA,
            #[cfg(not(target_os = "linux"))]
            EdenError::NoAttribute => libc::ENOATTR,
            EdenError::BadHandle => libc::EBADF,
            EdenError::IsDir => libc::EISDIR,
            EdenError::NotDir => libc::ENOTDIR,
            EdenError::Exists => libc::EEXIST,
            EdenError::NotEmpty => libc::ENOTEMPTY,
            EdenError::ReadOnly => libc::EROFS,
            EdenError::CrossMount => libc::EXDEV,
            EdenError::AccessDenied => libc::EACCES,
            EdenError::Interrupted => libc::EINTR,
            EdenError::Timeout => libc::ETIMEDOUT,
            EdenError::Exhausted => libc::EMFILE,
            EdenError::NotImplemented => libc::ENOSYS,
            EdenError::Unsupported => libc::ENOSYS,
            EdenError::CorruptSnapshot(_) => libc::EIO,
            EdenError::BackendUnavailable(_) => libc::EIO,
            EdenError::Io(_) => libc::EIO,
            EdenError::InitProtocolViolation(_) => libc::EIO,
            EdenError::UnmountedDuringInit => libc::EIO,
            // Never surfaced to the kernel; callers must intercept this first.
            EdenError::MountFailed(_) => libc::EIO,
        }
    }
}

impl From<std::io::Error> for EdenError {
    fn from(e: std::io::Error) -> Self {
        EdenError::Io(e.to_string())
    }
}

impl From<EdenError> for std::io::Error {
    fn from(e: EdenError) -> Self {
        std::io::Error::from_raw_os_error(e.to_errno())
    }
}

pub type Result<T> = std::result::Result<T, EdenError>;
