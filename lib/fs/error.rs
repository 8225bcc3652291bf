//! The error type shared by all pipeline layers.

use thiserror::Error;

/// Error surfaced by a pipeline operation, convertible to a POSIX errno at
/// the FUSE boundary.
#[derive(Debug, Error)]
pub enum FsError {
    /// The path exists neither remotely nor in the local shadow.
    #[error("entry not found")]
    NotFound,

    /// The handle carries no open descriptor.
    #[error("handle has no open descriptor")]
    BadHandle,

    /// Local and remote state disagree in a way that cannot be recovered.
    #[error("{0}")]
    Unrecoverable(&'static str),

    /// Any other local failure, surfaced with its OS errno.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// Whether this error means the entry is absent, regardless of which
    /// side of the pipeline produced it.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            Self::BadHandle | Self::Unrecoverable(_) => false,
        }
    }

    /// The POSIX errno this error maps to.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::BadHandle => libc::EBADF,
            Self::Unrecoverable(_) => libc::EIO,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl From<FsError> for i32 {
    fn from(e: FsError) -> Self {
        e.errno()
    }
}

impl From<nix::errno::Errno> for FsError {
    fn from(e: nix::errno::Errno) -> Self {
        Self::Io(std::io::Error::from_raw_os_error(e as i32))
    }
}
