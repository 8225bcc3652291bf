//! Attribute records exchanged between pipeline layers.

use std::path::Path;
use std::time::{Duration, SystemTime};

use bitflags::bitflags;

bitflags! {
    /// Permission bits for an object, mirroring Unix file permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u16 {
        /// Other: execute permission.
        const OTHER_EXECUTE = 1 << 0;
        /// Other: write permission.
        const OTHER_WRITE   = 1 << 1;
        /// Other: read permission.
        const OTHER_READ    = 1 << 2;

        /// Group: execute permission.
        const GROUP_EXECUTE = 1 << 3;
        /// Group: write permission.
        const GROUP_WRITE   = 1 << 4;
        /// Group: read permission.
        const GROUP_READ    = 1 << 5;

        /// Owner: execute permission.
        const OWNER_EXECUTE = 1 << 6;
        /// Owner: write permission.
        const OWNER_WRITE   = 1 << 7;
        /// Owner: read permission.
        const OWNER_READ    = 1 << 8;

        /// Sticky bit.
        const STICKY        = 1 << 9;
        /// Set-group-ID bit.
        const SETGID        = 1 << 10;
        /// Set-user-ID bit.
        const SETUID        = 1 << 11;
    }
}

impl Permissions {
    /// The mode bits as passed to chmod(2).
    #[must_use]
    pub fn mode(self) -> u32 {
        u32::from(self.bits())
    }

    /// Build from raw stat mode bits, discarding the file-type nibble.
    #[must_use]
    #[expect(
        clippy::cast_possible_truncation,
        reason = "permission bits occupy the low 12 bits"
    )]
    pub fn from_mode(mode: u32) -> Self {
        Self::from_bits_truncate(mode as u16)
    }
}

bitflags! {
    /// Flags for opening a file, mirroring Unix open(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;

        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;
    }
}

/// The kind of entry an [`ObjectAttr`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EntryKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
}

/// Attributes of one object, as reported by a pipeline layer.
///
/// The remote store is authoritative for these, but the cache overlays the
/// local shadow's `size` and `mtime` when it holds fresher data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectAttr {
    /// Logical path of the object, rooted at the mount.
    pub path: String,
    /// Final path component.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Permission bits, or `None` when the store reports no mode.
    pub mode: Option<Permissions>,
    /// Last access time.
    pub atime: SystemTime,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Last status change time.
    pub ctime: SystemTime,
    /// Entry kind.
    pub kind: EntryKind,
}

/// Convert stat seconds/nanoseconds into a [`SystemTime`].
#[expect(
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    reason = "nsecs from MetadataExt is always in [0, 999_999_999]"
)]
pub(crate) fn stat_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs((-secs) as u64)
            + Duration::from_nanos(nsecs as u64)
    }
}

impl ObjectAttr {
    /// Build an attribute record for a shadow file from its local stat.
    ///
    /// `path` is the logical path of the entry; the final component becomes
    /// its name.
    #[must_use]
    pub fn from_local(path: impl Into<String>, meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt as _;

        let path = path.into();
        let name = Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let kind = if meta.file_type().is_symlink() {
            EntryKind::Symlink
        } else if meta.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };

        Self {
            path,
            name,
            size: meta.len(),
            mode: Some(Permissions::from_mode(meta.mode())),
            atime: stat_time(meta.atime(), meta.atime_nsec()),
            mtime: stat_time(meta.mtime(), meta.mtime_nsec()),
            ctime: stat_time(meta.ctime(), meta.ctime_nsec()),
            kind,
        }
    }
}
