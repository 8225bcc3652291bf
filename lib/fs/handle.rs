//! Open-file handles and the registry that hands them to the front-end.
//!
//! A [`Handle`] binds a logical path to a local descriptor for the lifetime
//! of one open. The descriptor is wrapped in a [`Flock`] so the shared
//! advisory lock taken at open is released exactly when the descriptor is
//! closed, which is what keeps the eviction workers away from in-use
//! shadow files.

use std::fs::File;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use bitflags::bitflags;
use nix::fcntl::Flock;

use crate::fs::error::FsError;

bitflags! {
    /// Per-handle state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandleFlags: u8 {
        /// The local file was written since the last successful upload.
        const DIRTY   = 1 << 0;
        /// The user requested durability; the shadow file is purged on close.
        const FSYNCED = 1 << 1;
        /// Reads are served straight from the cache without re-validation.
        const CACHED  = 1 << 2;
    }
}

/// An open file, as seen by the front-end.
///
/// The descriptor slot is empty for handles minted by layers that do not
/// materialise a local file (e.g. the remote client); descriptor-bound
/// operations on such a handle fail with [`FsError::BadHandle`].
pub struct Handle {
    id: u64,
    path: String,
    file: Mutex<Option<Flock<File>>>,
    flags: AtomicU8,
    size: AtomicU64,
}

#[expect(
    clippy::expect_used,
    reason = "descriptor mutex poisoning is unrecoverable; panicking is the correct behavior"
)]
impl Handle {
    /// A handle with no local descriptor.
    #[must_use]
    pub fn new(id: u64, path: impl Into<String>) -> Self {
        Self {
            id,
            path: path.into(),
            file: Mutex::new(None),
            flags: AtomicU8::new(0),
            size: AtomicU64::new(0),
        }
    }

    /// A handle bound to a locked-open local descriptor.
    pub(crate) fn with_descriptor(
        id: u64,
        path: impl Into<String>,
        file: Flock<File>,
        size: u64,
    ) -> Self {
        Self {
            id,
            path: path.into(),
            file: Mutex::new(Some(file)),
            flags: AtomicU8::new(0),
            size: AtomicU64::new(size),
        }
    }

    /// Opaque id the front-end refers to this handle by.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Logical path captured at open time. Renames do not update it.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// File size observed when the handle was opened.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn set(&self, flag: HandleFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::Relaxed);
    }

    pub fn clear(&self, flag: HandleFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn has(&self, flag: HandleFlags) -> bool {
        HandleFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed)).contains(flag)
    }

    /// Read into `buf` at `offset` from the bound descriptor.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
        use std::os::unix::fs::FileExt as _;

        let guard = self.file.lock().expect("poisoned");
        let file = guard.as_ref().ok_or(FsError::BadHandle)?;
        Ok(file.read_at(buf, offset)?)
    }

    /// Write `data` at `offset` through the bound descriptor.
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<usize, FsError> {
        use std::os::unix::fs::FileExt as _;

        let guard = self.file.lock().expect("poisoned");
        let file = guard.as_ref().ok_or(FsError::BadHandle)?;
        Ok(file.write_at(data, offset)?)
    }

    /// Stat the bound descriptor.
    pub fn metadata(&self) -> Result<std::fs::Metadata, FsError> {
        let guard = self.file.lock().expect("poisoned");
        let file = guard.as_ref().ok_or(FsError::BadHandle)?;
        Ok(file.metadata()?)
    }

    /// Duplicate the bound descriptor.
    ///
    /// Dropping the duplicate flushes kernel-buffered data without
    /// disturbing the primary descriptor or its advisory lock.
    pub fn duplicate(&self) -> Result<File, FsError> {
        let guard = self.file.lock().expect("poisoned");
        let file = guard.as_ref().ok_or(FsError::BadHandle)?;
        file.try_clone()
            .map_err(|_| FsError::Unrecoverable("unable to duplicate handle descriptor"))
    }

    /// Release the advisory lock and close the descriptor.
    pub(crate) fn release_descriptor(&self) -> Result<(), FsError> {
        let lock = self
            .file
            .lock()
            .expect("poisoned")
            .take()
            .ok_or(FsError::BadHandle)?;
        match lock.unlock() {
            Ok(file) => {
                drop(file);
                Ok(())
            }
            Err((_, errno)) => Err(errno.into()),
        }
    }

    /// Whether a descriptor is currently bound.
    #[must_use]
    pub fn has_descriptor(&self) -> bool {
        self.file.lock().expect("poisoned").is_some()
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("flags", &self.flags.load(Ordering::Relaxed))
            .field("size", &self.size.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Registry of live handles, keyed by their opaque id.
///
/// Layers that mint handles register them here; the front-end resolves ids
/// back to handles through the same table.
pub struct HandleTable {
    next_id: AtomicU64,
    map: scc::HashMap<u64, std::sync::Arc<Handle>>,
}

impl HandleTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            map: scc::HashMap::new(),
        }
    }

    /// Allocate a fresh handle id.
    pub fn allocate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a live handle.
    pub fn register(&self, handle: std::sync::Arc<Handle>) {
        let _ = self.map.insert_sync(handle.id(), handle);
    }

    /// Resolve an id to its handle.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<std::sync::Arc<Handle>> {
        self.map
            .get_sync(&id)
            .map(|entry| std::sync::Arc::clone(&*entry))
    }

    /// Drop a handle from the registry.
    pub fn remove(&self, id: u64) {
        let _ = self.map.remove_sync(&id);
    }

    /// Number of live handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
