//! The file cache layer.
//!
//! [`FileCache`] shadows remote objects as plain files under a temp root so
//! reads and writes run at local-disk latency, while the next link (the
//! remote object-store client) stays authoritative. For any path there are
//! three situations to reconcile: present only remotely (not yet
//! downloaded), present only locally (created or written but not yet
//! uploaded), and present on both sides (local size/mtime may be ahead of
//! the store). Writes are pushed back on flush; downloads happen lazily on
//! open.

/// Cache configuration options.
pub mod config;
/// Eviction policies and their sweep engine.
pub mod eviction;
mod invalidator;
/// Per-path lock table.
pub mod path_locks;
mod shadow;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::fs::attr::{stat_time, ObjectAttr, OpenFlags, Permissions};
use crate::fs::error::FsError;
use crate::fs::handle::{Handle, HandleFlags, HandleTable};
use crate::fs::layer::FsLayer;

pub use config::{CacheSetupError, FileCacheOptions};
use eviction::CachePolicy;
use invalidator::Invalidator;
use path_locks::PathLocks;
use shadow::ExclusiveProbe;

pub use config::PolicyConfig;

/// The option subset that may change while the layer is running.
#[derive(Debug, Clone, Copy)]
struct HotOptions {
    create_empty_file: bool,
    cache_timeout: Duration,
    direct_read: bool,
}

/// The local file cache pipeline layer.
///
/// `N` is the next link, normally the remote object-store client.
pub struct FileCache<N> {
    next: N,
    tmp_path: PathBuf,
    locks: Arc<PathLocks>,
    policy: Arc<dyn CachePolicy>,
    handles: HandleTable,
    /// Paths whose chmod arrived before the remote object existed; the
    /// mode is replayed after the next successful upload.
    missed_chmod: scc::HashSet<String>,
    invalidator: Invalidator,
    hot: RwLock<HotOptions>,
    default_mode: Permissions,
    cleanup_on_start: bool,
}

#[expect(
    clippy::expect_used,
    reason = "hot-options lock poisoning is unrecoverable; panicking is the correct behavior"
)]
impl<N: FsLayer> FileCache<N> {
    /// Validate the options, prepare the temp root, and build the layer.
    ///
    /// `mount_path` and `allow_other` come from the gateway configuration:
    /// the temp root must not be the mount point itself, and `allow_other`
    /// picks the default permission bits for files the store reports no
    /// mode for.
    pub async fn new(
        options: FileCacheOptions,
        mount_path: &Path,
        allow_other: bool,
        next: N,
    ) -> Result<Self, CacheSetupError> {
        if options.path.as_os_str().is_empty() {
            return Err(CacheSetupError::EmptyTempPath);
        }
        if options.path == mount_path {
            return Err(CacheSetupError::TempPathIsMountPath(options.path));
        }

        match tokio::fs::metadata(&options.path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                shadow::create_dir_chain(&options.path, Permissions::from_mode(0o755)).await?;
            }
            Err(e) => return Err(e.into()),
        }

        if !options.allow_non_empty_temp && !shadow::dir_is_empty(&options.path).await {
            return Err(CacheSetupError::TempPathNotEmpty(options.path));
        }

        let locks = Arc::new(PathLocks::new());
        let policy =
            eviction::create_policy(&options.policy, options.policy_config(), Arc::clone(&locks));

        let default_mode = if allow_other {
            Permissions::from_mode(0o777)
        } else {
            Permissions::from_mode(0o755)
        };

        info!(
            tmp_path = %options.path.display(),
            policy = policy.name(),
            timeout_sec = options.timeout_sec,
            create_empty_file = options.create_empty_file,
            "file cache configured"
        );

        Ok(Self {
            next,
            tmp_path: options.path.clone(),
            invalidator: Invalidator::spawn(
                Arc::clone(&policy),
                Arc::clone(&locks),
                options.path.clone(),
            ),
            locks,
            policy,
            handles: HandleTable::new(),
            missed_chmod: scc::HashSet::new(),
            hot: RwLock::new(HotOptions {
                create_empty_file: options.create_empty_file,
                cache_timeout: options.cache_timeout(),
                direct_read: options.direct_read,
            }),
            default_mode,
            cleanup_on_start: options.cleanup_on_start,
        })
    }

    /// Start the layer: optionally wipe the temp root, then launch the
    /// policy workers.
    pub async fn start(&self) {
        if self.cleanup_on_start {
            self.wipe_temp().await;
        }
        self.policy.start().await;
    }

    /// Stop the layer: join the policy workers, drain pending
    /// invalidations, and wipe the temp root.
    pub async fn stop(&self) {
        self.policy.shutdown().await;
        self.invalidator.drain().await;
        self.wipe_temp().await;
    }

    /// Re-read the hot-reloadable options and hand the policy its new
    /// configuration. Only `create-empty-file`, `timeout-sec`,
    /// `policy-trace`, and `direct-read` take effect without a restart.
    pub fn on_config_change(&self, options: &FileCacheOptions) {
        {
            let mut hot = self.hot.write().expect("poisoned");
            hot.create_empty_file = options.create_empty_file;
            hot.cache_timeout = options.cache_timeout();
            hot.direct_read = options.direct_read;
        }
        self.policy.update_config(options.policy_config());
    }

    /// Resolve a handle id issued by this layer.
    #[must_use]
    pub fn handle(&self, id: u64) -> Option<Arc<Handle>> {
        self.handles.get(id)
    }

    /// The active eviction policy.
    #[must_use]
    pub fn policy(&self) -> &dyn CachePolicy {
        self.policy.as_ref()
    }

    /// The shadow path a logical path maps to.
    #[must_use]
    pub fn shadow_path(&self, name: &str) -> PathBuf {
        shadow::local_path(&self.tmp_path, name)
    }

    fn hot(&self) -> HotOptions {
        *self.hot.read().expect("poisoned")
    }

    async fn wipe_temp(&self) {
        if shadow::dir_is_empty(&self.tmp_path).await {
            return;
        }
        warn!(path = %self.tmp_path.display(), "cleaning up temp cache directory");
        if let Err(e) = shadow::clear_shadow_root(&self.tmp_path).await {
            warn!(error = %e, "temp cache cleanup failed");
        }
    }

    /// Decide whether a fresh download is needed and whether a shadow file
    /// is already present.
    async fn is_download_required(&self, local: &Path) -> (bool, bool) {
        use std::os::unix::fs::MetadataExt as _;

        let mut download_required = false;
        let mut file_exists = false;

        if !self.policy.is_cached(local) {
            debug!(path = ?local, "not present in cache policy");
            download_required = true;
        }

        match tokio::fs::metadata(local).await {
            Ok(meta) => {
                file_exists = true;
                // The change time reflects the download instant (the mtime
                // is reset to the remote mtime right after download), so
                // both must exceed the timeout before the copy counts as
                // stale.
                let timeout = self.hot().cache_timeout;
                let now = SystemTime::now();
                let stale = |t: SystemTime| now.duration_since(t).is_ok_and(|age| age > timeout);
                if stale(stat_time(meta.mtime(), meta.mtime_nsec()))
                    && stale(stat_time(meta.ctime(), meta.ctime_nsec()))
                {
                    debug!(path = ?local, "shadow copy expired");
                    download_required = true;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?local, "no shadow copy present");
                download_required = true;
            }
            Err(e) => {
                debug!(path = ?local, error = %e, "stat failed, forcing download");
                download_required = true;
            }
        }

        (download_required, file_exists)
    }

    /// Decide what a remote not-found really means for an operation that
    /// must mutate both sides of a path.
    ///
    /// With `create-empty-file` on, every object exists remotely from
    /// creation, so a not-found is spurious and swallowed. Otherwise the
    /// local shadow decides: absent on both sides is a real `NotFound`; a
    /// pending local copy makes the operation recoverable by the upload on
    /// flush/close, or unrecoverable (`EIO`) when the caller cannot wait
    /// for that.
    async fn validate_storage_result(
        &self,
        path: &str,
        result: Result<(), FsError>,
        method: &'static str,
        recoverable: bool,
    ) -> Result<(), FsError> {
        let Err(err) = result else {
            return Ok(());
        };
        if !err.is_not_found() {
            return Err(err);
        }

        debug!(path, method, "object does not exist in storage");
        if self.hot().create_empty_file {
            return Ok(());
        }

        // The policy may have merely marked the entry for eviction, so ask
        // the filesystem, not the policy.
        match tokio::fs::metadata(self.shadow_path(path)).await {
            Err(_) => {
                debug!(path, method, "no local copy either");
                Err(FsError::NotFound)
            }
            Ok(_) if recoverable => {
                debug!(path, method, "pending local copy recovers this on flush");
                Ok(())
            }
            Ok(_) => {
                error!(path, method, "local copy exists but operation cannot recover");
                Err(FsError::Unrecoverable("local copy not yet flushed"))
            }
        }
    }

    fn new_handle(&self, name: &str, lock: nix::fcntl::Flock<std::fs::File>, size: u64) -> Arc<Handle> {
        let handle = Arc::new(Handle::with_descriptor(
            self.handles.allocate(),
            name,
            lock,
            size,
        ));
        if self.hot().direct_read {
            handle.set(HandleFlags::CACHED);
        }
        self.handles.register(Arc::clone(&handle));
        handle
    }
}

#[async_trait]
impl<N: FsLayer> FsLayer for FileCache<N> {
    fn name(&self) -> &'static str {
        "file_cache"
    }

    async fn delete_dir(&self, name: &str) -> Result<(), FsError> {
        let result = self.next.delete_dir(name).await;
        if let Err(e) = &result {
            // The remote object for the directory may never have been
            // created; the local shadow still needs cleanup.
            error!(name, error = %e, "remote directory delete failed");
        }
        self.invalidator.schedule(self.shadow_path(name)).await;
        result
    }

    async fn rename_dir(&self, src: &str, dst: &str) -> Result<(), FsError> {
        self.next.rename_dir(src, dst).await.map_err(|e| {
            error!(src, dst, error = %e, "remote directory rename failed");
            e
        })?;

        // The front-end guarantees dst is empty or absent, so only the
        // source subtree needs invalidation.
        self.invalidator.schedule(self.shadow_path(src)).await;
        Ok(())
    }

    async fn read_dir(&self, name: &str) -> Result<Vec<ObjectAttr>, FsError> {
        use std::os::unix::fs::MetadataExt as _;

        // The remote listing is authoritative; a failure still lets the
        // local entries be served.
        let mut attrs = match self.next.read_dir(name).await {
            Ok(attrs) => attrs,
            Err(e) => {
                error!(name, error = %e, "remote listing failed");
                Vec::new()
            }
        };
        let mut index: HashMap<String, usize> = attrs
            .iter()
            .enumerate()
            .map(|(i, attr)| (attr.path.clone(), i))
            .collect();

        match tokio::fs::read_dir(self.shadow_path(name)).await {
            Ok(mut entries) => {
                let create_empty_file = self.hot().create_empty_file;
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let child = entry.file_name().to_string_lossy().into_owned();
                    let entry_path = shadow::join_logical(name, &child);
                    let Ok(meta) = tokio::fs::metadata(entry.path()).await else {
                        continue;
                    };
                    // Directories are always synced with storage; only
                    // files can carry pending local state.
                    if meta.is_dir() {
                        continue;
                    }

                    if let Some(&i) = index.get(&entry_path) {
                        // Known remotely. While the path is locked it is
                        // mid-download or mid-delete, and the local
                        // size/mtime would be wrong.
                        if !self.locks.locked(&entry_path) {
                            debug!(path = %entry_path, "overlaying local size and mtime");
                            attrs[i].size = meta.len();
                            attrs[i].mtime = stat_time(meta.mtime(), meta.mtime_nsec());
                        }
                    } else if !create_empty_file {
                        debug!(path = %entry_path, "serving local-only entry");
                        let attr = ObjectAttr::from_local(entry_path.clone(), &meta);
                        index.insert(entry_path, attrs.len());
                        attrs.push(attr);
                    }
                }
            }
            Err(e) => {
                debug!(name, error = %e, "no local listing to merge");
            }
        }

        Ok(attrs)
    }

    async fn stream_dir(
        &self,
        name: &str,
        token: &str,
    ) -> Result<(Vec<ObjectAttr>, String), FsError> {
        let (mut attrs, next_token) = self.next.stream_dir(name, token).await?;

        // Local-only entries are appended to the final page.
        if next_token.is_empty() {
            if let Ok(mut entries) = tokio::fs::read_dir(self.shadow_path(name)).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let child = entry.file_name().to_string_lossy().into_owned();
                    let entry_path = shadow::join_logical(name, &child);
                    let Ok(meta) = tokio::fs::metadata(entry.path()).await else {
                        continue;
                    };
                    if meta.is_dir() || self.locks.locked(&entry_path) {
                        continue;
                    }
                    // The pages already returned are out of reach, so the
                    // remote must confirm this entry is truly local-only
                    // before it is synthesised.
                    match self.next.get_attr(&entry_path).await {
                        Err(e) if e.is_not_found() => {
                            debug!(path = %entry_path, "serving local-only entry");
                            attrs.push(ObjectAttr::from_local(entry_path, &meta));
                        }
                        _ => {}
                    }
                }
            }
        }

        Ok((attrs, next_token))
    }

    async fn is_dir_empty(&self, name: &str) -> bool {
        let mut entries = match tokio::fs::read_dir(self.shadow_path(name)).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(name, "directory not in local cache");
                return self.next.is_dir_empty(name).await;
            }
            Err(e) => {
                error!(name, error = %e, "error opening local directory");
                return false;
            }
            Ok(entries) => entries,
        };

        match entries.next_entry().await {
            // The policy removes emptied directories, so a present-and-
            // empty local directory was probably just emptied; trust it.
            Ok(None) => true,
            Ok(Some(_)) if !self.hot().create_empty_file => false,
            _ => self.next.is_dir_empty(name).await,
        }
    }

    async fn create_file(&self, name: &str, mode: Permissions) -> Result<Arc<Handle>, FsError> {
        let hot = self.hot();
        let _guard = self.locks.lock(name).await;

        if hot.create_empty_file {
            // The object must exist in storage before the kernel's
            // follow-up getattr, or the whole create sequence fails.
            self.next.create_file(name, mode).await.map_err(|e| {
                error!(name, error = %e, "remote create failed");
                e
            })?;
        }

        let local = self.shadow_path(name);
        self.policy.mark_valid(&local);

        if let Some(parent) = local.parent() {
            shadow::create_dir_chain(parent, self.default_mode).await.map_err(|e| {
                error!(name, error = %e, "unable to create local directory chain");
                FsError::from(e)
            })?;
        }

        let file = shadow::open_with_flags(
            &local,
            OpenFlags::RDWR | OpenFlags::CREAT | OpenFlags::TRUNC,
            mode,
        )
        .map_err(|e| {
            error!(name, error = %e, "error opening local file");
            FsError::from(e)
        })?;

        // The user may chmod while the object is still local-only; a
        // non-default create mode is replayed to the store after upload.
        if mode != self.default_mode {
            let _ = self.missed_chmod.insert_sync(name.to_owned());
        }

        let lock = shadow::lock_shared(file).map_err(|errno| {
            error!(name, error = %errno, "error locking local file");
            FsError::from(errno)
        })?;

        let handle = self.new_handle(name, lock, 0);
        // With a remote placeholder already created there is nothing to
        // upload if flush follows immediately.
        if !hot.create_empty_file {
            handle.set(HandleFlags::DIRTY);
        }
        Ok(handle)
    }

    async fn open_file(
        &self,
        name: &str,
        flags: OpenFlags,
        mode: Permissions,
    ) -> Result<Arc<Handle>, FsError> {
        let local = self.shadow_path(name);
        let _guard = self.locks.lock(name).await;

        // Decide before the touch below: marking the entry valid first
        // would make the policy-miss check vacuous.
        let (mut download_required, file_exists) = self.is_download_required(&local).await;
        self.policy.mark_valid(&local);

        if file_exists && download_required {
            // Re-download overwrites the file, so it must not be in use.
            let file = match shadow::open_with_flags(&local, OpenFlags::WRONLY, mode) {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    // No write permission on the shadow copy; widen it and
                    // retry once.
                    warn!(name, "no write permission on shadow copy, resetting mode");
                    let widened = (|| {
                        use std::os::unix::fs::PermissionsExt as _;
                        let ro = std::fs::File::open(&local)?;
                        ro.set_permissions(std::fs::Permissions::from_mode(0o666))?;
                        drop(ro);
                        shadow::open_with_flags(&local, OpenFlags::WRONLY, mode)
                    })();
                    widened.map_err(|e| {
                        error!(name, error = %e, "failed to reopen shadow copy for write");
                        FsError::from(e)
                    })?
                }
                Err(e) => {
                    error!(name, error = %e, "failed to open shadow copy for write");
                    return Err(e.into());
                }
            };

            match shadow::try_lock_exclusive(file) {
                Ok(ExclusiveProbe::Acquired(lock)) => {
                    // Nobody is using the stale copy; clear it out so the
                    // download starts from scratch.
                    if let Err(e) = std::fs::remove_file(&local) {
                        error!(name, error = %e, "error removing stale shadow copy");
                    }
                    match lock.unlock() {
                        Ok(file) => drop(file),
                        Err((_, errno)) => {
                            error!(name, error = %errno, "error unlocking shadow copy");
                            return Err(errno.into());
                        }
                    }
                }
                Ok(ExclusiveProbe::Busy(_)) => {
                    // Someone holds the file open. The timeout said the
                    // copy is stale, but overwriting in-use data is worse;
                    // serve the existing bytes.
                    warn!(name, "shadow copy in use, serving existing cached copy");
                    download_required = false;
                }
                Err(errno) => {
                    error!(name, error = %errno, "advisory lock failed");
                    return Err(errno.into());
                }
            }
        }

        if download_required {
            debug!(name, "downloading object");

            if !file_exists {
                if let Some(parent) = local.parent() {
                    shadow::create_dir_chain(parent, self.default_mode).await.map_err(|e| {
                        error!(name, error = %e, "unable to create local directory chain");
                        FsError::from(e)
                    })?;
                }
            }

            let mut file = {
                let mut opts = tokio::fs::OpenOptions::new();
                opts.create(true).write(true).mode(mode.mode());
                opts.open(&local).await.map_err(|e| {
                    error!(name, error = %e, "error creating shadow file");
                    FsError::from(e)
                })?
            };

            let attr = match self.next.get_attr(name).await {
                Ok(attr) => Some(attr),
                Err(e) => {
                    warn!(name, error = %e, "failed to get remote attributes");
                    None
                }
            };
            let size = attr.as_ref().map_or(0, |a| a.size);

            // A zero-byte object needs no transfer; an unknown size means
            // the whole object is fetched.
            if attr.is_none() || size > 0 {
                self.next
                    .copy_to_file(name, 0, size, &mut file)
                    .await
                    .map_err(|e| {
                        error!(name, error = %e, "download failed");
                        e
                    })?;
            }
            drop(file);
            debug!(name, "download complete");

            shadow::mirror_remote_metadata(&local, attr.as_ref(), self.default_mode);
        } else {
            debug!(name, "serving from cache");
        }

        let file = shadow::open_with_flags(&local, flags, mode).map_err(|e| {
            error!(name, error = %e, "error opening cached file");
            FsError::from(e)
        })?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        let lock = shadow::lock_shared(file).map_err(|errno| {
            error!(name, error = %errno, "error locking cached file");
            FsError::from(errno)
        })?;

        Ok(self.new_handle(name, lock, size))
    }

    async fn close_file(&self, handle: &Handle) -> Result<(), FsError> {
        if handle.has(HandleFlags::DIRTY) {
            debug!(path = handle.path(), "dirty handle, flushing before close");
            self.flush_file(handle).await.map_err(|e| {
                error!(path = handle.path(), error = %e, "flush on close failed");
                e
            })?;
        }

        handle.release_descriptor().map_err(|e| {
            error!(path = handle.path(), error = %e, "error releasing descriptor");
            e
        })?;
        self.handles.remove(handle.id());

        let local = self.shadow_path(handle.path());
        if handle.has(HandleFlags::FSYNCED) {
            // The user asked for durability; the shadow copy has served
            // its purpose.
            let _guard = self.locks.lock(handle.path()).await;
            let _ = tokio::fs::remove_file(&local).await;
            self.policy.purge(&local).await;
            return Ok(());
        }

        self.policy.mark_invalidated(&local).await;
        Ok(())
    }

    async fn read_file(&self, handle: &Handle) -> Result<Bytes, FsError> {
        self.policy.mark_valid(&self.shadow_path(handle.path()));

        let meta = handle.metadata()?;
        let size = usize::try_from(meta.len())
            .map_err(|_| FsError::Unrecoverable("file too large to buffer"))?;
        let mut data = vec![0u8; size];
        let read = handle.read_at(&mut data, 0)?;
        if read != size {
            error!(path = handle.path(), read, size, "short read from shadow copy");
            return Err(FsError::Unrecoverable("short read from shadow copy"));
        }
        Ok(Bytes::from(data))
    }

    async fn read_in_buffer(
        &self,
        handle: &Handle,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, FsError> {
        self.policy.mark_valid(&self.shadow_path(handle.path()));
        handle.read_at(buf, offset)
    }

    async fn write_file(
        &self,
        handle: &Handle,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, FsError> {
        self.policy.mark_valid(&self.shadow_path(handle.path()));
        // The write-back on flush covers everything written through this
        // handle, including a failed partial write.
        handle.set(HandleFlags::DIRTY);
        handle.write_at(data, offset)
    }

    async fn flush_file(&self, handle: &Handle) -> Result<(), FsError> {
        let local = self.shadow_path(handle.path());
        self.policy.mark_valid(&local);

        if !handle.has(HandleFlags::DIRTY) {
            return Ok(());
        }

        // Closing a duplicate of the descriptor pushes kernel-buffered
        // writes to disk. The primary descriptor stays open: flush and
        // close may both be called again on this handle.
        drop(handle.duplicate()?);

        let replay_chmod = {
            let _guard = self.locks.lock(handle.path()).await;

            let mut upload = match tokio::fs::File::open(&local).await {
                Ok(upload) => upload,
                Err(e) => {
                    // The shadow file is gone (deleted while held open).
                    // The close path observes the same condition; failing
                    // here as well would report the problem twice.
                    handle.clear(HandleFlags::DIRTY);
                    error!(path = handle.path(), error = %e, "unable to open upload handle");
                    return Ok(());
                }
            };

            self.next
                .copy_from_file(handle.path(), &mut upload)
                .await
                .map_err(|e| {
                    error!(path = handle.path(), error = %e, "upload failed");
                    e
                })?;
            handle.clear(HandleFlags::DIRTY);

            self.missed_chmod.remove_sync(handle.path()).is_some()
        };

        // A chmod raced the first upload of this object; replay it now
        // from the local mode. Chmod takes the path lock itself, so the
        // flush guard is released first.
        if replay_chmod {
            if let Ok(meta) = tokio::fs::symlink_metadata(&local).await {
                use std::os::unix::fs::MetadataExt as _;
                if let Err(e) = self
                    .chmod(handle.path(), Permissions::from_mode(meta.mode()))
                    .await
                {
                    // The chmod was already missed once; a second failure
                    // must not fail the flush that just succeeded.
                    error!(path = handle.path(), error = %e, "missed chmod replay failed");
                }
            }
        }

        Ok(())
    }

    async fn sync_file(&self, handle: &Handle) -> Result<(), FsError> {
        self.next.sync_file(handle).await.map_err(|e| {
            error!(path = handle.path(), error = %e, "remote sync failed");
            e
        })?;
        // Close purges the shadow copy of a synced file.
        handle.set(HandleFlags::FSYNCED);
        Ok(())
    }

    async fn delete_file(&self, name: &str) -> Result<(), FsError> {
        let _guard = self.locks.lock(name).await;

        let result = self.next.delete_file(name).await;
        self.validate_storage_result(name, result, "delete_file", false)
            .await
            .map_err(|e| {
                error!(name, error = %e, "delete failed");
                e
            })?;

        let local = self.shadow_path(name);
        let _ = tokio::fs::remove_file(&local).await;
        self.policy.purge(&local).await;
        Ok(())
    }

    async fn rename_file(&self, src: &str, dst: &str) -> Result<(), FsError> {
        // Both locks, in lexicographic order; crossing renames would
        // deadlock under acquisition in argument order.
        let (first, second) = if src <= dst { (src, dst) } else { (dst, src) };
        let _first_guard = self.locks.lock(first).await;
        let _second_guard = if first == second {
            None
        } else {
            Some(self.locks.lock(second).await)
        };

        let result = self.next.rename_file(src, dst).await;
        self.validate_storage_result(src, result, "rename_file", false)
            .await
            .map_err(|e| {
                error!(src, dst, error = %e, "rename failed");
                e
            })?;

        let local_src = self.shadow_path(src);
        let local_dst = self.shadow_path(dst);

        // A cached destination must not survive with stale content: move
        // the source copy over it, or failing that, purge it.
        if let Err(e) = tokio::fs::rename(&local_src, &local_dst).await {
            error!(src, dst, error = %e, "local rename failed");
            let _ = tokio::fs::remove_file(&local_dst).await;
            self.policy.purge(&local_dst).await;
        }

        let _ = tokio::fs::remove_file(&local_src).await;
        self.policy.purge(&local_src).await;
        Ok(())
    }

    async fn truncate_file(&self, name: &str, size: u64) -> Result<(), FsError> {
        let _guard = self.locks.lock(name).await;

        let result = self.next.truncate_file(name, size).await;
        self.validate_storage_result(name, result, "truncate_file", true)
            .await
            .map_err(|e| {
                error!(name, error = %e, "truncate failed");
                e
            })?;

        let local = self.shadow_path(name);
        if let Ok(meta) = tokio::fs::metadata(&local).await {
            self.policy.mark_valid(&local);
            if meta.len() != size {
                let len = i64::try_from(size)
                    .map_err(|_| FsError::Unrecoverable("truncate size out of range"))?;
                nix::unistd::truncate(&local, len).map_err(|errno| {
                    error!(name, error = %errno, "local truncate failed");
                    FsError::from(errno)
                })?;
            }
        }
        Ok(())
    }

    async fn chmod(&self, name: &str, mode: Permissions) -> Result<(), FsError> {
        let _guard = self.locks.lock(name).await;

        let result = self.next.chmod(name, mode).await;
        match self
            .validate_storage_result(name, result, "chmod", false)
            .await
        {
            Ok(()) => {}
            // The object is still local-only; remember the mode and replay
            // it after the first upload.
            Err(e) if e.errno() == libc::EIO => {
                let _ = self.missed_chmod.insert_sync(name.to_owned());
            }
            Err(e) => {
                error!(name, error = %e, "chmod failed");
                return Err(e);
            }
        }

        let local = self.shadow_path(name);
        if let Ok(meta) = tokio::fs::metadata(&local).await {
            use std::os::unix::fs::{MetadataExt as _, PermissionsExt as _};
            self.policy.mark_valid(&local);
            if Permissions::from_mode(meta.mode()) != mode {
                tokio::fs::set_permissions(&local, std::fs::Permissions::from_mode(mode.mode()))
                    .await
                    .map_err(|e| {
                        error!(name, error = %e, "local chmod failed");
                        FsError::from(e)
                    })?;
            }
        }
        Ok(())
    }

    async fn chown(&self, name: &str, owner: u32, group: u32) -> Result<(), FsError> {
        let _guard = self.locks.lock(name).await;

        let result = self.next.chown(name, owner, group).await;
        self.validate_storage_result(name, result, "chown", false)
            .await
            .map_err(|e| {
                error!(name, error = %e, "chown failed");
                e
            })?;

        let local = self.shadow_path(name);
        if tokio::fs::metadata(&local).await.is_ok() {
            self.policy.mark_valid(&local);
            nix::unistd::chown(
                &local,
                Some(nix::unistd::Uid::from_raw(owner)),
                Some(nix::unistd::Gid::from_raw(group)),
            )
            .map_err(|errno| {
                error!(name, error = %errno, "local chown failed");
                FsError::from(errno)
            })?;
        }
        Ok(())
    }

    async fn get_attr(&self, name: &str) -> Result<ObjectAttr, FsError> {
        use std::os::unix::fs::MetadataExt as _;

        let mut attrs = match self.next.get_attr(name).await {
            Ok(attr) => Some(attr),
            Err(e) if e.is_not_found() => {
                debug!(name, "object does not exist in storage");
                None
            }
            Err(e) => {
                error!(name, error = %e, "failed to get remote attributes");
                return Err(e);
            }
        };

        let local = self.shadow_path(name);
        if let Ok(meta) = tokio::fs::symlink_metadata(&local).await {
            // Directories are always synced with storage and never carry
            // local-only state.
            if !meta.is_dir() {
                match attrs.as_mut() {
                    Some(attr) => {
                        // A locked path is mid-download or mid-delete; its
                        // local size/mtime would be wrong.
                        if self.locks.locked(name) {
                            debug!(name, "path locked, using storage attributes");
                        } else {
                            debug!(name, "overlaying local size and mtime");
                            attr.size = meta.len();
                            attr.mtime = stat_time(meta.mtime(), meta.mtime_nsec());
                        }
                    }
                    None => {
                        // Local-only: synthesise, but never for a path
                        // that escaped the temp root.
                        if local.starts_with(&self.tmp_path) {
                            debug!(name, "serving attributes from local cache");
                            attrs = Some(ObjectAttr::from_local(name, &meta));
                        }
                    }
                }
            }
        }

        attrs.ok_or(FsError::NotFound)
    }

    async fn copy_to_file(
        &self,
        name: &str,
        offset: u64,
        count: u64,
        file: &mut tokio::fs::File,
    ) -> Result<(), FsError> {
        self.next.copy_to_file(name, offset, count, file).await
    }

    async fn copy_from_file(
        &self,
        name: &str,
        file: &mut tokio::fs::File,
    ) -> Result<(), FsError> {
        self.next.copy_from_file(name, file).await
    }
}
