//! Safe wrappers around the local shadow tree.
//!
//! Shadow files live at `temp_root / logical_path`. Everything that
//! touches them (opens, advisory locks, metadata replication, recursive
//! invalidation, usage sampling) goes through this module so the mapping
//! between logical and local paths stays in one place.

use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, warn};

use crate::cache::eviction::CachePolicy;
use crate::cache::path_locks::PathLocks;
use crate::fs::attr::{ObjectAttr, OpenFlags, Permissions};

/// Map a logical path onto the shadow tree.
///
/// The logical path is cleaned while joining: `.` components are dropped
/// and `..` pops, so `a/../b` lands at `temp_root/b`. A path that climbs
/// above the temp root is caught by the containment check in `get_attr`.
pub(crate) fn local_path(tmp_root: &Path, logical: &str) -> PathBuf {
    let mut out = tmp_root.to_path_buf();
    for comp in Path::new(logical.trim_start_matches('/')).components() {
        match comp {
            Component::Normal(c) => out.push(c),
            Component::ParentDir => {
                out.pop();
            }
            _ => {}
        }
    }
    out
}

/// Recover the logical path of a shadow file. Inverse of [`local_path`]
/// for paths inside the temp root.
pub(crate) fn logical_of(tmp_root: &Path, local: &Path) -> String {
    local
        .strip_prefix(tmp_root)
        .unwrap_or(local)
        .to_string_lossy()
        .into_owned()
}

/// Join a directory's logical path with a child name.
pub(crate) fn join_logical(dir: &str, child: &str) -> String {
    let trimmed = dir.trim_end_matches('/');
    if dir.is_empty() {
        child.to_owned()
    } else if trimmed.is_empty() {
        format!("/{child}")
    } else {
        format!("{trimmed}/{child}")
    }
}

/// Open a shadow file with the caller's open(2) flags.
pub(crate) fn open_with_flags(
    path: &Path,
    flags: OpenFlags,
    mode: Permissions,
) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt as _;

    std::fs::OpenOptions::new()
        .read(true)
        .write(flags.contains(OpenFlags::RDWR) || flags.contains(OpenFlags::WRONLY))
        .append(flags.contains(OpenFlags::APPEND))
        .truncate(flags.contains(OpenFlags::TRUNC))
        .create(flags.contains(OpenFlags::CREAT))
        .mode(mode.mode())
        .open(path)
}

/// Create the directory chain for a shadow file.
pub(crate) async fn create_dir_chain(path: &Path, mode: Permissions) -> std::io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    builder.mode(mode.mode());
    builder.create(path).await
}

/// Take the shared advisory lock every live handle holds.
pub(crate) fn lock_shared(file: File) -> Result<Flock<File>, Errno> {
    Flock::lock(file, FlockArg::LockSharedNonblock).map_err(|(_, errno)| errno)
}

/// Outcome of a non-blocking exclusive advisory lock attempt.
pub(crate) enum ExclusiveProbe {
    /// Nobody holds the file; the exclusive lock is ours.
    Acquired(Flock<File>),
    /// The file is in use (held shared by a handle).
    Busy(File),
}

/// Probe whether a shadow file is in use. `EWOULDBLOCK` (`EAGAIN` on
/// Linux) means some handle holds its shared lock.
pub(crate) fn try_lock_exclusive(file: File) -> Result<ExclusiveProbe, Errno> {
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => Ok(ExclusiveProbe::Acquired(lock)),
        Err((file, Errno::EWOULDBLOCK)) => Ok(ExclusiveProbe::Busy(file)),
        Err((_, errno)) => Err(errno),
    }
}

fn timeval_of(t: SystemTime) -> nix::sys::time::TimeVal {
    let (secs, micros) = match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => (
            i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
            i64::from(d.subsec_micros()),
        ),
        Err(_) => (0, 0),
    };
    nix::sys::time::TimeVal::new(secs, micros)
}

/// Replicate remote mode and timestamps onto a freshly downloaded shadow
/// file. Failures are logged, not fatal: the download itself succeeded.
pub(crate) fn mirror_remote_metadata(
    local: &Path,
    attr: Option<&ObjectAttr>,
    default_mode: Permissions,
) {
    use std::os::unix::fs::PermissionsExt as _;

    let mode = attr.and_then(|a| a.mode).unwrap_or(default_mode);
    if let Err(e) = std::fs::set_permissions(local, std::fs::Permissions::from_mode(mode.mode())) {
        warn!(path = ?local, error = %e, "failed to set mode on downloaded file");
    }

    // The time update must come last: chmod bumps the change time, and the
    // staleness check reads it.
    if let Some(attr) = attr {
        if let Err(e) = nix::sys::stat::utimes(local, &timeval_of(attr.atime), &timeval_of(attr.mtime))
        {
            warn!(path = ?local, error = %e, "failed to replicate times on downloaded file");
        }
    }
}

/// Recursively invalidate a shadow directory: every regular file is purged
/// through the policy, every directory is removed once emptied.
///
/// The walk runs off the foreground path, so each file's purge happens
/// under that file's path lock: this is a requested deletion (like
/// `delete_file`), and it must serialise against any open or flush in
/// flight on the same logical path.
pub(crate) async fn invalidate_tree(
    local_root: &Path,
    policy: &dyn CachePolicy,
    locks: &PathLocks,
    tmp_root: &Path,
) {
    match tokio::fs::metadata(local_root).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = ?local_root, "nothing to invalidate locally");
            return;
        }
        Err(e) => {
            debug!(path = ?local_root, error = %e, "stat failed during invalidation");
            return;
        }
    }

    let mut pending = vec![local_root.to_path_buf()];
    let mut dirs = vec![local_root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(path = ?dir, error = %e, "read_dir failed during invalidation");
                continue;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            match entry.file_type().await {
                Ok(ft) if ft.is_dir() => {
                    pending.push(path.clone());
                    dirs.push(path);
                }
                Ok(_) => {
                    let logical = logical_of(tmp_root, &path);
                    let _guard = locks.lock(&logical).await;
                    policy.purge(&path).await;
                }
                Err(e) => debug!(path = ?path, error = %e, "file_type failed during invalidation"),
            }
        }
    }

    // Children first, then their parents.
    for dir in dirs.iter().rev() {
        let _ = tokio::fs::remove_dir(dir).await;
    }
}

/// Whether the directory at `path` has no entries. Any error reading it
/// counts as non-empty.
pub(crate) async fn dir_is_empty(path: &Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}

/// Remove every entry under the temp root, leaving the root directory
/// itself in place. Symlinks are removed as links, never followed.
pub(crate) async fn clear_shadow_root(root: &Path) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        match entry.file_type().await {
            Ok(ft) if ft.is_dir() => tokio::fs::remove_dir_all(entry.path()).await?,
            _ => tokio::fs::remove_file(entry.path()).await?,
        }
    }
    Ok(())
}

/// Percentage of the filesystem holding `path` that is in use.
pub(crate) fn disk_usage_percent(path: &Path) -> Option<f64> {
    let stat = nix::sys::statvfs::statvfs(path).ok()?;
    #[expect(
        clippy::cast_precision_loss,
        reason = "block counts far below 2^52 on any real filesystem"
    )]
    let (total, available) = (stat.blocks() as f64, stat.blocks_available() as f64);
    if total <= 0.0 {
        return None;
    }
    Some((total - available) / total * 100.0)
}

/// Total size in bytes of the regular files under `path`.
pub(crate) async fn dir_size_bytes(path: &Path) -> u64 {
    let mut total = 0u64;
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            match entry.metadata().await {
                Ok(meta) if meta.is_dir() => pending.push(entry.path()),
                Ok(meta) => total += meta.len(),
                Err(_) => {}
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_path_strips_leading_slash() {
        let tmp = Path::new("/tmp/cache");
        assert_eq!(local_path(tmp, "/a/b.txt"), PathBuf::from("/tmp/cache/a/b.txt"));
        assert_eq!(local_path(tmp, "a/b.txt"), PathBuf::from("/tmp/cache/a/b.txt"));
    }

    #[test]
    fn local_path_cleans_dot_components() {
        let tmp = Path::new("/tmp/cache");
        assert_eq!(
            local_path(tmp, "/a/./b/../c.txt"),
            PathBuf::from("/tmp/cache/a/c.txt")
        );
    }

    #[test]
    fn logical_of_inverts_local_path() {
        let tmp = Path::new("/tmp/cache");
        let local = local_path(tmp, "/dir/file");
        assert_eq!(logical_of(tmp, &local), "dir/file");
    }

    #[test]
    fn join_logical_handles_root_and_nested_dirs() {
        assert_eq!(join_logical("", "a.txt"), "a.txt");
        assert_eq!(join_logical("/", "a.txt"), "/a.txt");
        assert_eq!(join_logical("/dir", "a.txt"), "/dir/a.txt");
        assert_eq!(join_logical("dir/sub/", "a.txt"), "dir/sub/a.txt");
    }

    #[test]
    fn exclusive_probe_reports_contention() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("probe");
        std::fs::write(&path, b"x").unwrap();

        let shared = lock_shared(File::open(&path).unwrap()).unwrap();
        let probe = try_lock_exclusive(File::open(&path).unwrap()).unwrap();
        assert!(
            matches!(probe, ExclusiveProbe::Busy(_)),
            "shared holder must make the exclusive probe fail"
        );

        drop(shared);
        let probe = try_lock_exclusive(File::open(&path).unwrap()).unwrap();
        assert!(matches!(probe, ExclusiveProbe::Acquired(_)));
    }
}
