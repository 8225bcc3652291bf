#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

use blob_fs::cache::{FileCache, FileCacheOptions};
use blob_fs::fs::{EntryKind, FsError, FsLayer, Handle, ObjectAttr, OpenFlags, Permissions};

/// One object in the mock store.
#[derive(Debug, Clone)]
pub struct MockObject {
    pub data: Vec<u8>,
    pub mode: Option<Permissions>,
    pub atime: SystemTime,
    pub mtime: SystemTime,
}

impl MockObject {
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            mode: Some(Permissions::from_mode(0o644)),
            atime: SystemTime::now(),
            mtime: SystemTime::now(),
        }
    }

    pub fn with_mode(mut self, mode: Option<Permissions>) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_times(mut self, atime: SystemTime, mtime: SystemTime) -> Self {
        self.atime = atime;
        self.mtime = mtime;
        self
    }
}

/// A failure a test can inject for one mock method.
#[derive(Debug, Clone, Copy)]
pub enum MockFailure {
    NotFound,
    Errno(i32),
}

impl MockFailure {
    fn to_error(self) -> FsError {
        match self {
            Self::NotFound => FsError::NotFound,
            Self::Errno(errno) => FsError::Io(std::io::Error::from_raw_os_error(errno)),
        }
    }
}

#[derive(Default)]
struct MockState {
    objects: Mutex<HashMap<String, MockObject>>,
    failures: Mutex<HashMap<&'static str, MockFailure>>,
    delays: Mutex<HashMap<&'static str, Duration>>,
    chmod_calls: Mutex<Vec<(String, Permissions)>>,
    next_handle_id: AtomicU64,
    create_file_count: AtomicU64,
    get_attr_count: AtomicU64,
    copy_to_count: AtomicU64,
    copy_from_count: AtomicU64,
    delete_file_count: AtomicU64,
    rename_file_count: AtomicU64,
    sync_count: AtomicU64,
    delete_dir_count: AtomicU64,
    rename_dir_count: AtomicU64,
}

/// In-memory stand-in for the remote object-store client.
///
/// Behaves like a real store (missing objects report not-found, uploads
/// create objects) and records calls so tests can assert on the remote
/// traffic. Clones share state.
#[derive(Clone, Default)]
pub struct MockRemote {
    state: Arc<MockState>,
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((parent, _)) => parent,
        None => "",
    }
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_object(&self, path: &str, object: MockObject) {
        self.state
            .objects
            .lock()
            .unwrap()
            .insert(path.to_owned(), object);
    }

    pub fn object(&self, path: &str) -> Option<MockObject> {
        self.state.objects.lock().unwrap().get(path).cloned()
    }

    /// Make `method` fail with `failure` until the injection is cleared.
    pub fn fail(&self, method: &'static str, failure: MockFailure) {
        self.state.failures.lock().unwrap().insert(method, failure);
    }

    pub fn clear_failure(&self, method: &'static str) {
        self.state.failures.lock().unwrap().remove(method);
    }

    fn injected(&self, method: &'static str) -> Result<(), FsError> {
        match self.state.failures.lock().unwrap().get(method) {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }

    /// Make `method` sleep before acting, to widen race windows.
    pub fn set_delay(&self, method: &'static str, delay: Duration) {
        self.state.delays.lock().unwrap().insert(method, delay);
    }

    async fn delay_for(&self, method: &'static str) {
        let delay = self.state.delays.lock().unwrap().get(method).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn attr_of(&self, path: &str, object: &MockObject) -> ObjectAttr {
        ObjectAttr {
            path: path.to_owned(),
            name: path.rsplit('/').next().unwrap_or(path).to_owned(),
            size: object.data.len() as u64,
            mode: object.mode,
            atime: object.atime,
            mtime: object.mtime,
            ctime: object.mtime,
            kind: EntryKind::File,
        }
    }

    fn children_of(&self, name: &str) -> Vec<ObjectAttr> {
        let objects = self.state.objects.lock().unwrap();
        let mut attrs: Vec<ObjectAttr> = objects
            .iter()
            .filter(|(path, _)| parent_of(path) == name)
            .map(|(path, object)| self.attr_of(path, object))
            .collect();
        attrs.sort_by(|a, b| a.path.cmp(&b.path));
        attrs
    }

    pub fn chmod_calls(&self) -> Vec<(String, Permissions)> {
        self.state.chmod_calls.lock().unwrap().clone()
    }

    pub fn create_file_count(&self) -> u64 {
        self.state.create_file_count.load(Ordering::Relaxed)
    }
    pub fn get_attr_count(&self) -> u64 {
        self.state.get_attr_count.load(Ordering::Relaxed)
    }
    pub fn copy_to_count(&self) -> u64 {
        self.state.copy_to_count.load(Ordering::Relaxed)
    }
    pub fn copy_from_count(&self) -> u64 {
        self.state.copy_from_count.load(Ordering::Relaxed)
    }
    pub fn delete_file_count(&self) -> u64 {
        self.state.delete_file_count.load(Ordering::Relaxed)
    }
    pub fn rename_file_count(&self) -> u64 {
        self.state.rename_file_count.load(Ordering::Relaxed)
    }
    pub fn sync_count(&self) -> u64 {
        self.state.sync_count.load(Ordering::Relaxed)
    }
    pub fn delete_dir_count(&self) -> u64 {
        self.state.delete_dir_count.load(Ordering::Relaxed)
    }
    pub fn rename_dir_count(&self) -> u64 {
        self.state.rename_dir_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FsLayer for MockRemote {
    fn name(&self) -> &'static str {
        "mock_remote"
    }

    async fn delete_dir(&self, name: &str) -> Result<(), FsError> {
        self.state.delete_dir_count.fetch_add(1, Ordering::Relaxed);
        self.injected("delete_dir")?;
        let prefix = format!("{}/", name.trim_end_matches('/'));
        self.state
            .objects
            .lock()
            .unwrap()
            .retain(|path, _| !path.starts_with(&prefix));
        Ok(())
    }

    async fn rename_dir(&self, src: &str, dst: &str) -> Result<(), FsError> {
        self.state.rename_dir_count.fetch_add(1, Ordering::Relaxed);
        self.injected("rename_dir")?;
        let src_prefix = format!("{}/", src.trim_end_matches('/'));
        let dst_prefix = format!("{}/", dst.trim_end_matches('/'));
        let mut objects = self.state.objects.lock().unwrap();
        let moved: Vec<(String, MockObject)> = objects
            .iter()
            .filter(|(path, _)| path.starts_with(&src_prefix))
            .map(|(path, object)| {
                (
                    format!("{dst_prefix}{}", &path[src_prefix.len()..]),
                    object.clone(),
                )
            })
            .collect();
        objects.retain(|path, _| !path.starts_with(&src_prefix));
        objects.extend(moved);
        Ok(())
    }

    async fn read_dir(&self, name: &str) -> Result<Vec<ObjectAttr>, FsError> {
        self.injected("read_dir")?;
        Ok(self.children_of(name))
    }

    async fn stream_dir(
        &self,
        name: &str,
        _token: &str,
    ) -> Result<(Vec<ObjectAttr>, String), FsError> {
        self.injected("stream_dir")?;
        Ok((self.children_of(name), String::new()))
    }

    async fn is_dir_empty(&self, name: &str) -> bool {
        self.children_of(name).is_empty()
    }

    async fn create_file(&self, name: &str, mode: Permissions) -> Result<Arc<Handle>, FsError> {
        self.state.create_file_count.fetch_add(1, Ordering::Relaxed);
        self.injected("create_file")?;
        self.insert_object(name, MockObject::new(b"").with_mode(Some(mode)));
        Ok(Arc::new(Handle::new(
            self.state.next_handle_id.fetch_add(1, Ordering::Relaxed),
            name,
        )))
    }

    async fn open_file(
        &self,
        name: &str,
        _flags: OpenFlags,
        _mode: Permissions,
    ) -> Result<Arc<Handle>, FsError> {
        self.injected("open_file")?;
        if self.object(name).is_none() {
            return Err(FsError::NotFound);
        }
        Ok(Arc::new(Handle::new(
            self.state.next_handle_id.fetch_add(1, Ordering::Relaxed),
            name,
        )))
    }

    async fn close_file(&self, _handle: &Handle) -> Result<(), FsError> {
        Ok(())
    }

    async fn read_file(&self, handle: &Handle) -> Result<Bytes, FsError> {
        self.object(handle.path())
            .map(|object| Bytes::from(object.data))
            .ok_or(FsError::NotFound)
    }

    async fn read_in_buffer(
        &self,
        _handle: &Handle,
        _offset: u64,
        _buf: &mut [u8],
    ) -> Result<usize, FsError> {
        Err(FsError::Unrecoverable("not served by the mock store"))
    }

    async fn write_file(
        &self,
        _handle: &Handle,
        _offset: u64,
        _data: &[u8],
    ) -> Result<usize, FsError> {
        Err(FsError::Unrecoverable("not served by the mock store"))
    }

    async fn flush_file(&self, _handle: &Handle) -> Result<(), FsError> {
        Ok(())
    }

    async fn sync_file(&self, _handle: &Handle) -> Result<(), FsError> {
        self.state.sync_count.fetch_add(1, Ordering::Relaxed);
        self.injected("sync_file")?;
        Ok(())
    }

    async fn delete_file(&self, name: &str) -> Result<(), FsError> {
        self.state.delete_file_count.fetch_add(1, Ordering::Relaxed);
        self.injected("delete_file")?;
        self.state
            .objects
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or(FsError::NotFound)
    }

    async fn rename_file(&self, src: &str, dst: &str) -> Result<(), FsError> {
        self.state.rename_file_count.fetch_add(1, Ordering::Relaxed);
        self.injected("rename_file")?;
        let mut objects = self.state.objects.lock().unwrap();
        let object = objects.remove(src).ok_or(FsError::NotFound)?;
        objects.insert(dst.to_owned(), object);
        Ok(())
    }

    async fn truncate_file(&self, name: &str, size: u64) -> Result<(), FsError> {
        self.injected("truncate_file")?;
        let mut objects = self.state.objects.lock().unwrap();
        let object = objects.get_mut(name).ok_or(FsError::NotFound)?;
        object.data.resize(usize::try_from(size).unwrap(), 0);
        Ok(())
    }

    async fn chmod(&self, name: &str, mode: Permissions) -> Result<(), FsError> {
        self.state
            .chmod_calls
            .lock()
            .unwrap()
            .push((name.to_owned(), mode));
        self.injected("chmod")?;
        let mut objects = self.state.objects.lock().unwrap();
        let object = objects.get_mut(name).ok_or(FsError::NotFound)?;
        object.mode = Some(mode);
        Ok(())
    }

    async fn chown(&self, name: &str, _owner: u32, _group: u32) -> Result<(), FsError> {
        self.injected("chown")?;
        if self.state.objects.lock().unwrap().contains_key(name) {
            Ok(())
        } else {
            Err(FsError::NotFound)
        }
    }

    async fn get_attr(&self, name: &str) -> Result<ObjectAttr, FsError> {
        self.state.get_attr_count.fetch_add(1, Ordering::Relaxed);
        self.injected("get_attr")?;
        self.object(name)
            .map(|object| self.attr_of(name, &object))
            .ok_or(FsError::NotFound)
    }

    async fn copy_to_file(
        &self,
        name: &str,
        offset: u64,
        count: u64,
        file: &mut tokio::fs::File,
    ) -> Result<(), FsError> {
        self.state.copy_to_count.fetch_add(1, Ordering::Relaxed);
        self.injected("copy_to_file")?;
        let object = self.object(name).ok_or(FsError::NotFound)?;
        let start = usize::try_from(offset).unwrap().min(object.data.len());
        let end = if count == 0 {
            object.data.len()
        } else {
            start
                .saturating_add(usize::try_from(count).unwrap())
                .min(object.data.len())
        };
        file.write_all(&object.data[start..end]).await?;
        file.flush().await?;
        Ok(())
    }

    async fn copy_from_file(
        &self,
        name: &str,
        file: &mut tokio::fs::File,
    ) -> Result<(), FsError> {
        self.state.copy_from_count.fetch_add(1, Ordering::Relaxed);
        self.delay_for("copy_from_file").await;
        self.injected("copy_from_file")?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).await?;
        let mut objects = self.state.objects.lock().unwrap();
        match objects.get_mut(name) {
            Some(object) => {
                object.data = data;
                object.mtime = SystemTime::now();
            }
            None => {
                objects.insert(name.to_owned(), MockObject::new(&data));
            }
        }
        Ok(())
    }
}

/// A cache wired to a mock remote inside a fresh temp directory.
pub struct TestCache {
    pub cache: FileCache<MockRemote>,
    pub remote: MockRemote,
    pub tmp: tempfile::TempDir,
}

impl TestCache {
    /// The shadow path the cache uses for `name`.
    pub fn shadow_path(&self, name: &str) -> std::path::PathBuf {
        self.cache.shadow_path(name)
    }
}

/// Build a cache with a mock remote. `configure` tweaks the default
/// options (cache under a fresh temp dir, 2-minute timeout so nothing
/// expires mid-test).
pub async fn new_cache(configure: impl FnOnce(&mut FileCacheOptions)) -> TestCache {
    let tmp = tempfile::tempdir().unwrap();
    let mut options = FileCacheOptions {
        path: tmp.path().join("cache"),
        timeout_sec: 120,
        // Keep host disk pressure from triggering forced eviction unless a
        // test opts in with its own thresholds.
        high_threshold: 100,
        ..FileCacheOptions::default()
    };
    configure(&mut options);

    let remote = MockRemote::new();
    let cache = FileCache::new(options, Path::new("/mnt/blob"), false, remote.clone())
        .await
        .unwrap();
    TestCache { cache, remote, tmp }
}

/// Poll `cond` until it holds, or panic after one second.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Same, but with a caller-chosen deadline.
pub async fn wait_until_for(what: &str, deadline: Duration, mut cond: impl FnMut() -> bool) {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}
