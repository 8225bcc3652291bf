//! The operation contract implemented by every pipeline layer.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::fs::attr::{ObjectAttr, OpenFlags, Permissions};
use crate::fs::error::FsError;
use crate::fs::handle::Handle;

/// One link of the gateway pipeline.
///
/// Paths are logical (mount-rooted, forward-slash separated). Operations
/// taking a [`Handle`] expect one previously returned by this layer's
/// `create_file`/`open_file`. All methods take `&self`: a layer is shared
/// by every in-flight filesystem call.
#[async_trait]
pub trait FsLayer: Send + Sync {
    /// Identifies the layer in logs.
    fn name(&self) -> &'static str;

    // -- Directory operations --

    /// Delete a directory tree.
    async fn delete_dir(&self, name: &str) -> Result<(), FsError>;

    /// Rename a directory. The front-end guarantees `dst` is empty or
    /// absent.
    async fn rename_dir(&self, src: &str, dst: &str) -> Result<(), FsError>;

    /// List the children of a directory.
    async fn read_dir(&self, name: &str) -> Result<Vec<ObjectAttr>, FsError>;

    /// List one page of a directory. An empty returned token marks the
    /// final page.
    async fn stream_dir(
        &self,
        name: &str,
        token: &str,
    ) -> Result<(Vec<ObjectAttr>, String), FsError>;

    /// Whether the directory has no children.
    async fn is_dir_empty(&self, name: &str) -> bool;

    // -- File operations --

    /// Create a file and open it for read/write.
    async fn create_file(&self, name: &str, mode: Permissions) -> Result<Arc<Handle>, FsError>;

    /// Open an existing file.
    async fn open_file(
        &self,
        name: &str,
        flags: OpenFlags,
        mode: Permissions,
    ) -> Result<Arc<Handle>, FsError>;

    /// Close a handle, flushing pending writes first.
    async fn close_file(&self, handle: &Handle) -> Result<(), FsError>;

    /// Read the whole file behind the handle.
    async fn read_file(&self, handle: &Handle) -> Result<Bytes, FsError>;

    /// Read into `buf` at `offset`; returns the byte count.
    async fn read_in_buffer(
        &self,
        handle: &Handle,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, FsError>;

    /// Write `data` at `offset`; returns the byte count.
    async fn write_file(
        &self,
        handle: &Handle,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, FsError>;

    /// Push pending writes to the authoritative store.
    async fn flush_file(&self, handle: &Handle) -> Result<(), FsError>;

    /// Make the file durable in the authoritative store.
    async fn sync_file(&self, handle: &Handle) -> Result<(), FsError>;

    /// Delete a file.
    async fn delete_file(&self, name: &str) -> Result<(), FsError>;

    /// Rename a file, replacing `dst` if it exists.
    async fn rename_file(&self, src: &str, dst: &str) -> Result<(), FsError>;

    /// Set the file size.
    async fn truncate_file(&self, name: &str, size: u64) -> Result<(), FsError>;

    /// Set permission bits.
    async fn chmod(&self, name: &str, mode: Permissions) -> Result<(), FsError>;

    /// Set owner and group.
    async fn chown(&self, name: &str, owner: u32, group: u32) -> Result<(), FsError>;

    /// Attributes of a single path.
    async fn get_attr(&self, name: &str) -> Result<ObjectAttr, FsError>;

    // -- Bulk transfers (served by the remote client) --

    /// Download `count` bytes of the object at `offset` into `file`. A
    /// `count` of zero downloads the whole object.
    async fn copy_to_file(
        &self,
        name: &str,
        offset: u64,
        count: u64,
        file: &mut tokio::fs::File,
    ) -> Result<(), FsError>;

    /// Upload the contents of `file` as the whole object.
    async fn copy_from_file(
        &self,
        name: &str,
        file: &mut tokio::fs::File,
    ) -> Result<(), FsError>;
}
