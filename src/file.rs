//! The abstract `File` capability.

use async_trait::async_trait;

use crate::error::TreeResult;

/// Attributes of a file or directory as seen through a `Tree`. Timestamps
/// are milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub path: String,
    pub is_file: bool,
    pub is_directory: bool,
    pub is_read_only: bool,
    pub size: u64,
    pub allocation_size: u64,
    pub last_modified: i64,
    pub last_changed: i64,
    pub created: i64,
    pub last_accessed: i64,
}

impl FileMeta {
    /// A zero-length regular file's metadata, stamped with `now` for every
    /// timestamp field. Used by trees when they create a file and need to
    /// hand back metadata before a round-trip stat.
    pub fn new_file(path: impl Into<String>, now: i64) -> Self {
        Self {
            path: path.into(),
            is_file: true,
            is_directory: false,
            is_read_only: false,
            size: 0,
            allocation_size: 0,
            last_modified: now,
            last_changed: now,
            created: now,
            last_accessed: now,
        }
    }
}

/// A handle to an open file or directory entry.
///
/// Implementations are a sum of variants implementing a single capability
/// contract rather than an inheritance hierarchy: `LocalFile`, `RemoteFile`,
/// `WorkFile` and `RqFile` are all distinct types behind this one trait
/// object.
#[async_trait]
pub trait File: Send + Sync {
    /// The attributes captured when this handle was opened (or last
    /// refreshed). Does not perform I/O.
    fn meta(&self) -> &FileMeta;

    /// Read up to `buf.len()` bytes starting at `pos`, returning the
    /// number of bytes read (`0` at or past EOF).
    async fn read(&mut self, buf: &mut [u8], pos: u64) -> TreeResult<usize>;

    /// Write `buf` at `pos`, returning the number of bytes written.
    async fn write(&mut self, buf: &[u8], pos: u64) -> TreeResult<usize>;

    /// Truncate or extend the file to exactly `len` bytes.
    async fn set_length(&mut self, len: u64) -> TreeResult<()>;

    /// Remove the file this handle refers to.
    async fn delete(&mut self) -> TreeResult<()>;

    /// Flush any buffered writes to the backing store.
    async fn flush(&mut self) -> TreeResult<()>;

    /// Finalize and release the handle.
    async fn close(self: Box<Self>) -> TreeResult<()>;

    /// Set the last-modified timestamp, where the underlying store
    /// supports it. The default rejects the operation.
    async fn set_last_modified(&mut self, _ms: i64) -> TreeResult<()> {
        Err(crate::error::TreeError::NotSupported)
    }
}
