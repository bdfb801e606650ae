//! `WorkTree` — the metadata store backing the caching protocol: one
//! sync marker per cached file recording when it was last synced with the
//! remote, and one creation marker per file created locally but not yet
//! confirmed on the remote.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{TreeError, TreeResult};
use crate::file::{File, FileMeta};
use crate::tree::Tree;

/// Body of a sync marker: the remote `last_modified` timestamp observed
/// the moment the local copy was last pulled in sync with it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct SyncMarker {
    synced_at: i64,
}

/// Body of a creation marker: when the file was created locally, kept so
/// the safe-delete predicate can tell a "never synced" file apart from an
/// ordinary cache entry (encoding decision recorded in DESIGN.md).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct CreationMarker {
    created: i64,
}

fn host_path(root: &std::path::Path, marker_path: &str) -> PathBuf {
    root.join(marker_path.trim_start_matches('/'))
}

fn map_io_error(path: &str, err: std::io::Error) -> TreeError {
    match err.kind() {
        std::io::ErrorKind::NotFound => TreeError::NotFound(path.to_string()),
        std::io::ErrorKind::AlreadyExists => TreeError::AlreadyExists(path.to_string()),
        std::io::ErrorKind::PermissionDenied => TreeError::PermissionDenied(path.to_string()),
        _ => TreeError::Io(err),
    }
}

/// A filesystem-backed store of per-path marker files, rooted at
/// `work.path`.
pub struct WorkTree {
    root: PathBuf,
}

impl WorkTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn sync_marker_path(&self, virtual_path: &str) -> PathBuf {
        host_path(&self.root, virtual_path)
    }

    fn creation_marker_path(&self, virtual_path: &str) -> PathBuf {
        host_path(&self.root, &crate::path::create_marker_name(virtual_path))
    }

    /// The remote timestamp this path was last known to be in sync with,
    /// if a sync marker exists.
    pub async fn read_sync_marker(&self, path: &str) -> TreeResult<Option<i64>> {
        match fs::read(self.sync_marker_path(path)).await {
            Ok(bytes) => {
                let marker: SyncMarker = serde_json::from_slice(&bytes)
                    .map_err(|e| TreeError::InvalidPath(format!("corrupt sync marker: {e}")))?;
                Ok(Some(marker.synced_at))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io_error(path, e)),
        }
    }

    /// Write (creating or overwriting) the sync marker for `path`, stamping
    /// it with the remote's `last_modified` at the moment the local copy
    /// was pulled into agreement with it.
    pub async fn write_sync_marker(&self, path: &str, synced_at: i64) -> TreeResult<()> {
        let marker_path = self.sync_marker_path(path);
        if let Some(parent) = marker_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| map_io_error(path, e))?;
        }
        let body = serde_json::to_vec(&SyncMarker { synced_at })
            .map_err(|e| TreeError::InvalidPath(format!("marker encode failed: {e}")))?;
        fs::write(marker_path, body).await.map_err(|e| map_io_error(path, e))
    }

    /// Remove the sync marker for `path`, if any.
    pub async fn remove_sync_marker(&self, path: &str) -> TreeResult<()> {
        match fs::remove_file(self.sync_marker_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io_error(path, e)),
        }
    }

    /// Whether `path` was created locally and has not yet been confirmed
    /// present on the remote.
    pub async fn creation_marker_exists(&self, path: &str) -> bool {
        fs::metadata(self.creation_marker_path(path)).await.is_ok()
    }

    /// Stamp `path` as locally created at `created_at`.
    pub async fn create_creation_marker(&self, path: &str, created_at: i64) -> TreeResult<()> {
        let marker_path = self.creation_marker_path(path);
        if let Some(parent) = marker_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| map_io_error(path, e))?;
        }
        let body = serde_json::to_vec(&CreationMarker { created: created_at })
            .map_err(|e| TreeError::InvalidPath(format!("marker encode failed: {e}")))?;
        fs::write(marker_path, body).await.map_err(|e| map_io_error(path, e))
    }

    /// Clear the creation marker for `path` once the remote confirms it.
    pub async fn remove_creation_marker(&self, path: &str) -> TreeResult<()> {
        match fs::remove_file(self.creation_marker_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io_error(path, e)),
        }
    }

    /// Remove both markers for `path`, used when a file is deleted
    /// outright rather than renamed.
    pub async fn remove_markers(&self, path: &str) -> TreeResult<()> {
        self.remove_sync_marker(path).await?;
        self.remove_creation_marker(path).await
    }

    /// Move both markers from `old` to `new`, used on rename.
    pub async fn rename_markers(&self, old: &str, new: &str) -> TreeResult<()> {
        if let Some(synced_at) = self.read_sync_marker(old).await? {
            self.write_sync_marker(new, synced_at).await?;
            self.remove_sync_marker(old).await?;
        }
        if self.creation_marker_exists(old).await {
            let created = match fs::read(self.creation_marker_path(old)).await {
                Ok(bytes) => serde_json::from_slice::<CreationMarker>(&bytes)
                    .map(|m| m.created)
                    .unwrap_or(0),
                Err(_) => 0,
            };
            self.create_creation_marker(new, created).await?;
            self.remove_creation_marker(old).await?;
        }
        Ok(())
    }

    /// Recursively remove every marker under `path`, used when a
    /// directory is deleted outright.
    pub async fn remove_subtree(&self, path: &str) -> TreeResult<()> {
        match fs::remove_dir_all(host_path(&self.root, path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io_error(path, e)),
        }
    }
}

#[async_trait]
impl Tree for WorkTree {
    async fn exists(&self, path: &str) -> bool {
        fs::metadata(self.sync_marker_path(path)).await.is_ok()
    }

    async fn open(&self, path: &str) -> TreeResult<Box<dyn File>> {
        let marker_path = self.sync_marker_path(path);
        let mut handle = fs::File::open(&marker_path).await.map_err(|e| map_io_error(path, e))?;
        let metadata = handle.metadata().await.map_err(|e| map_io_error(path, e))?;
        let mut buf = Vec::new();
        handle.read_to_end(&mut buf).await.map_err(|e| map_io_error(path, e))?;
        let meta = FileMeta {
            path: path.to_string(),
            is_file: true,
            is_directory: false,
            is_read_only: false,
            size: metadata.len(),
            allocation_size: metadata.len(),
            last_modified: 0,
            last_changed: 0,
            created: 0,
            last_accessed: 0,
        };
        Ok(Box::new(WorkFile { root: self.root.clone(), meta, buf }))
    }

    async fn list(&self, dir: &str) -> TreeResult<Vec<Box<dyn File>>> {
        let host_dir = host_path(&self.root, dir);
        let mut read_dir = match fs::read_dir(&host_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(map_io_error(dir, e)),
        };
        let mut out = Vec::new();
        while let Some(entry) = read_dir.next_entry().await.map_err(|e| map_io_error(dir, e))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".rqcf") {
                continue;
            }
            let virtual_path = crate::path::join(dir, &name);
            out.push(self.open(&virtual_path).await?);
        }
        Ok(out)
    }

    async fn create_file(&self, path: &str) -> TreeResult<()> {
        self.write_sync_marker(path, 0).await
    }

    async fn create_directory(&self, path: &str) -> TreeResult<()> {
        fs::create_dir_all(host_path(&self.root, path)).await.map_err(|e| map_io_error(path, e))
    }

    async fn delete(&self, path: &str) -> TreeResult<()> {
        self.remove_markers(path).await
    }

    async fn delete_directory(&self, path: &str) -> TreeResult<()> {
        fs::remove_dir(host_path(&self.root, path)).await.map_err(|e| map_io_error(path, e))
    }

    async fn rename(&self, old: &str, new: &str) -> TreeResult<()> {
        self.rename_markers(old, new).await
    }

    async fn disconnect(&self) -> TreeResult<()> {
        Ok(())
    }
}

/// An open handle to a sync marker, exposed through the generic `File`
/// capability for uniformity with the other trees; the RQ layer normally
/// calls the dedicated marker methods on `WorkTree` directly instead.
pub struct WorkFile {
    root: PathBuf,
    meta: FileMeta,
    buf: Vec<u8>,
}

#[async_trait]
impl File for WorkFile {
    fn meta(&self) -> &FileMeta {
        &self.meta
    }

    async fn read(&mut self, buf: &mut [u8], pos: u64) -> TreeResult<usize> {
        let pos = pos as usize;
        if pos >= self.buf.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.buf.len() - pos);
        buf[..n].copy_from_slice(&self.buf[pos..pos + n]);
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8], pos: u64) -> TreeResult<usize> {
        let pos = pos as usize;
        if self.buf.len() < pos + buf.len() {
            self.buf.resize(pos + buf.len(), 0);
        }
        self.buf[pos..pos + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    async fn set_length(&mut self, len: u64) -> TreeResult<()> {
        self.buf.resize(len as usize, 0);
        Ok(())
    }

    async fn delete(&mut self) -> TreeResult<()> {
        fs::remove_file(host_path(&self.root, &self.meta.path))
            .await
            .map_err(|e| map_io_error(&self.meta.path, e))
    }

    async fn flush(&mut self) -> TreeResult<()> {
        fs::write(host_path(&self.root, &self.meta.path), &self.buf)
            .await
            .map_err(|e| map_io_error(&self.meta.path, e))
    }

    async fn close(mut self: Box<Self>) -> TreeResult<()> {
        self.flush().await
    }
}
