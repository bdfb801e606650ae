//! `LocalTree` — a filesystem-backed cache of materialized files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::error::{TreeError, TreeResult};
use crate::file::{File, FileMeta};
use crate::tree::Tree;

/// Convert a host I/O error into the closest capability error, the same
/// mapping shape as the teacher's `shadow_fs::map_io_error`.
fn map_io_error(path: &str, err: std::io::Error) -> TreeError {
    match err.kind() {
        std::io::ErrorKind::NotFound => TreeError::NotFound(path.to_string()),
        std::io::ErrorKind::AlreadyExists => TreeError::AlreadyExists(path.to_string()),
        std::io::ErrorKind::PermissionDenied => TreeError::PermissionDenied(path.to_string()),
        _ => TreeError::Io(err),
    }
}

fn to_millis(t: std::time::SystemTime) -> i64 {
    t.duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

async fn meta_from_disk(root: &Path, virtual_path: &str) -> TreeResult<FileMeta> {
    let host_path = host_path(root, virtual_path);
    let metadata =
        fs::metadata(&host_path).await.map_err(|e| map_io_error(virtual_path, e))?;
    Ok(FileMeta {
        path: virtual_path.to_string(),
        is_file: metadata.is_file(),
        is_directory: metadata.is_dir(),
        is_read_only: metadata.permissions().readonly(),
        size: metadata.len(),
        allocation_size: metadata.len(),
        last_modified: metadata.modified().map(to_millis).unwrap_or(0),
        last_changed: metadata.modified().map(to_millis).unwrap_or(0),
        created: metadata.created().map(to_millis).unwrap_or(0),
        last_accessed: metadata.accessed().map(to_millis).unwrap_or(0),
    })
}

fn host_path(root: &Path, virtual_path: &str) -> PathBuf {
    root.join(virtual_path.trim_start_matches('/'))
}

/// A filesystem wrapper rooted at `local.path`.
pub struct LocalTree {
    root: PathBuf,
}

impl LocalTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_path(&self, virtual_path: &str) -> PathBuf {
        host_path(&self.root, virtual_path)
    }
}

#[async_trait]
impl Tree for LocalTree {
    async fn exists(&self, path: &str) -> bool {
        fs::metadata(self.host_path(path)).await.is_ok()
    }

    async fn open(&self, path: &str) -> TreeResult<Box<dyn File>> {
        let meta = meta_from_disk(&self.root, path).await?;
        let handle = fs::OpenOptions::new()
            .read(true)
            .write(!meta.is_read_only)
            .open(self.host_path(path))
            .await
            .map_err(|e| map_io_error(path, e))?;
        Ok(Box::new(LocalFile { root: self.root.clone(), handle, meta }))
    }

    async fn list(&self, dir: &str) -> TreeResult<Vec<Box<dyn File>>> {
        let host_dir = self.host_path(dir);
        let mut read_dir =
            fs::read_dir(&host_dir).await.map_err(|e| map_io_error(dir, e))?;
        let mut out = Vec::new();
        while let Some(entry) =
            read_dir.next_entry().await.map_err(|e| map_io_error(dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let virtual_path = crate::path::join(dir, &name);
            let meta = meta_from_disk(&self.root, &virtual_path).await?;
            let handle = fs::OpenOptions::new()
                .read(true)
                .open(&self.host_path(&virtual_path))
                .await
                .map_err(|e| map_io_error(&virtual_path, e))?;
            out.push(Box::new(LocalFile { root: self.root.clone(), handle, meta }) as Box<dyn File>);
        }
        Ok(out)
    }

    async fn create_file(&self, path: &str) -> TreeResult<()> {
        let host_path = self.host_path(path);
        if let Some(parent) = host_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| map_io_error(path, e))?;
        }
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&host_path)
            .await
            .map_err(|e| map_io_error(path, e))?;
        Ok(())
    }

    async fn create_directory(&self, path: &str) -> TreeResult<()> {
        fs::create_dir(self.host_path(path)).await.map_err(|e| map_io_error(path, e))
    }

    async fn delete(&self, path: &str) -> TreeResult<()> {
        fs::remove_file(self.host_path(path)).await.map_err(|e| map_io_error(path, e))
    }

    async fn delete_directory(&self, path: &str) -> TreeResult<()> {
        fs::remove_dir(self.host_path(path)).await.map_err(|e| map_io_error(path, e))
    }

    async fn rename(&self, old: &str, new: &str) -> TreeResult<()> {
        let new_host = self.host_path(new);
        if let Some(parent) = new_host.parent() {
            fs::create_dir_all(parent).await.map_err(|e| map_io_error(new, e))?;
        }
        fs::rename(self.host_path(old), new_host).await.map_err(|e| map_io_error(old, e))
    }

    async fn disconnect(&self) -> TreeResult<()> {
        Ok(())
    }
}

impl LocalTree {
    /// Recursively remove `path` and everything under it, used when an
    /// orphaned directory is found safe to drop in its entirety.
    pub async fn remove_subtree(&self, path: &str) -> TreeResult<()> {
        match fs::remove_dir_all(self.host_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io_error(path, e)),
        }
    }
}

/// An open handle into the local cache.
pub struct LocalFile {
    root: PathBuf,
    handle: fs::File,
    meta: FileMeta,
}

#[async_trait]
impl File for LocalFile {
    fn meta(&self) -> &FileMeta {
        &self.meta
    }

    async fn read(&mut self, buf: &mut [u8], pos: u64) -> TreeResult<usize> {
        self.handle
            .seek(SeekFrom::Start(pos))
            .await
            .map_err(|e| map_io_error(&self.meta.path, e))?;
        self.handle.read(buf).await.map_err(|e| map_io_error(&self.meta.path, e))
    }

    async fn write(&mut self, buf: &[u8], pos: u64) -> TreeResult<usize> {
        self.handle
            .seek(SeekFrom::Start(pos))
            .await
            .map_err(|e| map_io_error(&self.meta.path, e))?;
        let written =
            self.handle.write(buf).await.map_err(|e| map_io_error(&self.meta.path, e))?;
        self.meta.size = self.meta.size.max(pos + written as u64);
        self.meta.allocation_size = self.meta.size;
        self.meta.last_modified = to_millis(std::time::SystemTime::now());
        self.meta.last_changed = self.meta.last_modified;
        Ok(written)
    }

    async fn set_length(&mut self, len: u64) -> TreeResult<()> {
        self.handle.set_len(len).await.map_err(|e| map_io_error(&self.meta.path, e))?;
        self.meta.size = len;
        self.meta.allocation_size = len;
        self.meta.last_modified = to_millis(std::time::SystemTime::now());
        self.meta.last_changed = self.meta.last_modified;
        Ok(())
    }

    async fn delete(&mut self) -> TreeResult<()> {
        fs::remove_file(host_path(&self.root, &self.meta.path))
            .await
            .map_err(|e| map_io_error(&self.meta.path, e))
    }

    async fn flush(&mut self) -> TreeResult<()> {
        self.handle.flush().await.map_err(|e| map_io_error(&self.meta.path, e))
    }

    async fn close(mut self: Box<Self>) -> TreeResult<()> {
        self.handle.flush().await.map_err(|e| map_io_error(&self.meta.path, e))
    }

    async fn set_last_modified(&mut self, ms: i64) -> TreeResult<()> {
        let host_path = host_path(&self.root, &self.meta.path);
        let time = filetime::FileTime::from_unix_time(ms / 1000, ((ms % 1000) * 1_000_000) as u32);
        let path = host_path.clone();
        tokio::task::spawn_blocking(move || filetime::set_file_mtime(&path, time))
            .await
            .map_err(|e| TreeError::Io(std::io::Error::other(e)))?
            .map_err(|e| map_io_error(&self.meta.path, e))?;
        self.meta.last_modified = ms;
        self.meta.last_changed = ms;
        Ok(())
    }
}
