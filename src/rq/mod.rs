//! The RQ Tree / RQ File policy layer.
//!
//! `RqShare` is the single reference-counted owner of the three trees,
//! the queue, and the bits of shared mutable state the caching protocol
//! needs (`createdFiles`, per-path download gates): no file owns the
//! tree, every `RqFile` and the `RqTree` hold a cheap clone of the same
//! handle.

pub mod cache;

use std::sync::Arc;

use async_trait::async_trait;
use whirlwind::ShardMap;

use crate::config::Config;
use crate::error::{TreeError, TreeResult};
use crate::events::{EventBus, QueueMethod};
use crate::file::{File, FileMeta};
use crate::queue::{QueueEntry, RequestQueue, SledRequestQueue};
use crate::trees::{LocalTree, RemoteTree, WorkTree};
use crate::tree::Tree;

/// Shared state behind every `RqTree`/`RqFile` clone.
pub(crate) struct RqShareInner {
    pub(crate) local: LocalTree,
    pub(crate) remote: RemoteTree,
    pub(crate) work: WorkTree,
    pub(crate) queue: Arc<dyn RequestQueue>,
    pub(crate) events: EventBus,
    pub(crate) config: Config,
    /// Paths created locally but not yet confirmed present on the remote;
    /// consulted at close time when the work marker can't yet be read.
    created_files: ShardMap<String, ()>,
    /// One entry per path currently being fetched from the remote, used to
    /// serialize concurrent `cacheFile` calls against the same path.
    download_gates: ShardMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Cached remote directory listings, keyed by directory path and
    /// invalidated on any mutation under that directory. Avoids a remote
    /// HTTP list call on every `list()` when nothing under the directory
    /// has changed since the last one.
    content_cache: moka::sync::Cache<String, Arc<Vec<FileMeta>>>,
}

impl RqShareInner {
    async fn download_gate(&self, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        if let Some(gate) = self.download_gates.get(&path.to_string()).await {
            return gate.clone();
        }
        let gate = Arc::new(tokio::sync::Mutex::new(()));
        self.download_gates.insert(path.to_string(), gate.clone()).await;
        gate
    }

    pub(crate) fn invalidate_parent(&self, path: &str) {
        self.content_cache.invalidate(&crate::path::parent(path));
    }

    /// The cached remote listing for `dir`, if a call since the last
    /// invalidation has already populated it.
    pub(crate) fn cached_remote_list(&self, dir: &str) -> Option<Arc<Vec<FileMeta>>> {
        self.content_cache.get(&dir.to_string())
    }

    /// Record a fresh remote listing for `dir`.
    pub(crate) fn cache_remote_list(&self, dir: &str, entries: Arc<Vec<FileMeta>>) {
        self.content_cache.insert(dir.to_string(), entries);
    }

    async fn mark_created(&self, path: &str) {
        self.created_files.insert(path.to_string(), ()).await;
    }

    async fn was_created_here(&self, path: &str) -> bool {
        self.created_files.contains_key(&path.to_string()).await
    }

    async fn clear_created(&self, path: &str) {
        self.created_files.remove(&path.to_string()).await;
    }

    pub(crate) fn now_ms(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// The reference-counted handle a front-end holds: `getShare()`'s result.
#[derive(Clone)]
pub struct RqShare(pub(crate) Arc<RqShareInner>);

impl RqShare {
    /// Build the three trees and the durable queue from `config`.
    pub fn new(config: Config) -> TreeResult<Self> {
        let events = EventBus::new();
        let local = LocalTree::new(&config.local_path);
        let remote = RemoteTree::new(&config.remote_prefix);
        let work = WorkTree::new(&config.work_path);
        let queue_path = std::path::Path::new(&config.work_path).join(".rqqueue");
        let queue: Arc<dyn RequestQueue> =
            Arc::new(SledRequestQueue::open(queue_path, events.clone())?);
        let inner = RqShareInner {
            local,
            remote,
            work,
            queue,
            events,
            config,
            created_files: ShardMap::new(),
            download_gates: ShardMap::new(),
            content_cache: moka::sync::Cache::new(10_000),
        };
        Ok(Self(Arc::new(inner)))
    }

    /// The tree surface handed to the protocol front-end.
    pub fn tree(&self) -> RqTree {
        RqTree(self.0.clone())
    }

    /// The event stream a front-end subscribes to.
    pub fn events(&self) -> EventBus {
        self.0.events.clone()
    }

    pub(crate) fn inner(&self) -> Arc<RqShareInner> {
        self.0.clone()
    }

    /// Stop the processor (if any is attached) and disconnect every
    /// sub-tree, aggregating the first error encountered.
    pub async fn disconnect(&self) -> TreeResult<()> {
        let mut first_err = None;
        for result in [
            self.0.local.disconnect().await,
            self.0.remote.disconnect().await,
            self.0.work.disconnect().await,
        ] {
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// The RQ-layer `Tree` implementation the front-end actually drives.
#[derive(Clone)]
pub struct RqTree(pub(crate) Arc<RqShareInner>);

impl RqTree {
    fn temp_patterns(&self) -> crate::path::TempPatterns {
        self.0.config.temp_patterns()
    }

    fn is_temp(&self, path: &str) -> bool {
        self.temp_patterns().is_temp(path)
    }
}

#[async_trait]
impl Tree for RqTree {
    async fn exists(&self, path: &str) -> bool {
        self.0.local.exists(path).await || self.0.remote.exists(path).await
    }

    async fn open(&self, path: &str) -> TreeResult<Box<dyn File>> {
        let is_temp = self.is_temp(path);
        let local = if self.0.local.exists(path).await {
            Some(self.0.local.open(path).await?)
        } else {
            None
        };
        let meta = match &local {
            Some(handle) => handle.meta().clone(),
            None => self.0.remote.stat(path).await?,
        };
        Ok(Box::new(RqFile {
            path: path.to_string(),
            is_temp,
            share: self.0.clone(),
            local,
            meta,
            cached: false,
            dirty: false,
        }))
    }

    async fn list(&self, dir: &str) -> TreeResult<Vec<Box<dyn File>>> {
        cache::list_with_policy(&self.0, dir).await
    }

    #[tracing::instrument(skip(self))]
    async fn create_file(&self, path: &str) -> TreeResult<()> {
        self.0.local.create_file(path).await?;
        if self.is_temp(path) {
            // Temp paths never get work markers and are never tracked as
            // locally-created: nothing past the local create is needed.
            self.0.invalidate_parent(path);
            return Ok(());
        }
        let now = self.0.now_ms();
        self.0.work.write_sync_marker(path, now).await?;
        self.0.work.create_creation_marker(path, now).await?;
        self.0.mark_created(path).await;
        self.0.invalidate_parent(path);
        tracing::debug!(%path, "created locally, awaiting first close to enqueue");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn create_directory(&self, path: &str) -> TreeResult<()> {
        self.0.local.create_directory(path).await?;
        if let Err(e) = self.0.remote.create_directory(path).await {
            tracing::error!(%path, error = %e, "remote createDirectory failed, synchronous op surfaces to caller");
            return Err(e);
        }
        self.0.invalidate_parent(path);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, path: &str) -> TreeResult<()> {
        let parent = crate::path::parent(path);
        let name = crate::path::leaf(path);
        let local_existed = self.0.local.exists(path).await;

        if self.is_temp(path) {
            // Temp paths are never queued: a local delete is the entire
            // operation.
            if local_existed {
                self.0.local.delete(path).await?;
                self.0.invalidate_parent(path);
                self.0.clear_created(path).await;
            }
            return Ok(());
        }

        if local_existed {
            let had_creation_marker = self.0.work.creation_marker_exists(path).await;
            let had_queue_entry = self.0.queue.exists(&parent, name).await?;
            self.0.local.delete(path).await?;
            self.0.work.remove_markers(path).await?;
            self.0.invalidate_parent(path);
            self.0.clear_created(path).await;
            if had_creation_marker && !had_queue_entry {
                tracing::debug!(%path, "locally-born file deleted before ever reaching the remote");
                return Ok(());
            }
            self.0.queue.queue_request(QueueEntry::new(&parent, name, QueueMethod::Delete, self.0.now_ms())).await?;
        } else {
            self.0.queue.queue_request(QueueEntry::new(&parent, name, QueueMethod::Delete, self.0.now_ms())).await?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_directory(&self, path: &str) -> TreeResult<()> {
        self.0.local.delete_directory(path).await?;
        if let Err(e) = self.0.remote.delete_directory(path).await {
            tracing::error!(%path, error = %e, "remote deleteDirectory failed, synchronous op surfaces to caller");
            return Err(e);
        }
        self.0.queue.remove_path(path).await?;
        self.0.work.remove_subtree(path).await?;
        self.0.invalidate_parent(path);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn rename(&self, old: &str, new: &str) -> TreeResult<()> {
        if !self.0.local.exists(old).await {
            return self.0.remote.rename(old, new).await;
        }
        self.0.local.rename(old, new).await?;
        self.0.invalidate_parent(old);
        self.0.invalidate_parent(new);

        let host_path = self.0.local.root().join(new.trim_start_matches('/'));
        let is_directory = tokio::fs::metadata(&host_path)
            .await
            .map_err(|e| TreeError::Io(e))?
            .is_dir();
        if is_directory {
            self.0.remote.rename(old, new).await?;
            self.0.queue.update_path(old, new).await?;
            return Ok(());
        }

        self.0.work.rename_markers(old, new).await?;
        if self.0.was_created_here(old).await {
            self.0.clear_created(old).await;
            self.0.mark_created(new).await;
        }

        let old_temp = self.is_temp(old);
        let new_temp = self.is_temp(new);
        let now = self.0.now_ms();
        let new_parent = crate::path::parent(new);
        let new_name = crate::path::leaf(new);
        match (old_temp, new_temp) {
            (true, true) => {}
            (true, false) => {
                self.0
                    .queue
                    .queue_request(QueueEntry::new(&new_parent, new_name, QueueMethod::Put, now))
                    .await?;
            }
            (false, true) => {
                let old_parent = crate::path::parent(old);
                let old_name = crate::path::leaf(old);
                self.0
                    .queue
                    .queue_request(QueueEntry::new(&old_parent, old_name, QueueMethod::Delete, now))
                    .await?;
            }
            (false, false) => {
                // Keyed by the *old* location: the remote file still lives
                // there until the processor's MOVE completes, so listing the
                // old directory in the meantime must still surface it.
                let old_parent = crate::path::parent(old);
                let old_name = crate::path::leaf(old);
                let mut entry =
                    QueueEntry::new(&old_parent, old_name, QueueMethod::Move, now);
                entry.dest_path = Some(new.to_string());
                self.0.queue.queue_request(entry).await?;
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> TreeResult<()> {
        let mut first_err = None;
        for result in [
            self.0.local.disconnect().await,
            self.0.remote.disconnect().await,
            self.0.work.disconnect().await,
        ] {
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// An open file as seen by the SMB front-end. Wraps either a local or
/// remote handle; the **caching protocol** (`cache.rs`) reconciles the two
/// on first access.
pub struct RqFile {
    pub(crate) path: String,
    pub(crate) is_temp: bool,
    pub(crate) share: Arc<RqShareInner>,
    pub(crate) local: Option<Box<dyn File>>,
    pub(crate) meta: FileMeta,
    pub(crate) cached: bool,
    pub(crate) dirty: bool,
}

#[async_trait]
impl File for RqFile {
    fn meta(&self) -> &FileMeta {
        &self.meta
    }

    async fn read(&mut self, buf: &mut [u8], pos: u64) -> TreeResult<usize> {
        self.cache_file().await?;
        self.local.as_mut().unwrap().read(buf, pos).await
    }

    async fn write(&mut self, buf: &[u8], pos: u64) -> TreeResult<usize> {
        self.cache_file().await?;
        let n = self.local.as_mut().unwrap().write(buf, pos).await?;
        self.dirty = true;
        self.meta = self.local.as_ref().unwrap().meta().clone();
        Ok(n)
    }

    async fn set_length(&mut self, len: u64) -> TreeResult<()> {
        self.cache_file().await?;
        self.local.as_mut().unwrap().set_length(len).await?;
        self.dirty = true;
        self.meta = self.local.as_ref().unwrap().meta().clone();
        Ok(())
    }

    async fn delete(&mut self) -> TreeResult<()> {
        self.cache_file().await?;
        self.local.as_mut().unwrap().delete().await
    }

    async fn flush(&mut self) -> TreeResult<()> {
        if let Some(local) = self.local.as_mut() {
            local.flush().await?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(path = %self.path, dirty = self.dirty))]
    async fn close(mut self: Box<Self>) -> TreeResult<()> {
        if let Some(local) = self.local.take() {
            local.close().await?;
        }
        if !self.dirty || self.is_temp {
            // Temp paths are never queued: dirty writes to them are just
            // ordinary local edits.
            return Ok(());
        }
        let parent = crate::path::parent(&self.path);
        let name = crate::path::leaf(&self.path);
        // The work marker is the primary signal; `createdFiles` backs it up
        // for a file created and written within the same brief window,
        // where the marker write may not yet be visible to this read.
        let never_synced = self.share.work.creation_marker_exists(&self.path).await
            || self.share.was_created_here(&self.path).await;
        let method = if never_synced { QueueMethod::Put } else { QueueMethod::Post };
        let now = self.share.now_ms();
        self.share
            .queue
            .queue_request(QueueEntry::new(&parent, name, method, now))
            .await?;
        self.share.invalidate_parent(&self.path);
        tracing::debug!(path = %self.path, %method, "enqueued on close");
        Ok(())
    }

    async fn set_last_modified(&mut self, ms: i64) -> TreeResult<()> {
        self.cache_file().await?;
        self.local.as_mut().unwrap().set_last_modified(ms).await
    }
}
