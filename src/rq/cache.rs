//! The caching protocol and safe-delete predicate.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{TreeError, TreeResult};
use crate::events::ShareEvent;
use crate::file::{File, FileMeta};
use crate::trees::RemoteFile;

use super::{RqFile, RqShareInner};

/// Safe-delete predicate for a regular file: local changes since the
/// last sync must be within the configured jitter tolerance, and the
/// file must not be a pending local creation.
pub(crate) fn is_safe_to_delete(
    last_modified: i64,
    synced_at: i64,
    modified_threshold_ms: i64,
    has_creation_marker: bool,
) -> bool {
    let delta = last_modified - synced_at;
    delta <= modified_threshold_ms && !has_creation_marker
}

impl RqFile {
    /// Returns once `self.local` holds a consistent local handle,
    /// reconciling divergence from the remote along the way. Recursive on
    /// the remote-rollback path, so it is boxed to keep the future's size
    /// finite.
    pub(crate) fn cache_file(&mut self) -> BoxFuture<'_, TreeResult<()>> {
        async move {
            if self.cached {
                return Ok(());
            }
            if self.is_temp {
                // Step 2: a temp handle is returned unchanged. The common
                // case already has a local handle (temp names are ordinary
                // editor artifacts materialized locally); on the rare path
                // where one only exists remotely, pull it down once so
                // `read`/`write` below don't unwrap a `None`. Temp paths get
                // no work markers either way.
                if self.local.is_none() {
                    let share = self.share.clone();
                    let body = share.remote.fetch_resource(&self.path).await?;
                    materialize_local(&share, &self.path, &body).await?;
                    self.local = Some(share.local.open(&self.path).await?);
                }
                self.cached = true;
                return Ok(());
            }

            let share = self.share.clone();
            let gate = share.download_gate(&self.path).await;
            let _permit = gate.lock().await;

            if share.local.exists(&self.path).await {
                let disk_meta = share.local.open(&self.path).await?.meta().clone();

                // `self.cached` (step 1, above) already covers "nothing to
                // do if this handle already completed caching" — once that
                // flag is set we never re-enter this block for the same
                // `RqFile`. A freshly opened `RqFile` always needs the full
                // creation-marker / remote-divergence check below, even
                // though its in-memory handle trivially agrees with the
                // disk metadata it was just opened from; skipping it here
                // would permanently hide a remote rollback from every
                // `open()` after the first cache fill.

                if share.work.creation_marker_exists(&self.path).await {
                    self.local = Some(share.local.open(&self.path).await?);
                    self.cached = true;
                    return Ok(());
                }

                let remote_meta = share.remote.stat(&self.path).await?;
                let synced_at = share.work.read_sync_marker(&self.path).await?.unwrap_or(0);
                let safe = is_safe_to_delete(
                    disk_meta.last_modified,
                    synced_at,
                    share.config.modified_threshold_ms,
                    false,
                );

                if !safe {
                    let parent = crate::path::parent(&self.path);
                    let name = crate::path::leaf(&self.path);
                    let has_queue_entry = share.queue.exists(&parent, name).await?;
                    if !has_queue_entry {
                        tracing::warn!(path = %self.path, "sync conflict: local changes unsynced past threshold");
                        share.events.emit(ShareEvent::SyncConflict { file: self.path.clone() });
                    }
                    self.local = Some(share.local.open(&self.path).await?);
                    self.cached = true;
                    return Ok(());
                }

                if (remote_meta.last_modified - synced_at).abs() > 1000 {
                    tracing::info!(path = %self.path, remote_modified = remote_meta.last_modified, synced_at, "remote diverged since last sync, re-fetching");
                    share.local.delete(&self.path).await.ok();
                    share.work.remove_markers(&self.path).await?;
                    self.local = None;
                    return self.cache_file().await;
                }

                self.local = Some(share.local.open(&self.path).await?);
                self.cached = true;
                return Ok(());
            }

            let body = share.remote.fetch_resource(&self.path).await?;
            let remote_meta = share.remote.stat(&self.path).await?;
            materialize_local(&share, &self.path, &body).await?;
            self.local = Some(share.local.open(&self.path).await?);
            share.work.write_sync_marker(&self.path, remote_meta.last_modified).await?;
            self.cached = true;
            Ok(())
        }
        .boxed()
    }
}

async fn materialize_local(share: &Arc<RqShareInner>, path: &str, body: &bytes::Bytes) -> TreeResult<()> {
    if !share.local.exists(path).await {
        share.local.create_file(path).await?;
    }
    let mut handle = share.local.open(path).await?;
    handle.write(body, 0).await?;
    handle.set_length(body.len() as u64).await?;
    handle.flush().await?;
    handle.close().await
}

/// `list`: union of remote and local listings, applying queue-delete
/// masking, local supersession, and the orphan/safe-delete rule.
#[tracing::instrument(skip(share))]
pub(crate) async fn list_with_policy(
    share: &Arc<RqShareInner>,
    dir: &str,
) -> TreeResult<Vec<Box<dyn File>>> {
    let requests = share.queue.get_requests(dir).await?;

    let remote_entries: Vec<Box<dyn File>> = if let Some(cached) = share.cached_remote_list(dir) {
        cached.iter().cloned().map(|meta| Box::new(RemoteFile::from_meta(meta)) as Box<dyn File>).collect()
    } else {
        let fetched = match share.remote.list(dir).await {
            Ok(entries) => entries,
            Err(TreeError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let metas: Vec<FileMeta> = fetched.iter().map(|f| f.meta().clone()).collect();
        share.cache_remote_list(dir, Arc::new(metas));
        fetched
    };
    let local_entries = match share.local.list(dir).await {
        Ok(entries) => entries,
        Err(TreeError::NotFound(_)) => Vec::new(),
        Err(e) => return Err(e),
    };

    let remote_names: HashSet<String> =
        remote_entries.iter().map(|f| crate::path::leaf(&f.meta().path).to_string()).collect();
    let local_names: HashSet<String> =
        local_entries.iter().map(|f| crate::path::leaf(&f.meta().path).to_string()).collect();

    let temp_patterns = share.config.temp_patterns();
    let mut out = Vec::new();

    for entry in remote_entries {
        let name = crate::path::leaf(&entry.meta().path).to_string();
        if matches!(requests.get(&name), Some(crate::events::QueueMethod::Delete)) {
            continue;
        }
        if local_names.contains(&name) {
            continue;
        }
        out.push(entry);
    }

    for local_file in local_entries {
        let path = local_file.meta().path.clone();
        let name = crate::path::leaf(&path).to_string();

        if remote_names.contains(&name) {
            out.push(local_file);
            continue;
        }
        if temp_patterns.is_temp(&path) {
            out.push(local_file);
            continue;
        }
        if share.work.creation_marker_exists(&path).await {
            out.push(local_file);
            continue;
        }

        // Orphan: present locally, absent remotely, never locally-born.
        let meta = local_file.meta().clone();

        if meta.is_directory {
            // A directory is trivially safe on its own, but recursion into
            // it is only safe if every file it contains is; otherwise it
            // is retained and each blocking file surfaces its own
            // conflict.
            let blockers = directory_delete_blockers(&share, &path).await?;
            if blockers.is_empty() {
                share.local.remove_subtree(&path).await.ok();
                share.work.remove_subtree(&path).await.ok();
            } else {
                for blocker in &blockers {
                    tracing::warn!(path = %blocker, dir = %path, "file blocks deletion of orphaned directory");
                    share.events.emit(ShareEvent::SyncConflict { file: blocker.clone() });
                }
                out.push(local_file);
            }
            continue;
        }

        let synced_at = share.work.read_sync_marker(&path).await?.unwrap_or(0);
        let safe = is_safe_to_delete(meta.last_modified, synced_at, share.config.modified_threshold_ms, false);

        if safe {
            // Re-check immediately before physical deletion to guard
            // against a write racing in between the listing scan and the
            // removal.
            let still_safe = match share.local.open(&path).await.ok() {
                Some(f) => is_safe_to_delete(
                    f.meta().last_modified,
                    synced_at,
                    share.config.modified_threshold_ms,
                    false,
                ),
                None => true,
            };
            if !still_safe {
                tracing::warn!(%path, "orphaned local file unsafe to drop, surfacing conflict");
                share.events.emit(ShareEvent::SyncConflict { file: path.clone() });
                out.push(local_file);
                continue;
            }
            share.local.delete(&path).await.ok();
            share.work.remove_markers(&path).await.ok();
        } else {
            tracing::warn!(%path, "orphaned local file modified past threshold, surfacing conflict");
            share.events.emit(ShareEvent::SyncConflict { file: path.clone() });
            out.push(local_file);
        }
    }

    Ok(out)
}

/// Walk every file under `dir` and collect the paths that fail the
/// safe-delete predicate: temp files are always safe, a pending local
/// creation is never safe, and nested directories recurse. Boxed because
/// the recursion would otherwise give the future an infinite size.
fn directory_delete_blockers<'a>(
    share: &'a Arc<RqShareInner>,
    dir: &'a str,
) -> BoxFuture<'a, TreeResult<Vec<String>>> {
    async move {
        let entries = match share.local.list(dir).await {
            Ok(entries) => entries,
            Err(TreeError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let temp_patterns = share.config.temp_patterns();
        let mut blockers = Vec::new();
        for entry in entries {
            let meta = entry.meta().clone();
            if meta.is_directory {
                blockers.extend(directory_delete_blockers(share, &meta.path).await?);
                continue;
            }
            if temp_patterns.is_temp(&meta.path) {
                continue;
            }
            let has_creation = share.work.creation_marker_exists(&meta.path).await;
            let synced_at = share.work.read_sync_marker(&meta.path).await?.unwrap_or(0);
            let safe = is_safe_to_delete(
                meta.last_modified,
                synced_at,
                share.config.modified_threshold_ms,
                has_creation,
            );
            if !safe {
                blockers.push(meta.path);
            }
        }
        Ok(blockers)
    }
    .boxed()
}
