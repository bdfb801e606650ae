//! `sled`-backed durable implementation of [`RequestQueue`].

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::QueueResult;
use crate::events::{EventBus, QueueMethod, ShareEvent};

use super::{coalesce, QueueEntry, RequestQueue};

/// Separator between `parent_path` and `name` in the sled key; chosen as a
/// byte that never appears in a normalized path segment.
const KEY_SEP: u8 = 0;

fn encode_key(parent_path: &str, name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(parent_path.len() + name.len() + 1);
    key.extend_from_slice(parent_path.as_bytes());
    key.push(KEY_SEP);
    key.extend_from_slice(name.as_bytes());
    key
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A durable, crash-safe request queue backed by an embedded `sled`
/// database. Every mutation is flushed before the call returns, so a
/// crash never loses an acknowledged write-back.
pub struct SledRequestQueue {
    db: sled::Db,
    events: EventBus,
}

impl SledRequestQueue {
    pub fn open(path: impl AsRef<std::path::Path>, events: EventBus) -> QueueResult<Self> {
        let db = sled::open(path)?;
        Ok(Self { db, events })
    }

    fn store(&self, entry: &QueueEntry) -> QueueResult<()> {
        let key = encode_key(&entry.parent_path, &entry.name);
        let value = bincode::serialize(entry)?;
        self.db.insert(key, value)?;
        self.db.flush()?;
        Ok(())
    }

    fn load(&self, parent_path: &str, name: &str) -> QueueResult<Option<QueueEntry>> {
        let key = encode_key(parent_path, name);
        match self.db.get(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn remove(&self, parent_path: &str, name: &str) -> QueueResult<()> {
        let key = encode_key(parent_path, name);
        self.db.remove(key)?;
        self.db.flush()?;
        Ok(())
    }

    fn all_entries(&self) -> QueueResult<Vec<QueueEntry>> {
        let mut out = Vec::new();
        for item in self.db.iter() {
            let (_, value) = item?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl RequestQueue for SledRequestQueue {
    async fn queue_request(&self, entry: QueueEntry) -> QueueResult<()> {
        let existing = self.load(&entry.parent_path, &entry.name)?;
        let parent_path = entry.parent_path.clone();
        let name = entry.name.clone();
        match coalesce(existing, entry) {
            Some(merged) => self.store(&merged)?,
            None => self.remove(&parent_path, &name)?,
        }
        self.events.emit(ShareEvent::ItemUpdated { path: crate::path::join(&parent_path, &name) });
        Ok(())
    }

    async fn get_requests(&self, parent_path: &str) -> QueueResult<HashMap<String, QueueMethod>> {
        Ok(self
            .all_entries()?
            .into_iter()
            .filter(|e| e.parent_path == parent_path)
            .map(|e| (e.name, e.method))
            .collect())
    }

    async fn exists(&self, parent_path: &str, name: &str) -> QueueResult<bool> {
        Ok(self.load(parent_path, name)?.is_some())
    }

    async fn get(&self, parent_path: &str, name: &str) -> QueueResult<Option<QueueEntry>> {
        self.load(parent_path, name)
    }

    async fn get_process_request(
        &self,
        expiration_ms: i64,
        max_retries: u32,
        retry_delay_ms: i64,
    ) -> QueueResult<Option<QueueEntry>> {
        let now = now_ms();
        let eligible = self.all_entries()?.into_iter().filter(|e| {
            e.created_at + expiration_ms <= now
                && e.retries < max_retries
                && e.last_attempt_at + retry_delay_ms <= now
        });
        Ok(eligible.min_by_key(|e| e.created_at))
    }

    async fn complete_request(&self, parent_path: &str, name: &str) -> QueueResult<()> {
        self.remove(parent_path, name)?;
        self.events.emit(ShareEvent::ItemUpdated { path: crate::path::join(parent_path, name) });
        Ok(())
    }

    async fn increment_retry_count(&self, parent_path: &str, name: &str) -> QueueResult<()> {
        if let Some(mut entry) = self.load(parent_path, name)? {
            entry.retries += 1;
            entry.last_attempt_at = now_ms();
            self.store(&entry)?;
        }
        Ok(())
    }

    async fn purge_failed_requests(&self, max_retries: u32) -> QueueResult<Vec<QueueEntry>> {
        let mut purged = Vec::new();
        for entry in self.all_entries()? {
            if entry.retries >= max_retries {
                self.remove(&entry.parent_path, &entry.name)?;
                purged.push(entry);
            }
        }
        if !purged.is_empty() {
            self.events.emit(ShareEvent::SyncPurged {
                files: purged.iter().map(|e| e.path()).collect(),
            });
        }
        Ok(purged)
    }

    async fn update_path(&self, old_prefix: &str, new_prefix: &str) -> QueueResult<()> {
        for entry in self.all_entries()? {
            let path = entry.path();
            if !crate::path::under_prefix(&path, old_prefix) {
                continue;
            }
            let rest = path.strip_prefix(old_prefix).unwrap_or_default();
            self.remove(&entry.parent_path, &entry.name)?;
            let mut updated = entry;
            let new_path = format!("{new_prefix}{rest}");
            updated.parent_path = crate::path::parent(&new_path);
            updated.name = crate::path::leaf(&new_path).to_string();
            self.store(&updated)?;
        }
        self.events.emit(ShareEvent::PathUpdated { prefix: new_prefix.to_string() });
        Ok(())
    }

    async fn remove_path(&self, prefix: &str) -> QueueResult<()> {
        for entry in self.all_entries()? {
            if crate::path::under_prefix(&entry.path(), prefix) {
                self.remove(&entry.parent_path, &entry.name)?;
            }
        }
        self.events.emit(ShareEvent::PathUpdated { prefix: prefix.to_string() });
        Ok(())
    }
}
