//! The durable request queue.

pub mod sled_store;

pub use sled_store::SledRequestQueue;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::QueueResult;
use crate::events::QueueMethod;

/// A pending mutation keyed by `(parent_path, name)`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QueueEntry {
    pub parent_path: String,
    pub name: String,
    pub method: QueueMethod,
    /// Destination path for a `MOVE` entry.
    pub dest_path: Option<String>,
    pub created_at: i64,
    pub retries: u32,
    pub last_attempt_at: i64,
}

impl QueueEntry {
    pub fn new(parent_path: impl Into<String>, name: impl Into<String>, method: QueueMethod, now: i64) -> Self {
        Self {
            parent_path: parent_path.into(),
            name: name.into(),
            method,
            dest_path: None,
            created_at: now,
            retries: 0,
            last_attempt_at: 0,
        }
    }

    pub fn path(&self) -> String {
        crate::path::join(&self.parent_path, &self.name)
    }
}

/// The durable, ordered-by-readiness multiset of pending mutations. A
/// single logical writer (the RQ tree enqueues, the sync processor drains)
/// is assumed; the trait itself makes no promises about concurrent
/// writers.
#[async_trait]
pub trait RequestQueue: Send + Sync {
    /// Insert a new entry, applying the coalescing rules against any
    /// existing entry for the same `(parent_path, name)`.
    async fn queue_request(&self, entry: QueueEntry) -> QueueResult<()>;

    /// All entries directly under `parent_path`, keyed by name.
    async fn get_requests(&self, parent_path: &str) -> QueueResult<HashMap<String, QueueMethod>>;

    /// Whether an entry exists for `(parent_path, name)`.
    async fn exists(&self, parent_path: &str, name: &str) -> QueueResult<bool>;

    /// The single entry for `(parent_path, name)`, if any.
    async fn get(&self, parent_path: &str, name: &str) -> QueueResult<Option<QueueEntry>>;

    /// The oldest entry eligible for processing: `created_at + expiration_ms
    /// ≤ now`, `retries < max_retries`, `last_attempt_at + retry_delay_ms ≤
    /// now`.
    async fn get_process_request(
        &self,
        expiration_ms: i64,
        max_retries: u32,
        retry_delay_ms: i64,
    ) -> QueueResult<Option<QueueEntry>>;

    /// Remove the entry for `(parent_path, name)` after a successful sync.
    async fn complete_request(&self, parent_path: &str, name: &str) -> QueueResult<()>;

    /// Bump `retries` and set `last_attempt_at = now` after a failed sync
    /// attempt.
    async fn increment_retry_count(&self, parent_path: &str, name: &str) -> QueueResult<()>;

    /// Remove and return every entry whose `retries ≥ max_retries`.
    async fn purge_failed_requests(&self, max_retries: u32) -> QueueResult<Vec<QueueEntry>>;

    /// Rewrite `parent_path` on every entry under `old_prefix` to the
    /// corresponding path under `new_prefix` (directory rename).
    async fn update_path(&self, old_prefix: &str, new_prefix: &str) -> QueueResult<()>;

    /// Drop every entry whose path lies under `prefix` (directory delete).
    async fn remove_path(&self, prefix: &str) -> QueueResult<()>;
}

/// Apply the coalescing rule between an existing entry and an incoming
/// one for the same `(parent_path, name)`. Returns the entry that should
/// be stored, or `None` if the pair cancels out.
pub(crate) fn coalesce(existing: Option<QueueEntry>, incoming: QueueEntry) -> Option<QueueEntry> {
    let Some(existing) = existing else {
        return Some(incoming);
    };
    use QueueMethod::*;
    match (existing.method, incoming.method) {
        (Put, Post) => Some(existing),
        (Post, Post) => Some(incoming),
        (Put, Delete) => None,
        (Post, Delete) => Some(incoming),
        (Delete, Put) => Some(incoming),
        _ => Some(incoming),
    }
}
