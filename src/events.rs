//! Share events observable by the front-end.

use tokio::sync::broadcast;

/// The HTTP verb a queue entry is stored under. Note the wire-level
/// inversion applied by the processor: a queue `Put` is transmitted as an
/// HTTP `POST` and a queue `Post` as an HTTP `PUT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum QueueMethod {
    Put,
    Post,
    Delete,
    Move,
}

impl std::fmt::Display for QueueMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueueMethod::Put => "PUT",
            QueueMethod::Post => "POST",
            QueueMethod::Delete => "DELETE",
            QueueMethod::Move => "MOVE",
        };
        f.write_str(s)
    }
}

/// Events emitted to the front-end share and, internally, to the sync
/// processor's own cancellation listener.
#[derive(Debug, Clone)]
pub enum ShareEvent {
    /// A sync attempt for `path` using `method` has started.
    SyncFileStart { path: String, method: QueueMethod },
    /// A sync attempt for `path` completed successfully.
    SyncFileEnd { path: String, method: QueueMethod },
    /// A sync attempt for `path` failed (will retry unless poisoned).
    SyncFileErr { path: String, reason: String },
    /// A sync attempt for `path` was cancelled by a superseding write.
    SyncAbort { path: String },
    /// A divergence between the local and remote copies of `file` was
    /// detected and the local copy was kept.
    SyncConflict { file: String },
    /// An unrecoverable processor-level error occurred.
    SyncErr { err: String },
    /// One or more entries exhausted their retry budget and were purged.
    SyncPurged { files: Vec<String> },
    /// A specific queue entry was added, replaced, or removed.
    ItemUpdated { path: String },
    /// A subtree of queue entries was rewritten or dropped.
    PathUpdated { prefix: String },
}

/// Shared broadcast bus for `ShareEvent`s. Cloning an `EventBus` shares the
/// same underlying channel; every clone's `subscribe()` sees all events
/// published after the subscription is created.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ShareEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShareEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Errors (no subscribers) are not a failure of the
    /// operation that triggered the event, so they are swallowed here.
    pub fn emit(&self, event: ShareEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
