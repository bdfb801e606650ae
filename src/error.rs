//! Error types for the remote-queue backend.
//!
//! Three distinct error types are kept apart rather than flattened into
//! one: a `TreeError` is a capability-level failure (the kind a front-end
//! eventually maps to a wire status code), a `QueueError` is a durability
//! failure in the persisted request queue, and a `SyncError` is the
//! processor's classification of a sync attempt's outcome.

use std::io;

/// Result alias used by every `Tree`/`File` method.
pub type TreeResult<T> = std::result::Result<T, TreeError>;

/// Capability-level errors returned by `Tree` and `File` operations.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    /// No such file or directory.
    #[error("no such file or directory: {0}")]
    NotFound(String),
    /// The target of a creating operation already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// A directory operation was attempted on a regular file.
    #[error("not a directory: {0}")]
    NotADirectory(String),
    /// A file operation was attempted on a directory.
    #[error("is a directory: {0}")]
    IsADirectory(String),
    /// Attempted to remove a directory that still has entries.
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    /// The underlying store refused the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The capability does not implement this operation (e.g. setting the
    /// modification time of a read-only remote handle).
    #[error("operation not supported")]
    NotSupported,
    /// A path failed normalization (escaping `..`, empty segment, etc).
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// A host filesystem failure.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The remote endpoint answered with a non-2xx status.
    #[error("remote endpoint returned {status}: {message}")]
    Remote { status: u16, message: String },
    /// Transport-level failure talking to the remote endpoint.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// The durable queue failed to record or read a mutation.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Result alias used by `RequestQueue` methods.
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Failures from the durable request queue's storage layer.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The embedded store reported a failure.
    #[error(transparent)]
    Store(#[from] sled::Error),
    /// A queue record could not be encoded or decoded.
    #[error("failed to (de)serialize queue record: {0}")]
    Codec(#[from] bincode::Error),
}

/// Classification of a single sync attempt's outcome.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// I/O failure, HTTP 5xx, connection reset — retry later.
    #[error("transient sync failure for {path}: {source}")]
    Transient { path: String, source: TreeError },
    /// HTTP 4xx or a forbidden name — retried up to the limit, then purged.
    #[error("permanent sync failure for {path}: {reason}")]
    Permanent { path: String, reason: String },
    /// Divergence detected between local and remote copies.
    #[error("sync conflict for {path}")]
    Conflict { path: String },
    /// A superseding write cancelled this attempt mid-flight.
    #[error("sync aborted for {path}")]
    Aborted { path: String },
}
