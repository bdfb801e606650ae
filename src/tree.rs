//! The common `Tree` capability shared by the remote, local and work
//! trees.

use async_trait::async_trait;

use crate::error::TreeResult;
use crate::file::File;

/// A directory tree reachable through a uniform set of operations. `path`
/// arguments are normalized, `/`-separated virtual paths (see
/// [`crate::path`]), not host filesystem paths.
#[async_trait]
pub trait Tree: Send + Sync {
    /// Existence check; no side effects.
    async fn exists(&self, path: &str) -> bool;

    /// Open a handle to `path`. Fails with `TreeError::NotFound` if it does
    /// not exist in this tree.
    async fn open(&self, path: &str) -> TreeResult<Box<dyn File>>;

    /// List the entries directly under `dir` (pattern is always `<dir>/*`,
    /// never a recursive glob).
    async fn list(&self, dir: &str) -> TreeResult<Vec<Box<dyn File>>>;

    /// Create an empty regular file. Fails if it already exists.
    async fn create_file(&self, path: &str) -> TreeResult<()>;

    /// Create a directory. Fails if it already exists.
    async fn create_directory(&self, path: &str) -> TreeResult<()>;

    /// Remove a regular file.
    async fn delete(&self, path: &str) -> TreeResult<()>;

    /// Remove an empty directory.
    async fn delete_directory(&self, path: &str) -> TreeResult<()>;

    /// Move `old` to `new` within this tree.
    async fn rename(&self, old: &str, new: &str) -> TreeResult<()>;

    /// Release any resources held by this tree (connections, watchers).
    async fn disconnect(&self) -> TreeResult<()>;
}
