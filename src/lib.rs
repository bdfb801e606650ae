//! A write-back remote-queue (RQ) backend for a projected network share.
//!
//! The crate's job is narrow: given a configured remote HTTP endpoint, a
//! local cache directory, and a work/metadata directory, it exposes a
//! [`tree::Tree`]/[`file::File`] capability pair a protocol front-end can
//! drive directly, while a background [`processor::SyncProcessor`] drains
//! the durable [`queue::RequestQueue`] of pending mutations against the
//! remote. The SMB/CIFS wire protocol itself is an external collaborator,
//! out of this crate's scope.

pub mod config;
pub mod error;
pub mod events;
pub mod file;
pub mod path;
pub mod processor;
pub mod queue;
pub mod rq;
pub mod tree;
pub mod trees;

pub use config::Config;
pub use error::{QueueError, SyncError, TreeError, TreeResult};
pub use events::{EventBus, QueueMethod, ShareEvent};
pub use file::{File, FileMeta};
pub use processor::SyncProcessor;
pub use queue::{QueueEntry, RequestQueue};
pub use rq::{RqFile, RqShare, RqTree};
pub use tree::Tree;
