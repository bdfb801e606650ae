//! Concrete `Tree` implementations.

pub mod local;
pub mod remote;
pub mod work;

pub use local::{LocalFile, LocalTree};
pub use remote::{RemoteFile, RemoteTree};
pub use work::WorkTree;
