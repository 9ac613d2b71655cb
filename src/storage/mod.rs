//! Interfaces to the node's local storage: the non-replicated collection
//! that slave progress is persisted into, and the fsync lock that can
//! forbid writing to it.

mod fsync;
mod local;

pub use fsync::{FsyncLock, LockState};
pub use local::{LocalStore, Memory, SLAVES_NS};
