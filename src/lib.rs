//! Tracks how far each follower of a primary node has applied the primary's
//! operation log, and answers write-concern questions about it: has a given
//! write replicated to enough followers yet, and if not, can we wait for it?

#![warn(clippy::all)]

pub mod error;
pub mod repl;
pub mod storage;

pub use error::{Error, Result};
pub use repl::{OpTime, SlaveTracker};
