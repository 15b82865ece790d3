//! Durable storage for the Raft log. The storage module is chosen at
//! construction time, either in-memory (tests, temporary storage) or a
//! filesystem directory of segment files.

pub mod log;

pub use log::{Filesystem, Memory, Store};
