#![warn(clippy::all)]
#![allow(clippy::module_inception)]
#![allow(clippy::type_complexity)]

pub mod client;
pub mod encoding;
pub mod error;
pub mod raft;
pub mod storage;

pub use client::Client;
pub use error::{Error, Result};
