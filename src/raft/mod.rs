//! The Raft consensus engine and its supporting pieces: the replicated log,
//! membership configurations, the wire protocol, the snapshot store, and the
//! threaded server that drives the engine.

mod config;
mod log;
mod message;
mod node;
mod server;
pub mod snapshot;

pub use self::log::{Entry, EntryKind, Log};
pub use config::{Configuration, Member, SimpleConfiguration};
pub use message::{
    AppendOutcome, ConnectionType, Envelope, Message, Request, RequestId, Response,
};
pub use node::{Apply, Node, Options};
pub use server::{Raft, Server};

/// A server id. Assigned at configuration time; never 0.
pub type ServerId = u64;

/// A leader term. 0 is the pre-boot sentinel.
pub type Term = u64;

/// A log index. Starts at 1; 0 indicates no index.
pub type Index = u64;

/// A logical clock interval as a number of ticks. One tick is the heartbeat
/// period; election timeouts are multiples of it.
pub type Ticks = u8;

/// The default number of ticks between leader heartbeats.
pub(crate) const HEARTBEAT_INTERVAL: Ticks = 1;

/// The default range of randomized election timeouts, in ticks. Chosen
/// uniformly in [timeout, 2·timeout) per election.
pub(crate) const ELECTION_TIMEOUT_RANGE: std::ops::Range<Ticks> = 5..10;

/// The maximum number of entries in a single Append message.
pub(crate) const MAX_APPEND_ENTRIES: usize = 64;

/// The maximum total payload bytes in a single Append message.
pub(crate) const MAX_APPEND_BYTES: u64 = 1 << 20;

/// The snapshot transfer chunk size.
pub(crate) const SNAPSHOT_CHUNK_BYTES: u64 = 512 << 10;

/// The number of ticks an outstanding snapshot chunk may go unanswered
/// before it is resent (two heartbeat periods).
pub(crate) const RPC_TIMEOUT_TICKS: Ticks = 2;

/// The maximum number of catch-up rounds granted to a new server during a
/// membership change before the change is aborted.
pub(crate) const CATCHUP_ROUNDS: u8 = 10;
