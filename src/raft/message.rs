use super::snapshot;
use super::{Entry, Index, Member, ServerId, Term};
use crate::encoding;
use crate::error::Result;

use serde_derive::{Deserialize, Serialize};

/// A message envelope routed between servers (or locally, for client
/// requests stepped into the engine). The sender's current term accompanies
/// every message; observing a term above the local one forces the recipient
/// to become a follower in it before the message is processed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub from: ServerId,
    /// The recipient.
    pub to: ServerId,
    /// The sender's current term.
    pub term: Term,
    /// The message payload.
    pub message: Message,
}

impl encoding::Value for Envelope {}

/// A message between Raft servers. Delivery is at most once and unordered;
/// the protocol tolerates loss and reordering by retrying from persistent
/// state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// A candidate solicits a vote (RequestVote). Carries the candidate's
    /// last log position for the up-to-date check.
    Campaign {
        /// The index of the candidate's last log entry.
        last_index: Index,
        /// The term of the candidate's last log entry.
        last_term: Term,
    },
    /// A vote reply (RequestVote response). Voters grant at most one vote
    /// per term, on a first-come basis; candidates implicitly vote for
    /// themselves.
    CampaignResponse {
        /// Whether the vote was granted.
        granted: bool,
    },

    /// The leader replicates entries (AppendEntries). An empty entry list is
    /// a heartbeat, which also resets the follower's election timer.
    Append {
        /// The index of the entry immediately preceding the batch.
        base_index: Index,
        /// The term of the entry immediately preceding the batch.
        base_term: Term,
        /// The leader's commit index.
        commit_index: Index,
        /// The entries to replicate, contiguous from base_index + 1.
        entries: Vec<Entry>,
    },
    /// An AppendEntries reply.
    AppendResponse {
        /// The outcome of the append.
        outcome: AppendOutcome,
        /// On Ok, the last index covered by the append (the follower's match
        /// index). On LogMismatch, the follower's last index in the
        /// non-conflicting prefix, as a fast-backup hint that lets the leader
        /// skip a whole divergent term in one round.
        last_index: Index,
    },

    /// The leader streams a chunk of its snapshot file (InstallSnapshot) to
    /// a follower whose log is behind the snapshot. The configuration is
    /// embedded in the snapshot header carried by the data bytes.
    Snapshot {
        /// The snapshot's last included index.
        last_index: Index,
        /// The snapshot's last included term.
        last_term: Term,
        /// The byte offset of this chunk in the snapshot file.
        offset: u64,
        /// The chunk data.
        data: Vec<u8>,
        /// Whether this is the final chunk.
        done: bool,
    },
    /// An InstallSnapshot reply. Reports the follower's staged byte count,
    /// which is authoritative: on a mismatch the leader resumes from it.
    SnapshotResponse {
        /// The number of bytes the follower has staged.
        stored: u64,
    },

    /// A client request, stepped into the engine by the local server.
    ClientRequest {
        /// The request id, unique for the duration of the request.
        id: RequestId,
        /// The request.
        request: Request,
    },
    /// A client response, routed back to the local server.
    ClientResponse {
        /// The id of the original request.
        id: RequestId,
        /// The response, or an error from the result taxonomy.
        response: Result<Response>,
    },
}

/// The outcome of an AppendEntries call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppendOutcome {
    /// The entries were appended (or already present).
    Ok,
    /// The request's term is below the recipient's.
    TermStale,
    /// The base entry did not match the recipient's log.
    LogMismatch,
}

/// A client request id.
pub type RequestId = Vec<u8>;

/// A client request. GetServerInfo and VerifyRecipient are answered by the
/// server wrapper without entering the engine; the rest are processed under
/// the engine's state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Appends an opaque payload to the replicated log, answering once the
    /// entry commits.
    Replicate(Vec<u8>),
    /// Returns this server's id and addresses.
    GetServerInfo,
    /// Returns the latest committed simple configuration and its id.
    GetConfiguration,
    /// Replaces the cluster membership via joint consensus. old_id must
    /// match the current stable configuration's id.
    SetConfiguration { old_id: Index, members: Vec<Member> },
    /// Returns the commit index, if currently confident of leadership.
    GetLastCommitIndex,
    /// Verifies that the recipient is the intended server.
    VerifyRecipient { id: Option<ServerId> },
    /// One-shot: on an empty log, writes term 1 and a configuration naming
    /// just this server, so the first cluster can start.
    Bootstrap,
    /// Begins a host snapshot covering entries up to the given index,
    /// answering with the snapshot metadata to write.
    BeginSnapshot { until: Index },
    /// Completes a host snapshot after its writer has been saved, compacting
    /// the log prefix it covers.
    CompleteSnapshot { index: Index },
}

/// A client response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// The index at which the payload was committed.
    Replicate(Index),
    ServerInfo { id: ServerId, addresses: String },
    Configuration { id: Index, members: Vec<Member> },
    SetConfiguration,
    LastCommitIndex(Index),
    VerifyRecipient { id: ServerId, ok: bool, error: Option<String> },
    Bootstrap,
    BeginSnapshot(snapshot::Meta),
    CompleteSnapshot,
}

/// The first frame sent on an outbound connection, identifying the protocol
/// spoken on it: envelopes between peers, or request/response with clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    Peer,
    Client,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Value as _;
    use crate::error::Error;
    use crate::raft::EntryKind;

    /// Wire messages must round-trip through the encoding.
    #[test]
    fn envelope_roundtrip() -> Result<()> {
        let messages = [
            Message::Campaign { last_index: 3, last_term: 2 },
            Message::CampaignResponse { granted: true },
            Message::Append {
                base_index: 5,
                base_term: 2,
                commit_index: 4,
                entries: vec![Entry {
                    index: 6,
                    term: 3,
                    kind: EntryKind::Data,
                    payload: b"payload".to_vec(),
                    cluster_time: 17,
                }],
            },
            Message::AppendResponse { outcome: AppendOutcome::LogMismatch, last_index: 4 },
            Message::Snapshot {
                last_index: 9,
                last_term: 3,
                offset: 1024,
                data: vec![0xff; 8],
                done: false,
            },
            Message::SnapshotResponse { stored: 1032 },
            Message::ClientRequest { id: vec![1, 2], request: Request::Replicate(b"x".to_vec()) },
            Message::ClientResponse { id: vec![1, 2], response: Err(Error::NotLeader(Some(2))) },
        ];
        for message in messages {
            let envelope = Envelope { from: 1, to: 2, term: 3, message };
            assert_eq!(Envelope::decode(&envelope.encode()?)?, envelope);
        }
        Ok(())
    }
}
