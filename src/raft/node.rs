use super::config::Configs;
use super::message::{AppendOutcome, Envelope, Message, Request, RequestId, Response};
use super::snapshot;
use super::{
    Configuration, Entry, EntryKind, Index, Log, Member, ServerId, SimpleConfiguration, Term,
    Ticks, CATCHUP_ROUNDS, ELECTION_TIMEOUT_RANGE, HEARTBEAT_INTERVAL, MAX_APPEND_BYTES,
    MAX_APPEND_ENTRIES, RPC_TIMEOUT_TICKS, SNAPSHOT_CHUNK_BYTES,
};
use crate::encoding::Value as _;
use crate::errinput;
use crate::error::{Error, Result};

use crossbeam::channel::Sender;
use itertools::Itertools as _;
use log::{debug, info, warn};
use rand::Rng as _;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// A commit notification delivered to the host, in strict index order. A
/// dedicated delivery worker drains these so host code stays off the
/// engine's critical path.
#[derive(Debug)]
pub enum Apply {
    /// Newly committed entries, contiguous and ascending.
    Entries(Vec<Entry>),
    /// The host state was superseded by a snapshot at the given index.
    /// Entries at or below it will not be delivered.
    Snapshot { index: Index, data: Vec<u8> },
}

/// Raft engine options.
#[derive(Clone)]
pub struct Options {
    /// The number of ticks between leader heartbeats.
    pub heartbeat_interval: Ticks,
    /// The range of randomized election timeouts, in ticks.
    pub election_timeout_range: std::ops::Range<Ticks>,
    /// Maximum number of entries in a single Append message.
    pub max_append_entries: usize,
    /// Maximum total payload bytes in a single Append message.
    pub max_append_bytes: u64,
    /// Snapshot transfer chunk size, in bytes.
    pub snapshot_chunk_bytes: u64,
    /// The wall-clock duration of a tick in milliseconds, used to advance
    /// the cluster time stamped onto entries.
    pub tick_millis: u64,
    /// This server's own address list, recorded when bootstrapping.
    pub addresses: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            election_timeout_range: ELECTION_TIMEOUT_RANGE,
            max_append_entries: MAX_APPEND_ENTRIES,
            max_append_bytes: MAX_APPEND_BYTES,
            snapshot_chunk_bytes: SNAPSHOT_CHUNK_BYTES,
            tick_millis: 100,
            addresses: String::new(),
        }
    }
}

/// A Raft node, with a dynamic role. The node is driven synchronously by
/// processing inbound messages via step() or by advancing time via tick().
/// These methods consume the current node and return a new one with a
/// possibly different role. Outbound messages are sent via the node_tx
/// channel, and committed entries are handed to the host via apply_tx.
///
/// This enum wraps the RawNode<Role> types, which implement the actual node
/// logic, for ergonomic use across role transitions.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new Raft node. It starts as a leaderless follower, or
    /// campaigns immediately if it is the only voter in the configuration.
    pub fn new(
        id: ServerId,
        log: Log,
        snapshots: Arc<Mutex<Box<dyn snapshot::Store>>>,
        node_tx: Sender<Envelope>,
        apply_tx: Sender<Apply>,
        opts: Options,
    ) -> Result<Self> {
        assert_ne!(id, 0, "server id must be nonzero");
        let node = RawNode::new(id, log, snapshots, node_tx, apply_tx, opts)?;
        if node.sole_voter() {
            return node.into_candidate();
        }
        Ok(node.into())
    }

    /// Returns the node id.
    pub fn id(&self) -> ServerId {
        match self {
            Node::Candidate(n) => n.id,
            Node::Follower(n) => n.id,
            Node::Leader(n) => n.id,
        }
    }

    /// Returns the node's current term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term(),
            Node::Follower(n) => n.term(),
            Node::Leader(n) => n.term(),
        }
    }

    /// Returns the peers this node currently replicates to or from: the
    /// active configuration's members, plus any servers catching up during a
    /// membership change. The transport uses this as its address book.
    pub fn peer_addresses(&self) -> Vec<Member> {
        match self {
            Node::Candidate(n) => n.config_peers(None),
            Node::Follower(n) => n.config_peers(None),
            Node::Leader(n) => n.config_peers(n.role.change.as_ref().map(|c| &c.new)),
        }
    }

    /// Processes an inbound message.
    pub fn step(self, msg: Envelope) -> Result<Self> {
        debug!("Stepping {msg:?}");
        match self {
            Node::Candidate(n) => n.step(msg),
            Node::Follower(n) => n.step(msg),
            Node::Leader(n) => n.step(msg),
        }
    }

    /// Moves time forward by a tick.
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.tick(),
            Node::Follower(n) => n.tick(),
            Node::Leader(n) => n.tick(),
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A Raft role: leader, follower, or candidate.
pub trait Role {}

/// A Raft node with the concrete role R. Individual roles are encoded in the
/// type (the typestate pattern), so e.g. leader-only state and behavior is
/// only reachable on RawNode<Leader>.
pub struct RawNode<R: Role = Follower> {
    id: ServerId,
    log: Log,
    snapshots: Arc<Mutex<Box<dyn snapshot::Store>>>,
    configs: Configs,
    node_tx: Sender<Envelope>,
    apply_tx: Sender<Apply>,
    /// The highest index delivered to the host.
    applied_index: Index,
    /// The cluster time clock, in milliseconds. Advanced by ticks on the
    /// leader and stamped onto appended entries; followers adopt the largest
    /// value they observe in replicated entries.
    cluster_time: u64,
    opts: Options,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            log: self.log,
            snapshots: self.snapshots,
            configs: self.configs,
            node_tx: self.node_tx,
            apply_tx: self.apply_tx,
            applied_index: self.applied_index,
            cluster_time: self.cluster_time,
            opts: self.opts,
            role,
        }
    }

    /// Returns the node's current term.
    fn term(&self) -> Term {
        self.log.get_term().0
    }

    /// Whether this node is the only voter in the active configuration.
    fn sole_voter(&self) -> bool {
        match self.configs.active() {
            Some((_, config)) => {
                config.contains(self.id) && config.has_quorum(&[self.id].into_iter().collect())
            }
            None => false,
        }
    }

    /// Whether this node is a member of the active configuration.
    fn is_member(&self) -> bool {
        self.configs.active().map(|(_, c)| c.contains(self.id)).unwrap_or(false)
    }

    /// Returns the active configuration's members except this node, plus any
    /// extra members (catch-up targets), deduplicated.
    fn config_peers(&self, extra: Option<&SimpleConfiguration>) -> Vec<Member> {
        let mut seen = HashSet::new();
        let mut members = Vec::new();
        if let Some((_, config)) = self.configs.active() {
            for member in config.members() {
                if member.id != self.id && seen.insert(member.id) {
                    members.push(member.clone());
                }
            }
        }
        if let Some(extra) = extra {
            for member in &extra.members {
                if member.id != self.id && seen.insert(member.id) {
                    members.push(member.clone());
                }
            }
        }
        members
    }

    /// Sends a message to the given recipient.
    fn send(&self, to: ServerId, message: Message) -> Result<()> {
        Self::send_with(&self.node_tx, Envelope { from: self.id, to, term: self.term(), message })
    }

    /// Sends a message without borrowing self, to allow partial borrows.
    fn send_with(tx: &Sender<Envelope>, envelope: Envelope) -> Result<()> {
        debug!("Sending {envelope:?}");
        Ok(tx.send(envelope)?)
    }

    /// Broadcasts a message to all peers in the active configuration.
    fn broadcast(&self, message: Message) -> Result<()> {
        for member in self.config_peers(None).iter().sorted_by_key(|m| m.id) {
            self.send(member.id, message.clone())?;
        }
        Ok(())
    }

    /// Responds to a client request, routed back via the local server.
    fn respond(&self, id: RequestId, response: Result<Response>) -> Result<()> {
        Self::send_with(
            &self.node_tx,
            Envelope {
                from: self.id,
                to: self.id,
                term: self.term(),
                message: Message::ClientResponse { id, response },
            },
        )
    }

    /// Generates a randomized election timeout.
    fn gen_election_timeout(&self) -> Ticks {
        rand::thread_rng().gen_range(self.opts.election_timeout_range.clone())
    }

    /// Asserts message invariants when stepping.
    fn assert_step(&self, msg: &Envelope) {
        assert_eq!(msg.to, self.id, "message for other node");
        assert_ne!(msg.from, 0, "message from unidentified node");
    }

    /// Delivers any committed but undelivered entries to the host, in order.
    fn maybe_apply(&mut self) -> Result<()> {
        let mut batch = Vec::new();
        let mut scan = self.log.scan_apply(self.applied_index);
        while let Some(entry) = scan.next().transpose()? {
            batch.push(entry);
        }
        drop(scan);
        let Some(last) = batch.last() else { return Ok(()) };
        self.applied_index = last.index;
        debug!("Delivering {} committed entries through {}", batch.len(), self.applied_index);
        Ok(self.apply_tx.send(Apply::Entries(batch))?)
    }

    /// Handles a BeginSnapshot request: validates the snapshot point and
    /// returns the metadata the host's snapshot writer must be bound to.
    fn begin_snapshot(&mut self, until: Index) -> Result<Response> {
        let (snapshot_index, _) = self.log.get_snapshot_index();
        if until == 0 || until <= snapshot_index {
            return errinput!("snapshot index {until} is already covered");
        }
        if until > self.applied_index {
            return errinput!("snapshot index {until} has not been delivered to the host");
        }
        let term = self.log.term_of(until)?.expect("delivered entry missing");
        let Some((config_index, config)) = self.configs.at(until).cloned() else {
            return errinput!("no configuration at index {until}");
        };
        Ok(Response::BeginSnapshot(snapshot::Meta { index: until, term, config_index, config }))
    }

    /// Handles a CompleteSnapshot request after the host saved its snapshot
    /// writer: compacts the log prefix the snapshot covers.
    fn complete_snapshot(&mut self, index: Index) -> Result<Response> {
        let Some(meta) = self.snapshots.lock()?.installed()? else {
            return errinput!("no snapshot installed");
        };
        if meta.index != index {
            return errinput!("installed snapshot is at index {}, not {index}", meta.index);
        }
        if index > self.applied_index {
            return errinput!("snapshot index {index} has not been delivered to the host");
        }
        self.log.compact(&meta)?;
        info!("Compacted log through index {index}");
        Ok(Response::CompleteSnapshot)
    }
}

/// A follower replicates state from a leader.
pub struct Follower {
    /// The leader, or None if just initialized.
    leader: Option<ServerId>,
    /// The number of ticks since the last message from the leader, or since
    /// the last granted vote.
    leader_seen: Ticks,
    /// The leader_seen timeout before triggering an election.
    election_timeout: Ticks,
    /// An in-progress snapshot transfer from the leader.
    staging: Option<Box<dyn snapshot::Writer>>,
}

impl Follower {
    fn new(leader: Option<ServerId>, election_timeout: Ticks) -> Self {
        Self { leader, leader_seen: 0, election_timeout, staging: None }
    }
}

impl Role for Follower {}

impl RawNode<Follower> {
    /// Creates a new node as a leaderless follower, replaying the installed
    /// snapshot and any committed entries to the host.
    fn new(
        id: ServerId,
        mut log: Log,
        snapshots: Arc<Mutex<Box<dyn snapshot::Store>>>,
        node_tx: Sender<Envelope>,
        apply_tx: Sender<Apply>,
        opts: Options,
    ) -> Result<Self> {
        let configs =
            Configs::new(log.get_snapshot_config().cloned(), log.scan_configurations()?);
        let (snapshot_index, _) = log.get_snapshot_index();
        let cluster_time =
            log.get(log.get_last_index().0)?.map(|e| e.cluster_time).unwrap_or_default();
        let role = Follower::new(None, 0);
        let mut node = RawNode {
            id,
            log,
            snapshots,
            configs,
            node_tx,
            apply_tx,
            applied_index: snapshot_index,
            cluster_time,
            opts,
            role,
        };
        node.role.election_timeout = node.gen_election_timeout();

        // Replay state to the host: exactly once per boot-lifetime, starting
        // from the snapshot and then the committed log suffix.
        if snapshot_index > 0 {
            let (_, data) = node.snapshots.lock()?.read()?;
            node.apply_tx.send(Apply::Snapshot { index: snapshot_index, data })?;
        }
        node.maybe_apply()?;
        Ok(node)
    }

    /// Transitions the follower into a candidate and campaigns, winning
    /// outright if it is the only voter.
    fn into_candidate(mut self) -> Result<Node> {
        if let Some(writer) = self.role.staging.take() {
            writer.discard()?;
        }
        // Deliver any pending commits, so we're caught up if we win.
        self.maybe_apply()?;

        let election_timeout = self.gen_election_timeout();
        let mut node = self.into_role(Candidate::new(election_timeout));
        node.campaign()?;
        node.check_election()
    }

    /// Transitions the follower into a follower: either one following a
    /// newly discovered leader in the current term, or a leaderless one in a
    /// newly discovered term.
    fn into_follower(mut self, leader: Option<ServerId>, term: Term) -> Result<Self> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);

        if let Some(leader) = leader {
            assert_eq!(term, self.term(), "can't follow leader in different term");
            assert_eq!(self.role.leader, None, "already have leader in term");
            info!("Following leader {leader} in term {term}");
            self.role = Follower {
                leader: Some(leader),
                leader_seen: 0,
                election_timeout: self.role.election_timeout,
                staging: self.role.staging.take(),
            };
        } else {
            assert_ne!(term, self.term(), "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.log.set_term(term, None)?;
            if let Some(writer) = self.role.staging.take() {
                writer.discard()?;
            }
            let election_timeout = self.gen_election_timeout();
            self.role = Follower::new(None, election_timeout);
        }
        Ok(self)
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert_step(&msg);

        // Replies to stale-term requests carry our term, stepping the sender
        // down; other stale messages are dropped.
        if msg.term < self.term() {
            return self.reply_stale(msg);
        }
        if msg.term > self.term() {
            return self.into_follower(None, msg.term)?.step(msg);
        }

        match msg.message {
            Message::Append { base_index, base_term, commit_index, entries } => {
                match self.role.leader {
                    Some(leader) => assert_eq!(msg.from, leader, "multiple leaders in term"),
                    None => self = self.into_follower(Some(msg.from), msg.term)?,
                }
                self.role.leader_seen = 0;
                self.handle_append(msg.from, base_index, base_term, commit_index, entries)?;
            }

            Message::Snapshot { last_index, last_term, offset, data, done } => {
                match self.role.leader {
                    Some(leader) => assert_eq!(msg.from, leader, "multiple leaders in term"),
                    None => self = self.into_follower(Some(msg.from), msg.term)?,
                }
                self.role.leader_seen = 0;
                self.handle_snapshot(msg.from, last_index, last_term, offset, data, done)?;
            }

            Message::Campaign { last_index, last_term } => {
                self.handle_campaign(msg.from, last_index, last_term)?;
            }

            // We may receive votes after losing an election and following a
            // new leader. Ignore them.
            Message::CampaignResponse { .. } => {}

            // Stale replies can arrive after we stepped down from an earlier
            // leadership in this term. Ignore them.
            Message::AppendResponse { .. } | Message::SnapshotResponse { .. } => {
                debug!("Ignoring stale reply {msg:?}");
            }

            Message::ClientRequest { id, request } => return self.handle_client_request(id, request),

            Message::ClientResponse { .. } => debug!("Ignoring unexpected response {msg:?}"),
        }
        Ok(self.into())
    }

    /// Replies to requests from stale terms so the sender steps down, and
    /// drops everything else.
    fn reply_stale(self, msg: Envelope) -> Result<Node> {
        match msg.message {
            Message::Campaign { .. } => {
                self.send(msg.from, Message::CampaignResponse { granted: false })?;
            }
            Message::Append { .. } => {
                let (last_index, _) = self.log.get_last_index();
                self.send(
                    msg.from,
                    Message::AppendResponse { outcome: AppendOutcome::TermStale, last_index },
                )?;
            }
            Message::Snapshot { .. } => {
                self.send(msg.from, Message::SnapshotResponse { stored: 0 })?;
            }
            _ => debug!("Dropping message from past term: {msg:?}"),
        }
        Ok(self.into())
    }

    /// Processes an AppendEntries request from the leader.
    fn handle_append(
        &mut self,
        from: ServerId,
        base_index: Index,
        base_term: Term,
        commit_index: Index,
        mut entries: Vec<Entry>,
    ) -> Result<()> {
        if let Some(first) = entries.first() {
            assert_eq!(first.index, base_index + 1, "entries do not follow base index");
        }
        let (snapshot_index, _) = self.log.get_snapshot_index();
        let (last_index, _) = self.log.get_last_index();

        // A base below our snapshot is committed state and necessarily
        // matches; otherwise the base entry must match our log, with the
        // snapshot standing in for its last included entry.
        let matches = base_index < snapshot_index || self.log.has(base_index, base_term)?;
        if !matches {
            let hint = if base_index > last_index {
                last_index
            } else {
                // Back up over the entire conflicting term, so the leader
                // skips it in one round. Never back up into committed state.
                let conflict_term = self.log.term_of(base_index)?.expect("missing entry");
                let floor = self.log.get_commit_index().0;
                let mut hint = base_index - 1;
                while hint > floor && self.log.term_of(hint)? == Some(conflict_term) {
                    hint -= 1;
                }
                hint
            };
            self.send(
                from,
                Message::AppendResponse { outcome: AppendOutcome::LogMismatch, last_index: hint },
            )?;
            return Ok(());
        }

        // Drop entries already covered by the snapshot.
        entries.retain(|e| e.index > snapshot_index);
        let match_index = entries.last().map(|e| e.index).unwrap_or(base_index.max(snapshot_index));
        if let Some(time) = entries.last().map(|e| e.cluster_time) {
            self.cluster_time = self.cluster_time.max(time);
        }

        // Figure out which entries will actually be written (the first whose
        // term differs from what we have), to keep the configuration view in
        // sync with the log through conflict truncation.
        let mut written_from = None;
        for entry in &entries {
            if self.log.term_of(entry.index)? != Some(entry.term) {
                written_from = Some(entry.index);
                break;
            }
        }
        let mut new_configs = Vec::new();
        if let Some(from_index) = written_from {
            for entry in &entries {
                if entry.index >= from_index && entry.kind == EntryKind::Configuration {
                    new_configs.push((entry.index, entry.configuration()?));
                }
            }
            self.configs.truncate(from_index - 1);
        }

        self.log.splice(entries)?;
        for (index, config) in new_configs {
            info!("Adopting configuration at index {index}");
            self.configs.push(index, config);
        }

        // Advance the commit index to what the leader has committed within
        // the matched prefix, and deliver to the host.
        let new_commit = commit_index.min(match_index);
        if new_commit > self.log.get_commit_index().0 {
            self.log.commit(new_commit)?;
            self.maybe_apply()?;
        }

        self.send(
            from,
            Message::AppendResponse { outcome: AppendOutcome::Ok, last_index: match_index },
        )
    }

    /// Processes an InstallSnapshot chunk from the leader.
    fn handle_snapshot(
        &mut self,
        from: ServerId,
        last_index: Index,
        last_term: Term,
        offset: u64,
        data: Vec<u8>,
        done: bool,
    ) -> Result<()> {
        let (snapshot_index, _) = self.log.get_snapshot_index();
        let (commit_index, _) = self.log.get_commit_index();

        // Our state already covers this snapshot. Acknowledge the chunks so
        // the leader completes the transfer and resumes appends.
        if last_index <= snapshot_index || last_index <= commit_index {
            self.send(from, Message::SnapshotResponse { stored: offset + data.len() as u64 })?;
            return Ok(());
        }

        if offset == 0 {
            if let Some(writer) = self.role.staging.take() {
                writer.discard()?;
            }
            self.role.staging = Some(self.snapshots.lock()?.staging()?);
        }
        let Some(writer) = self.role.staging.as_mut() else {
            // We have no staging in progress; ask the leader to restart.
            self.send(from, Message::SnapshotResponse { stored: 0 })?;
            return Ok(());
        };

        // The staged size is authoritative; on a mismatched offset report it
        // so the leader resumes from there.
        if writer.written() != offset {
            let stored = writer.written();
            self.send(from, Message::SnapshotResponse { stored })?;
            return Ok(());
        }

        writer.append(&data)?;
        let stored = writer.written();

        if done {
            let writer = self.role.staging.take().expect("no staging writer");
            writer.save()?;
            let (meta, state) = self.snapshots.lock()?.read()?;
            if meta.index != last_index || meta.term != last_term {
                // The file header is authoritative; this only happens if the
                // leader's snapshot changed mid-transfer.
                warn!(
                    "Snapshot header {}@{} does not match transfer {last_index}@{last_term}",
                    meta.index, meta.term
                );
            }
            self.log.install_snapshot(&meta)?;
            self.configs =
                Configs::new(self.log.get_snapshot_config().cloned(), self.log.scan_configurations()?);
            info!("Installed snapshot through index {} from server {from}", meta.index);
            if self.applied_index < meta.index {
                self.apply_tx.send(Apply::Snapshot { index: meta.index, data: state })?;
                self.applied_index = meta.index;
            }
            self.maybe_apply()?;
        }

        self.send(from, Message::SnapshotResponse { stored })
    }

    /// Processes a RequestVote solicitation from a candidate.
    fn handle_campaign(&mut self, from: ServerId, last_index: Index, last_term: Term) -> Result<()> {
        // Reject if we already voted for someone else in this term.
        if let (_, Some(vote)) = self.log.get_term() {
            if from != vote {
                return self.send(from, Message::CampaignResponse { granted: false });
            }
        }

        // Reject if our log is more up-to-date than the candidate's.
        let (our_index, our_term) = self.log.get_last_index();
        if last_term < our_term || (last_term == our_term && last_index < our_index) {
            return self.send(from, Message::CampaignResponse { granted: false });
        }

        // Grant the vote: persist it first, and reset the election timer.
        info!("Voting for {from} in term {} election", self.term());
        self.log.set_term(self.term(), Some(from))?;
        self.role.leader_seen = 0;
        self.send(from, Message::CampaignResponse { granted: true })
    }

    /// Processes a client request. Everything that needs a leader is
    /// rejected with a leader hint; bootstrap and snapshot housekeeping are
    /// handled locally.
    fn handle_client_request(mut self, id: RequestId, request: Request) -> Result<Node> {
        match request {
            Request::Bootstrap => {
                let result = self.bootstrap();
                let bootstrapped = result.is_ok();
                self.respond(id, result.map(|()| Response::Bootstrap))?;
                if bootstrapped {
                    // The new configuration names only this server; win the
                    // resulting election immediately.
                    return self.into_candidate();
                }
            }
            Request::BeginSnapshot { until } => {
                let response = self.begin_snapshot(until);
                self.respond(id, response)?;
            }
            Request::CompleteSnapshot { index } => {
                let response = self.complete_snapshot(index);
                self.respond(id, response)?;
            }
            Request::Replicate(_)
            | Request::GetConfiguration
            | Request::SetConfiguration { .. }
            | Request::GetLastCommitIndex => {
                self.respond(id, Err(Error::NotLeader(self.role.leader)))?;
            }
            Request::GetServerInfo | Request::VerifyRecipient { .. } => {
                self.respond(id, errinput!("request is handled by the server dispatch"))?;
            }
        }
        Ok(self.into())
    }

    /// Bootstraps the first cluster: on a completely empty server, writes
    /// term 1 and a configuration entry naming just this server.
    fn bootstrap(&mut self) -> Result<()> {
        if self.term() != 0
            || self.log.get_last_index().0 != 0
            || self.configs.active().is_some()
        {
            return errinput!("cluster is already initialized");
        }
        self.log.set_term(1, None)?;
        let config = Configuration::Simple(SimpleConfiguration::new(vec![Member {
            id: self.id,
            addresses: self.opts.addresses.clone(),
        }]));
        let index =
            self.log.append(EntryKind::Configuration, config.encode()?, self.cluster_time)?;
        self.configs.push(index, config);
        info!("Bootstrapped cluster with server {}", self.id);
        Ok(())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.cluster_time += self.opts.tick_millis;
        self.role.leader_seen = self.role.leader_seen.saturating_add(1);
        if self.role.leader_seen >= self.role.election_timeout {
            // Only voters campaign; servers outside the configuration (not
            // yet added, or removed) wait to hear from a leader.
            if self.is_member() {
                return self.into_candidate();
            }
            self.role.leader_seen = 0;
        }
        Ok(self.into())
    }
}

/// A candidate is campaigning to become a leader.
pub struct Candidate {
    /// Votes received, including our own.
    votes: HashSet<ServerId>,
    /// Ticks elapsed since the election started.
    election_duration: Ticks,
    /// The election timeout before a new campaign is started.
    election_timeout: Ticks,
}

impl Candidate {
    fn new(election_timeout: Ticks) -> Self {
        Self { votes: HashSet::new(), election_duration: 0, election_timeout }
    }
}

impl Role for Candidate {}

impl RawNode<Candidate> {
    /// Campaigns for leadership: increments the term, votes for ourself, and
    /// solicits votes from all peers.
    fn campaign(&mut self) -> Result<()> {
        assert!(self.is_member(), "only configuration members campaign");
        let term = self.term() + 1;
        info!("Starting election for term {term}");
        self.role = Candidate::new(self.gen_election_timeout());
        self.role.votes.insert(self.id);
        self.log.set_term(term, Some(self.id))?;
        let (last_index, last_term) = self.log.get_last_index();
        self.broadcast(Message::Campaign { last_index, last_term })
    }

    /// Checks whether the received votes form a quorum of the active
    /// configuration (both sets, if transitional), and if so assumes
    /// leadership.
    fn check_election(self) -> Result<Node> {
        let won = match self.configs.active() {
            Some((_, config)) => config.has_quorum(&self.role.votes),
            None => false,
        };
        if won {
            return Ok(self.into_leader()?.into());
        }
        Ok(self.into())
    }

    /// Transitions the candidate to a follower: either we lost the election
    /// to a leader in this term, or we discovered a new term.
    fn into_follower(mut self, leader: Option<ServerId>, term: Term) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);

        let election_timeout = self.gen_election_timeout();
        if let Some(leader) = leader {
            assert_eq!(term, self.term(), "can't follow leader in different term");
            info!("Lost election, following leader {leader} in term {term}");
            Ok(self.into_role(Follower::new(Some(leader), election_timeout)))
        } else {
            assert_ne!(term, self.term(), "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.log.set_term(term, None)?;
            Ok(self.into_role(Follower::new(None, election_timeout)))
        }
    }

    /// Transitions the candidate to a leader: initializes peer progress,
    /// appends a NOOP entry to commit an entry in the new term, and
    /// heartbeats to assert leadership.
    fn into_leader(self) -> Result<RawNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term());
        let (last_index, _) = self.log.get_last_index();
        let peers: Vec<ServerId> = self.config_peers(None).iter().map(|m| m.id).collect();
        let mut node = self.into_role(Leader::new(&peers, last_index));

        node.propose(EntryKind::Noop, Vec::new())?;
        node.maybe_commit_and_apply()?;
        node.heartbeat()?;
        Ok(node)
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert_step(&msg);

        if msg.term < self.term() {
            return self.reply_stale(msg);
        }
        if msg.term > self.term() {
            return self.into_follower(None, msg.term)?.step(msg);
        }

        match msg.message {
            // Another candidate in this term won't get our vote; we voted
            // for ourself.
            Message::Campaign { .. } => {
                self.send(msg.from, Message::CampaignResponse { granted: false })?;
            }

            Message::CampaignResponse { granted: true } => {
                self.role.votes.insert(msg.from);
                return self.check_election();
            }

            Message::CampaignResponse { granted: false } => {}

            // A leader in this term means we lost the election. Follow it
            // and step the message.
            Message::Append { .. } | Message::Snapshot { .. } => {
                return self.into_follower(Some(msg.from), msg.term)?.step(msg);
            }

            Message::AppendResponse { .. } | Message::SnapshotResponse { .. } => {
                debug!("Ignoring stale reply {msg:?}");
            }

            Message::ClientRequest { id, request } => {
                self.handle_client_request(id, request)?;
            }

            Message::ClientResponse { .. } => debug!("Ignoring unexpected response {msg:?}"),
        }
        Ok(self.into())
    }

    /// Replies to requests from stale terms so the sender steps down.
    fn reply_stale(self, msg: Envelope) -> Result<Node> {
        match msg.message {
            Message::Campaign { .. } => {
                self.send(msg.from, Message::CampaignResponse { granted: false })?;
            }
            Message::Append { .. } => {
                let (last_index, _) = self.log.get_last_index();
                self.send(
                    msg.from,
                    Message::AppendResponse { outcome: AppendOutcome::TermStale, last_index },
                )?;
            }
            Message::Snapshot { .. } => {
                self.send(msg.from, Message::SnapshotResponse { stored: 0 })?;
            }
            _ => debug!("Dropping message from past term: {msg:?}"),
        }
        Ok(self.into())
    }

    /// Processes a client request. There is no leader during an election, so
    /// everything leader-bound is rejected without a hint.
    fn handle_client_request(&mut self, id: RequestId, request: Request) -> Result<()> {
        match request {
            Request::BeginSnapshot { until } => {
                let response = self.begin_snapshot(until);
                self.respond(id, response)
            }
            Request::CompleteSnapshot { index } => {
                let response = self.complete_snapshot(index);
                self.respond(id, response)
            }
            Request::Bootstrap => self.respond(id, errinput!("cluster is already initialized")),
            Request::GetServerInfo | Request::VerifyRecipient { .. } => {
                self.respond(id, errinput!("request is handled by the server dispatch"))
            }
            _ => self.respond(id, Err(Error::NotLeader(None))),
        }
    }

    /// Processes a logical clock tick. If the election times out without a
    /// winner, campaign again in a new term.
    fn tick(mut self) -> Result<Node> {
        self.cluster_time += self.opts.tick_millis;
        self.role.election_duration += 1;
        if self.role.election_duration >= self.role.election_timeout {
            self.campaign()?;
            return self.check_election();
        }
        Ok(self.into())
    }
}

/// Follower replication progress, tracked by the leader.
struct Progress {
    /// The next log index to send.
    next_index: Index,
    /// The highest index known to be replicated on the follower.
    match_index: Index,
    /// Ticks since the follower last acknowledged anything in this term.
    /// Feeds the leader's step-down deadline and read confidence.
    since_ack: Ticks,
    /// An in-flight snapshot transfer, when the follower's log is behind
    /// our snapshot.
    transfer: Option<Transfer>,
}

impl Progress {
    fn new(next_index: Index) -> Self {
        Self { next_index, match_index: 0, since_ack: 0, transfer: None }
    }
}

/// An in-flight snapshot transfer to a follower.
struct Transfer {
    /// The snapshot's last included index.
    last_index: Index,
    /// The snapshot's last included term.
    last_term: Term,
    /// The next file offset to send.
    offset: u64,
    /// The total snapshot file size.
    size: u64,
    /// Ticks since the last chunk was sent or acknowledged; chunks are
    /// resent after an RPC timeout.
    idle: Ticks,
    /// Whether the final chunk has been sent.
    done_sent: bool,
}

impl Transfer {
    fn new(last_index: Index, last_term: Term, size: u64) -> Self {
        Self { last_index, last_term, offset: 0, size, idle: 0, done_sent: false }
    }
}

/// A pending replicate request, answered when its entry commits.
struct PendingWrite {
    id: RequestId,
}

/// An in-progress membership change. At most one at a time.
struct ConfigChange {
    /// The client request to answer when the change completes.
    id: RequestId,
    /// The target configuration.
    new: SimpleConfiguration,
    /// The current phase.
    phase: Phase,
}

enum Phase {
    /// New servers are being shadow-replicated to, without counting in
    /// quorums, until they are caught up.
    CatchUp { targets: HashMap<ServerId, CatchUp> },
    /// The transitional (joint) configuration entry has been appended at the
    /// given index; waiting for it to commit.
    Joint { index: Index },
    /// The final simple configuration entry has been appended at the given
    /// index; waiting for it to commit.
    Final { index: Index },
}

/// Catch-up state for one new server. A round ends when the server reaches
/// the log head observed at the round's start; the server is caught up once
/// a round completes within an election timeout.
struct CatchUp {
    round: u8,
    round_end: Index,
    ticks: Ticks,
}

/// A leader serves requests and replicates the log to followers.
pub struct Leader {
    /// Replication progress of the active configuration's members.
    progress: HashMap<ServerId, Progress>,
    /// Replication progress of catch-up targets that are not yet members.
    /// They receive entries but never count towards quorums.
    learners: HashMap<ServerId, Progress>,
    /// Pending replicate requests, keyed by their entry's index.
    writes: HashMap<Index, PendingWrite>,
    /// The in-progress membership change, if any.
    change: Option<ConfigChange>,
    /// Ticks since the last periodic heartbeat.
    since_heartbeat: Ticks,
    /// Set when the leader must step down (e.g. removed by a membership
    /// change); acted on after the current message is processed.
    step_down: bool,
}

impl Leader {
    fn new(peers: &[ServerId], last_index: Index) -> Self {
        let progress =
            peers.iter().map(|id| (*id, Progress::new(last_index + 1))).collect();
        Self {
            progress,
            learners: HashMap::new(),
            writes: HashMap::new(),
            change: None,
            since_heartbeat: 0,
            step_down: false,
        }
    }
}

impl Role for Leader {}

/// Looks up a peer's progress, whether member or learner.
fn progress_ref(role: &Leader, id: ServerId) -> Option<&Progress> {
    role.progress.get(&id).or_else(|| role.learners.get(&id))
}

/// Mutably looks up a peer's progress, whether member or learner.
fn progress_mut(role: &mut Leader, id: ServerId) -> Option<&mut Progress> {
    if role.progress.contains_key(&id) {
        role.progress.get_mut(&id)
    } else {
        role.learners.get_mut(&id)
    }
}

impl RawNode<Leader> {
    /// Transitions the leader to a follower after discovering a new term,
    /// aborting all pending client requests.
    fn into_follower(mut self, term: Term) -> Result<RawNode<Follower>> {
        assert!(term > self.term(), "can only become follower in a later term");
        info!("Discovered new term {term}, stepping down");
        self.abort_requests()?;
        self.log.set_term(term, None)?;
        let election_timeout = self.gen_election_timeout();
        Ok(self.into_role(Follower::new(None, election_timeout)))
    }

    /// Steps down within the current term (lost quorum support, or removed
    /// by a membership change), aborting all pending client requests.
    fn into_follower_same_term(mut self) -> Result<RawNode<Follower>> {
        self.abort_requests()?;
        let election_timeout = self.gen_election_timeout();
        Ok(self.into_role(Follower::new(None, election_timeout)))
    }

    /// Aborts pending writes and any membership change; the clients must
    /// retry against the new leader.
    fn abort_requests(&mut self) -> Result<()> {
        let writes = std::mem::take(&mut self.role.writes);
        for write in writes.into_values().sorted_by(|a, b| a.id.cmp(&b.id)) {
            self.respond(write.id, Err(Error::NotLeader(None)))?;
        }
        if let Some(change) = self.role.change.take() {
            self.respond(change.id, Err(Error::NotLeader(None)))?;
        }
        Ok(())
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert_step(&msg);

        if msg.term < self.term() {
            return self.reply_stale(msg);
        }
        if msg.term > self.term() {
            return self.into_follower(msg.term)?.step(msg);
        }

        match msg.message {
            // Election Safety: there can't be two leaders in one term.
            Message::Append { .. } | Message::Snapshot { .. } => {
                panic!("saw other leader {} in term {}", msg.from, msg.term);
            }

            Message::Campaign { .. } => {
                self.send(msg.from, Message::CampaignResponse { granted: false })?;
            }

            // Votes may straggle in after we won. Ignore them.
            Message::CampaignResponse { .. } => {}

            Message::AppendResponse { outcome, last_index } => {
                self.handle_append_response(msg.from, outcome, last_index)?;
            }

            Message::SnapshotResponse { stored } => {
                self.handle_snapshot_response(msg.from, stored)?;
            }

            Message::ClientRequest { id, request } => {
                self.handle_client_request(id, request)?;
            }

            Message::ClientResponse { .. } => debug!("Ignoring unexpected response {msg:?}"),
        }

        if self.role.step_down {
            return Ok(self.into_follower_same_term()?.into());
        }
        Ok(self.into())
    }

    /// Replies to requests from stale terms so the sender steps down.
    fn reply_stale(self, msg: Envelope) -> Result<Node> {
        match msg.message {
            Message::Campaign { .. } => {
                self.send(msg.from, Message::CampaignResponse { granted: false })?;
            }
            Message::Append { .. } => {
                let (last_index, _) = self.log.get_last_index();
                self.send(
                    msg.from,
                    Message::AppendResponse { outcome: AppendOutcome::TermStale, last_index },
                )?;
            }
            Message::Snapshot { .. } => {
                self.send(msg.from, Message::SnapshotResponse { stored: 0 })?;
            }
            _ => debug!("Dropping message from past term: {msg:?}"),
        }
        Ok(self.into())
    }

    /// Processes an AppendEntries reply.
    fn handle_append_response(
        &mut self,
        from: ServerId,
        outcome: AppendOutcome,
        last_index: Index,
    ) -> Result<()> {
        let (our_last, _) = self.log.get_last_index();
        let Some(progress) = progress_mut(&mut self.role, from) else {
            debug!("Ignoring reply from unknown peer {from}");
            return Ok(());
        };
        progress.since_ack = 0;

        match outcome {
            AppendOutcome::Ok => {
                assert!(last_index <= our_last, "follower matched unknown index {last_index}");
                let advanced = last_index > progress.match_index;
                if advanced {
                    progress.match_index = last_index;
                    progress.next_index = progress.next_index.max(last_index + 1);
                }
                if advanced {
                    self.maybe_commit_and_apply()?;
                    self.advance_catchup(from)?;
                }
                // Eagerly send any further entries; a lagging peer catches up
                // one batch at a time.
                self.maybe_send_append(from, false)?;
            }
            AppendOutcome::LogMismatch => {
                // Fast backup: resume from the follower's non-conflicting
                // prefix. This may regress below match_index if the follower
                // lost its log; the snapshot path then takes over.
                progress.next_index = (last_index + 1).min(our_last + 1);
                self.maybe_send_append(from, false)?;
            }
            // A stale-term nack in our own term would imply the follower saw
            // a higher term, which the envelope handling already covers.
            AppendOutcome::TermStale => debug!("Ignoring stale-term nack from {from}"),
        }
        Ok(())
    }

    /// Processes an InstallSnapshot reply, advancing or completing the
    /// chunked transfer.
    fn handle_snapshot_response(&mut self, from: ServerId, stored: u64) -> Result<()> {
        let Some(progress) = progress_mut(&mut self.role, from) else {
            debug!("Ignoring reply from unknown peer {from}");
            return Ok(());
        };
        progress.since_ack = 0;
        let Some(transfer) = progress.transfer.as_mut() else {
            debug!("Ignoring snapshot reply from {from} with no transfer in flight");
            return Ok(());
        };
        transfer.idle = 0;

        if transfer.done_sent && stored >= transfer.size {
            // Transfer complete: the follower's log now begins at the
            // snapshot, so replication resumes right after it.
            let index = transfer.last_index;
            progress.transfer = None;
            progress.match_index = progress.match_index.max(index);
            progress.next_index = progress.next_index.max(index + 1);
            info!("Server {from} installed snapshot through index {index}");
            self.maybe_commit_and_apply()?;
            self.advance_catchup(from)?;
            self.maybe_send_append(from, false)?;
        } else {
            // The follower's staged size is authoritative; resume from it.
            transfer.offset = stored;
            transfer.done_sent = false;
            self.send_snapshot_chunk(from)?;
        }
        Ok(())
    }

    /// Processes a client request.
    fn handle_client_request(&mut self, id: RequestId, request: Request) -> Result<()> {
        match request {
            Request::Replicate(payload) => {
                let index = self.propose(EntryKind::Data, payload)?;
                self.role.writes.insert(index, PendingWrite { id });
                if self.role.progress.is_empty() {
                    self.maybe_commit_and_apply()?;
                }
                Ok(())
            }

            Request::GetLastCommitIndex => {
                let response = if self.has_support() {
                    Ok(Response::LastCommitIndex(self.log.get_commit_index().0))
                } else {
                    Err(Error::Retry)
                };
                self.respond(id, response)
            }

            Request::GetConfiguration => {
                let commit_index = self.log.get_commit_index().0;
                let response = match self.stable_simple(commit_index) {
                    Some((index, members)) => {
                        Ok(Response::Configuration { id: index, members: members.members.clone() })
                    }
                    None => Err(Error::Retry),
                };
                self.respond(id, response)
            }

            Request::SetConfiguration { old_id, members } => {
                self.set_configuration(id, old_id, members)
            }

            Request::BeginSnapshot { until } => {
                let response = self.begin_snapshot(until);
                self.respond(id, response)
            }

            Request::CompleteSnapshot { index } => {
                let response = self.complete_snapshot(index);
                self.respond(id, response)
            }

            Request::Bootstrap => self.respond(id, errinput!("cluster is already initialized")),

            Request::GetServerInfo | Request::VerifyRecipient { .. } => {
                self.respond(id, errinput!("request is handled by the server dispatch"))
            }
        }
    }

    /// Returns the stable configuration if it is also the active one, i.e.
    /// no membership change is in flight in the log.
    fn stable_simple(&self, commit_index: Index) -> Option<(Index, &SimpleConfiguration)> {
        match (self.configs.active(), self.configs.stable(commit_index)) {
            (Some((active_index, Configuration::Simple(_))), Some((stable_index, members)))
                if *active_index == stable_index =>
            {
                Some((stable_index, members))
            }
            _ => None,
        }
    }

    /// Starts a membership change towards the given members, catching up any
    /// new servers before the joint configuration is appended.
    fn set_configuration(
        &mut self,
        id: RequestId,
        old_id: Index,
        members: Vec<Member>,
    ) -> Result<()> {
        if self.role.change.is_some() {
            let err = Error::ConfigurationChanged(
                "a configuration change is already in progress".to_string(),
            );
            return self.respond(id, Err(err));
        }
        let commit_index = self.log.get_commit_index().0;
        let Some((stable_id, stable)) = self.stable_simple(commit_index) else {
            // No committed simple configuration is active yet in this term.
            return self.respond(id, Err(Error::Retry));
        };
        if stable_id != old_id {
            let err = Error::ConfigurationChanged(format!(
                "the stable configuration id is {stable_id}, not {old_id}"
            ));
            return self.respond(id, Err(err));
        }
        if members.is_empty() {
            return self.respond(id, errinput!("the new configuration has no members"));
        }
        let mut ids = HashSet::new();
        for member in &members {
            if member.id == 0 || !ids.insert(member.id) {
                return self.respond(id, errinput!("invalid member id {}", member.id));
            }
        }

        let stable = stable.clone();
        let new = SimpleConfiguration::new(members);
        let (last_index, _) = self.log.get_last_index();

        // Shadow-replicate to servers that aren't members yet; they don't
        // count towards quorums until the joint configuration is appended.
        let mut targets = HashMap::new();
        for member in &new.members {
            if member.id != self.id && !stable.contains(member.id) {
                info!("Catching up new server {} before configuration change", member.id);
                self.role.learners.insert(member.id, Progress::new(last_index + 1));
                targets
                    .insert(member.id, CatchUp { round: 1, round_end: last_index, ticks: 0 });
            }
        }
        let catchup_ids: Vec<ServerId> = targets.keys().copied().sorted().collect();
        let ready = targets.is_empty();
        self.role.change = Some(ConfigChange { id, new, phase: Phase::CatchUp { targets } });

        for peer in catchup_ids {
            self.maybe_send_append(peer, true)?;
        }
        if ready {
            self.begin_joint()?;
        }
        Ok(())
    }

    /// Appends the transitional (joint) configuration entry. It takes effect
    /// immediately: quorums now require both the old and new member sets.
    fn begin_joint(&mut self) -> Result<()> {
        let change = self.role.change.as_ref().expect("no configuration change in progress");
        let old = match self.configs.active() {
            Some((_, Configuration::Simple(members))) => members.clone(),
            _ => panic!("active configuration is not simple"),
        };
        let joint = Configuration::Transitional { old, new: change.new.clone() };
        let index = self.propose_config(joint)?;
        info!("Appended transitional configuration at index {index}");
        self.role.change.as_mut().expect("change vanished").phase = Phase::Joint { index };
        self.maybe_commit_and_apply()?;
        Ok(())
    }

    /// Advances the catch-up phase after the given peer's progress moved:
    /// completes rounds, starts new ones, and once every target is caught
    /// up, begins the joint phase.
    fn advance_catchup(&mut self, from: ServerId) -> Result<()> {
        let (last_index, _) = self.log.get_last_index();
        let election_timeout = self.opts.election_timeout_range.start;
        let match_index =
            self.role.learners.get(&from).map(|p| p.match_index).unwrap_or(0);

        let mut ready = false;
        let mut abort = false;
        if let Some(change) = self.role.change.as_mut() {
            if let Phase::CatchUp { targets } = &mut change.phase {
                if let Some(catchup) = targets.get_mut(&from) {
                    if match_index >= catchup.round_end {
                        if catchup.ticks <= election_timeout {
                            // Caught up to within an election timeout of the
                            // log head.
                            info!("Server {from} caught up after {} rounds", catchup.round);
                            targets.remove(&from);
                        } else if catchup.round >= CATCHUP_ROUNDS {
                            abort = true;
                        } else {
                            *catchup = CatchUp {
                                round: catchup.round + 1,
                                round_end: last_index,
                                ticks: 0,
                            };
                        }
                    }
                }
                ready = targets.is_empty();
            }
        }

        if abort {
            return self.abort_catchup();
        }
        if ready {
            return self.begin_joint();
        }
        Ok(())
    }

    /// Aborts an in-progress catch-up phase, reporting the servers that
    /// could not keep up.
    fn abort_catchup(&mut self) -> Result<()> {
        let change = self.role.change.take().expect("no configuration change in progress");
        let Phase::CatchUp { targets } = change.phase else {
            panic!("aborting catch-up in wrong phase")
        };
        let bad: Vec<ServerId> = targets.keys().copied().sorted().collect();
        warn!("Aborting configuration change, servers unable to catch up: {bad:?}");
        for id in &bad {
            self.role.learners.remove(id);
        }
        self.respond(change.id, Err(Error::ConfigurationBad(bad)))
    }

    /// Proposes an entry by appending it to the log and eagerly replicating
    /// it to peers that are in steady state.
    fn propose(&mut self, kind: EntryKind, payload: Vec<u8>) -> Result<Index> {
        let index = self.log.append(kind, payload, self.cluster_time)?;
        for peer in self.peer_ids() {
            if progress_ref(&self.role, peer).map(|p| p.next_index == index).unwrap_or(false) {
                self.maybe_send_append(peer, false)?;
            }
        }
        Ok(index)
    }

    /// Proposes a configuration entry. The configuration takes effect
    /// immediately on append: membership, progress tracking, and quorum
    /// rules all follow it from here on.
    fn propose_config(&mut self, config: Configuration) -> Result<Index> {
        let payload = config.encode()?;
        let index = self.log.append(EntryKind::Configuration, payload, self.cluster_time)?;
        self.configs.push(index, config);
        self.refresh_progress();
        // Replicate to everyone in steady state (refresh may have added
        // members whose progress starts at this entry).
        for peer in self.peer_ids() {
            if progress_ref(&self.role, peer).map(|p| p.next_index == index).unwrap_or(false) {
                self.maybe_send_append(peer, false)?;
            }
        }
        Ok(index)
    }

    /// Reconciles the progress map with the active configuration: members
    /// joining from the learner pool keep their progress, removed members
    /// are dropped.
    fn refresh_progress(&mut self) {
        let (last_index, _) = self.log.get_last_index();
        let members: HashSet<ServerId> = match self.configs.active() {
            Some((_, config)) => {
                config.members().iter().map(|m| m.id).filter(|id| *id != self.id).collect()
            }
            None => HashSet::new(),
        };
        self.role.progress.retain(|id, _| members.contains(id));
        for id in members {
            if !self.role.progress.contains_key(&id) {
                let progress = self
                    .role
                    .learners
                    .remove(&id)
                    .unwrap_or_else(|| Progress::new(last_index + 1));
                self.role.progress.insert(id, progress);
            }
        }
    }

    /// All peers currently tracked (members and learners), sorted.
    fn peer_ids(&self) -> Vec<ServerId> {
        self.role
            .progress
            .keys()
            .chain(self.role.learners.keys())
            .copied()
            .sorted()
            .dedup()
            .collect()
    }

    /// Sends a heartbeat to every peer: an empty Append (or pending
    /// entries), which also resets follower election timers.
    fn heartbeat(&mut self) -> Result<()> {
        for peer in self.peer_ids() {
            self.maybe_send_append(peer, true)?;
        }
        Ok(())
    }

    /// Sends pending log entries to a peer according to its progress, or a
    /// snapshot if its next index was compacted away. When heartbeat is
    /// true, an empty append is sent even if the peer has nothing pending.
    fn maybe_send_append(&mut self, peer: ServerId, heartbeat: bool) -> Result<()> {
        let term = self.log.get_term().0;
        let (last_index, _) = self.log.get_last_index();
        let (snapshot_index, _) = self.log.get_snapshot_index();
        let commit_index = self.log.get_commit_index().0;

        enum Action {
            Nothing,
            Snapshot,
            Entries(Index),
        }
        let action = match progress_ref(&self.role, peer) {
            None => Action::Nothing,
            // An in-flight transfer is driven by replies and tick resends.
            Some(p) if p.transfer.is_some() => Action::Nothing,
            Some(p) if p.next_index <= snapshot_index => Action::Snapshot,
            Some(p) if heartbeat || p.next_index <= last_index => Action::Entries(p.next_index),
            Some(_) => Action::Nothing,
        };

        match action {
            Action::Nothing => Ok(()),

            Action::Snapshot => {
                let meta = self
                    .snapshots
                    .lock()?
                    .installed()?
                    .expect("log compacted without an installed snapshot");
                let (_, size) = self.snapshots.lock()?.chunk(0, 0)?;
                if let Some(progress) = progress_mut(&mut self.role, peer) {
                    progress.transfer = Some(Transfer::new(meta.index, meta.term, size));
                }
                info!("Sending snapshot through index {} to server {peer}", meta.index);
                self.send_snapshot_chunk(peer)
            }

            Action::Entries(next) => {
                assert!(next > 0 && next <= last_index + 1, "invalid next index {next}");
                let base_index = next - 1;
                let base_term = self.log.term_of(base_index)?.expect("missing base entry");

                let mut entries = Vec::new();
                let mut bytes = 0;
                let mut scan = self.log.scan(next..);
                while let Some(entry) = scan.next().transpose()? {
                    bytes += entry.payload.len() as u64;
                    entries.push(entry);
                    if entries.len() >= self.opts.max_append_entries
                        || bytes >= self.opts.max_append_bytes
                    {
                        break;
                    }
                }
                drop(scan);

                // Optimistically assume the entries will be accepted, to
                // avoid resending them before the reply arrives.
                if let Some(last) = entries.last() {
                    if let Some(progress) = progress_mut(&mut self.role, peer) {
                        progress.next_index = last.index + 1;
                    }
                }

                debug!("Replicating {} entries at base {base_index} to {peer}", entries.len());
                Self::send_with(
                    &self.node_tx,
                    Envelope {
                        from: self.id,
                        to: peer,
                        term,
                        message: Message::Append { base_index, base_term, commit_index, entries },
                    },
                )
            }
        }
    }

    /// Sends the next snapshot chunk to a peer, restarting the transfer if
    /// the snapshot file was replaced under it.
    fn send_snapshot_chunk(&mut self, peer: ServerId) -> Result<()> {
        let term = self.log.get_term().0;
        let chunk_bytes = self.opts.snapshot_chunk_bytes;

        let Some((mut offset, size)) =
            progress_ref(&self.role, peer).and_then(|p| p.transfer.as_ref()).map(|t| (t.offset, t.size))
        else {
            return Ok(());
        };

        let (mut data, total) = self.snapshots.lock()?.chunk(offset, chunk_bytes)?;
        let mut restart = None;
        if total != size {
            // The snapshot was compacted again mid-transfer; restart from
            // the new file.
            let meta =
                self.snapshots.lock()?.installed()?.expect("snapshot vanished mid-transfer");
            offset = 0;
            (data, _) = self.snapshots.lock()?.chunk(0, chunk_bytes)?;
            restart = Some(meta);
        }
        let done = offset + data.len() as u64 >= total;

        let Some(progress) = progress_mut(&mut self.role, peer) else { return Ok(()) };
        let Some(transfer) = progress.transfer.as_mut() else { return Ok(()) };
        if let Some(meta) = restart {
            *transfer = Transfer::new(meta.index, meta.term, total);
        }
        transfer.done_sent = done;
        transfer.idle = 0;
        let (last_index, last_term) = (transfer.last_index, transfer.last_term);

        Self::send_with(
            &self.node_tx,
            Envelope {
                from: self.id,
                to: peer,
                term,
                message: Message::Snapshot { last_index, last_term, offset, data, done },
            },
        )
    }

    /// Commits any entries replicated on a quorum of the active
    /// configuration, responds to the writes they carry, delivers them to
    /// the host, and advances any membership change waiting on a commit.
    fn maybe_commit_and_apply(&mut self) -> Result<Index> {
        let (commit_index, _) = self.log.get_commit_index();
        let Some((_, config)) = self.configs.active() else { return Ok(commit_index) };

        let (last_index, _) = self.log.get_last_index();
        let quorum_index = config.quorum_value(|id| {
            if id == self.id {
                last_index
            } else {
                self.role.progress.get(&id).map(|p| p.match_index).unwrap_or(0)
            }
        });
        if quorum_index <= commit_index {
            return Ok(commit_index);
        }

        // Leaders may only commit entries from their own term by counting
        // replicas; earlier-term entries commit implicitly below them (see
        // figure 8 in the Raft paper).
        match self.log.term_of(quorum_index)? {
            Some(term) if term == self.term() => {}
            Some(_) => return Ok(commit_index),
            None => panic!("missing entry at quorum index {quorum_index}"),
        }

        self.log.commit(quorum_index)?;

        // Answer the writes that just committed.
        let committed: Vec<Index> = self
            .role
            .writes
            .keys()
            .filter(|index| **index <= quorum_index)
            .copied()
            .sorted()
            .collect();
        for index in committed {
            let write = self.role.writes.remove(&index).expect("write vanished");
            self.respond(write.id, Ok(Response::Replicate(index)))?;
        }

        self.maybe_apply()?;

        if self.advance_change_commit()? {
            // A configuration entry was appended; it may commit immediately
            // in small clusters.
            return self.maybe_commit_and_apply();
        }
        Ok(quorum_index)
    }

    /// Advances a membership change whose configuration entry has now
    /// committed. Returns true if a new entry was appended.
    fn advance_change_commit(&mut self) -> Result<bool> {
        let commit_index = self.log.get_commit_index().0;

        enum Advance {
            None,
            ToFinal,
            Done,
        }
        let advance = match self.role.change.as_ref().map(|c| &c.phase) {
            Some(Phase::Joint { index }) if commit_index >= *index => Advance::ToFinal,
            Some(Phase::Final { index }) if commit_index >= *index => Advance::Done,
            _ => Advance::None,
        };

        match advance {
            Advance::None => Ok(false),

            Advance::ToFinal => {
                let new = self.role.change.as_ref().expect("change vanished").new.clone();
                let index = self.propose_config(Configuration::Simple(new))?;
                info!("Appended final configuration at index {index}");
                self.role.change.as_mut().expect("change vanished").phase =
                    Phase::Final { index };
                Ok(true)
            }

            Advance::Done => {
                let change = self.role.change.take().expect("change vanished");
                info!("Configuration change committed");
                self.respond(change.id, Ok(Response::SetConfiguration))?;
                if !change.new.contains(self.id) {
                    info!("Removed from configuration, stepping down");
                    self.role.step_down = true;
                }
                Ok(false)
            }
        }
    }

    /// Whether a quorum of the active configuration has acknowledged us
    /// within the last election timeout. Gates both the step-down deadline
    /// and commit-index reads.
    fn has_support(&self) -> bool {
        let Some((_, config)) = self.configs.active() else { return true };
        let timeout = self.opts.election_timeout_range.start;
        let Reverse(ticks) = config.quorum_value(|id| {
            if id == self.id {
                Reverse(0)
            } else {
                Reverse(self.role.progress.get(&id).map(|p| p.since_ack).unwrap_or(Ticks::MAX))
            }
        });
        ticks < timeout
    }

    /// Processes a logical clock tick: periodic heartbeats, snapshot chunk
    /// resends, catch-up round timers, and the step-down deadline.
    fn tick(mut self) -> Result<Node> {
        self.cluster_time += self.opts.tick_millis;

        self.role.since_heartbeat += 1;
        if self.role.since_heartbeat >= self.opts.heartbeat_interval {
            self.role.since_heartbeat = 0;
            self.heartbeat()?;
        }

        // Age acknowledgements and in-flight snapshot chunks.
        let mut resend = Vec::new();
        for (id, progress) in
            self.role.progress.iter_mut().chain(self.role.learners.iter_mut())
        {
            progress.since_ack = progress.since_ack.saturating_add(1);
            if let Some(transfer) = progress.transfer.as_mut() {
                transfer.idle = transfer.idle.saturating_add(1);
                if transfer.idle >= RPC_TIMEOUT_TICKS {
                    resend.push(*id);
                }
            }
        }
        for peer in resend.into_iter().sorted() {
            self.send_snapshot_chunk(peer)?;
        }

        self.tick_catchup()?;

        // Step down if we can no longer reach a quorum; a partitioned leader
        // must not serve reads or hold clients indefinitely.
        if !self.has_support() {
            info!("Lost quorum support, stepping down");
            return Ok(self.into_follower_same_term()?.into());
        }
        Ok(self.into())
    }

    /// Ages catch-up rounds, starting new rounds or aborting the change when
    /// a target runs out of rounds.
    fn tick_catchup(&mut self) -> Result<()> {
        let (last_index, _) = self.log.get_last_index();
        let round_deadline = 4 * self.opts.election_timeout_range.start as u16;

        let mut abort = false;
        if let Some(change) = self.role.change.as_mut() {
            if let Phase::CatchUp { targets } = &mut change.phase {
                for (_, catchup) in targets.iter_mut() {
                    catchup.ticks = catchup.ticks.saturating_add(1);
                    if catchup.ticks as u16 > round_deadline {
                        if catchup.round >= CATCHUP_ROUNDS {
                            abort = true;
                        } else {
                            *catchup = CatchUp {
                                round: catchup.round + 1,
                                round_end: last_index,
                                ticks: 0,
                            };
                        }
                    }
                }
            }
        }
        if abort {
            self.abort_catchup()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Value as _;
    use crate::storage;

    use crossbeam::channel::{unbounded, Receiver};
    use std::collections::{BTreeMap, VecDeque};

    /// A fixed election timeout, for determinism.
    const TIMEOUT: Ticks = 3;

    fn member(id: ServerId) -> Member {
        Member { id, addresses: format!("127.0.0.1:{}", 5253 + id) }
    }

    fn test_options() -> Options {
        Options {
            election_timeout_range: TIMEOUT..TIMEOUT + 1,
            tick_millis: 10,
            ..Options::default()
        }
    }

    fn empty_log() -> Log {
        Log::new(Box::new(storage::Memory::new()), None).expect("log init failed")
    }

    /// Builds a log seeded with a configuration entry at index 1, term 1,
    /// naming the given members.
    fn seeded_log(ids: &[ServerId]) -> Log {
        let mut log = empty_log();
        log.set_term(1, None).expect("set term failed");
        let config = Configuration::Simple(SimpleConfiguration::new(
            ids.iter().map(|id| member(*id)).collect(),
        ));
        log.append(EntryKind::Configuration, config.encode().unwrap(), 0).expect("append failed");
        log
    }

    struct TestNode {
        node: Option<Node>,
        node_rx: Receiver<Envelope>,
        apply_rx: Receiver<Apply>,
        snapshots: Arc<Mutex<Box<dyn snapshot::Store>>>,
    }

    /// An in-process cluster of nodes, driven deterministically by shuttling
    /// envelopes between them. Messages across severed links are dropped.
    #[derive(Default)]
    struct Cluster {
        nodes: BTreeMap<ServerId, TestNode>,
        pending: VecDeque<Envelope>,
        responses: HashMap<RequestId, Result<Response>>,
        disconnected: HashSet<(ServerId, ServerId)>,
        next_request: u64,
    }

    impl Cluster {
        /// Creates a cluster where every node's log is seeded with a
        /// configuration naming all members.
        fn new(ids: &[ServerId]) -> Self {
            let mut cluster = Cluster::default();
            for id in ids {
                cluster.add_node(*id, seeded_log(ids));
            }
            cluster
        }

        fn add_node(&mut self, id: ServerId, log: Log) {
            let snapshots: Arc<Mutex<Box<dyn snapshot::Store>>> =
                Arc::new(Mutex::new(Box::new(snapshot::Memory::new())));
            let (node_tx, node_rx) = unbounded();
            let (apply_tx, apply_rx) = unbounded();
            let node = Node::new(id, log, snapshots.clone(), node_tx, apply_tx, test_options())
                .expect("node init failed");
            self.nodes.insert(id, TestNode { node: Some(node), node_rx, apply_rx, snapshots });
        }

        /// Replaces a node with a fresh, empty one, as after losing its disk.
        fn replace_node(&mut self, id: ServerId) {
            self.nodes.remove(&id);
            self.add_node(id, empty_log());
        }

        fn node(&self, id: ServerId) -> &Node {
            self.nodes.get(&id).expect("unknown node").node.as_ref().expect("node missing")
        }

        fn is_leader(&self, id: ServerId) -> bool {
            matches!(self.node(id), Node::Leader(_))
        }

        fn transition(&mut self, id: ServerId, f: impl FnOnce(Node) -> Result<Node>) {
            let test_node = self.nodes.get_mut(&id).expect("unknown node");
            let node = test_node.node.take().expect("node missing");
            test_node.node = Some(f(node).expect("transition failed"));
        }

        fn tick(&mut self, id: ServerId) {
            self.transition(id, |n| n.tick());
            self.drain();
        }

        /// Ticks a node through its election timeout, starting a campaign.
        fn campaign(&mut self, id: ServerId) {
            for _ in 0..TIMEOUT {
                self.transition(id, |n| n.tick());
            }
            self.drain();
        }

        /// Moves outbound messages into the pending queue, capturing client
        /// responses.
        fn drain(&mut self) {
            for (id, test_node) in &self.nodes {
                while let Ok(envelope) = test_node.node_rx.try_recv() {
                    if envelope.to == *id {
                        match envelope.message {
                            Message::ClientResponse { id: rid, response } => {
                                self.responses.insert(rid, response);
                            }
                            message => panic!("unexpected local message {message:?}"),
                        }
                    } else {
                        self.pending.push_back(envelope);
                    }
                }
            }
        }

        /// Delivers all pending messages until the cluster is quiescent.
        fn settle(&mut self) {
            self.drain();
            while let Some(envelope) = self.pending.pop_front() {
                let (from, to) = (envelope.from, envelope.to);
                if self.disconnected.contains(&(from, to)) || !self.nodes.contains_key(&to) {
                    continue;
                }
                self.transition(to, |n| n.step(envelope));
                self.drain();
            }
        }

        /// Severs connectivity between the given node and all others.
        fn partition(&mut self, id: ServerId) {
            let others: Vec<ServerId> =
                self.nodes.keys().copied().filter(|other| *other != id).collect();
            for other in others {
                self.disconnected.insert((id, other));
                self.disconnected.insert((other, id));
            }
        }

        fn heal(&mut self) {
            self.disconnected.clear();
        }

        /// Steps a client request into a node and settles the cluster,
        /// returning the request id.
        fn request(&mut self, id: ServerId, request: Request) -> RequestId {
            self.next_request += 1;
            let rid = self.next_request.to_be_bytes().to_vec();
            let term = self.node(id).term();
            let envelope = Envelope {
                from: id,
                to: id,
                term,
                message: Message::ClientRequest { id: rid.clone(), request },
            };
            self.transition(id, |n| n.step(envelope));
            self.settle();
            rid
        }

        fn response(&mut self, rid: &RequestId) -> Result<Response> {
            self.responses.remove(rid).expect("no response")
        }

        /// Drains a node's commit notifications.
        fn applies(&mut self, id: ServerId) -> Vec<Apply> {
            let mut applies = Vec::new();
            while let Ok(apply) = self.nodes[&id].apply_rx.try_recv() {
                applies.push(apply);
            }
            applies
        }

        /// Drains a node's commit notifications and returns the Data entry
        /// payloads, in delivery order.
        fn applied_data(&mut self, id: ServerId) -> Vec<Vec<u8>> {
            self.applies(id)
                .into_iter()
                .flat_map(|apply| match apply {
                    Apply::Entries(entries) => entries
                        .into_iter()
                        .filter(|e| e.kind == EntryKind::Data)
                        .map(|e| e.payload)
                        .collect::<Vec<_>>(),
                    Apply::Snapshot { .. } => Vec::new(),
                })
                .collect()
        }

        /// Returns a node's full log.
        fn log_entries(&mut self, id: ServerId) -> Vec<Entry> {
            let test_node = self.nodes.get_mut(&id).expect("unknown node");
            let node = test_node.node.as_mut().expect("node missing");
            let log = match node {
                Node::Candidate(n) => &mut n.log,
                Node::Follower(n) => &mut n.log,
                Node::Leader(n) => &mut n.log,
            };
            log.scan(..).collect::<Result<Vec<_>>>().expect("scan failed")
        }
    }

    /// After bootstrapping, a single-node cluster elects itself and commits
    /// writes immediately.
    #[test]
    fn bootstrap_single_node() -> Result<()> {
        let mut c = Cluster::default();
        c.add_node(1, empty_log());
        assert!(matches!(c.node(1), Node::Follower(_)));

        let rid = c.request(1, Request::Bootstrap);
        assert_eq!(c.response(&rid)?, Response::Bootstrap);
        assert!(c.is_leader(1));

        // Bootstrap is one-shot.
        let rid = c.request(1, Request::Bootstrap);
        assert!(c.response(&rid).is_err());

        // Writes commit without any peer round trips: the log holds the
        // bootstrap configuration, the election noop, and the write.
        let rid = c.request(1, Request::Replicate(b"hello".to_vec()));
        assert_eq!(c.response(&rid)?, Response::Replicate(3));
        assert_eq!(c.applied_data(1), vec![b"hello".to_vec()]);
        Ok(())
    }

    /// A campaigning node with a quorum of votes becomes leader.
    #[test]
    fn election_wins_quorum() {
        let mut c = Cluster::new(&[1, 2, 3]);
        c.campaign(1);
        c.settle();
        assert!(c.is_leader(1));
        assert_eq!(c.node(1).term(), 2);
        assert!(matches!(c.node(2), Node::Follower(_)));
        assert!(matches!(c.node(3), Node::Follower(_)));
    }

    /// Voters refuse candidates whose log is behind their own, so a stale
    /// server can never erase committed entries by winning an election.
    #[test]
    fn election_rejects_stale_log() -> Result<()> {
        let mut c = Cluster::new(&[1, 2, 3]);
        c.campaign(1);
        c.settle();

        // Server 3 misses a committed write.
        c.partition(3);
        let rid = c.request(1, Request::Replicate(b"a".to_vec()));
        c.response(&rid)?;
        c.heal();

        // Server 3 campaigns with its stale log and is rejected.
        c.campaign(3);
        c.settle();
        assert!(!c.is_leader(3));

        // An up-to-date server wins instead, and the write survives.
        c.campaign(2);
        c.settle();
        assert!(c.is_leader(2));
        let log2 = c.log_entries(2);
        assert!(log2.iter().any(|e| e.payload == b"a".to_vec()));
        assert_eq!(c.log_entries(1), log2);
        assert_eq!(c.log_entries(3), log2);
        Ok(())
    }

    /// An empty append is a valid heartbeat and resets the election timer.
    #[test]
    fn heartbeat_resets_election_timer() {
        let mut c = Cluster::new(&[1, 2, 3]);
        c.campaign(1);
        c.settle();

        // Bring server 2 to the brink of an election, then heartbeat.
        c.transition(2, |n| n.tick());
        c.transition(2, |n| n.tick());
        c.tick(1);
        c.settle();

        // The timer was reset; two more ticks don't trigger an election.
        c.transition(2, |n| n.tick());
        c.transition(2, |n| n.tick());
        assert!(matches!(c.node(2), Node::Follower(_)));

        // Without further heartbeats it eventually fires.
        c.transition(2, |n| n.tick());
        assert!(matches!(c.node(2), Node::Candidate(_)));
    }

    /// A granted vote from a previous term's election is discarded.
    #[test]
    fn stale_vote_discarded() {
        let mut c = Cluster::new(&[1, 2, 3]);
        c.campaign(1); // term 2 election
        c.pending.clear();
        c.campaign(1); // term 3 election
        c.pending.clear();

        let stale = Envelope {
            from: 2,
            to: 1,
            term: 2,
            message: Message::CampaignResponse { granted: true },
        };
        c.transition(1, |n| n.step(stale));
        assert!(matches!(c.node(1), Node::Candidate(_)));

        let current = Envelope {
            from: 2,
            to: 1,
            term: 3,
            message: Message::CampaignResponse { granted: true },
        };
        c.transition(1, |n| n.step(current));
        assert!(c.is_leader(1));
    }

    /// Committed writes are delivered to every host in order, and all logs
    /// agree entry for entry.
    #[test]
    fn replication_delivers_in_order() -> Result<()> {
        let mut c = Cluster::new(&[1, 2, 3]);
        c.campaign(1);
        c.settle();

        let expect: Vec<Vec<u8>> = (0..10u32).map(|i| format!("{i}").into_bytes()).collect();
        for payload in &expect {
            let rid = c.request(1, Request::Replicate(payload.clone()));
            c.response(&rid)?;
        }
        // A heartbeat propagates the final commit index to the followers.
        c.tick(1);
        c.settle();

        for id in [1, 2, 3] {
            assert_eq!(c.applied_data(id), expect, "server {id}");
        }
        let log1 = c.log_entries(1);
        assert_eq!(c.log_entries(2), log1);
        assert_eq!(c.log_entries(3), log1);

        // The leader serves the commit index; followers refer to the leader.
        let rid = c.request(1, Request::GetLastCommitIndex);
        assert_eq!(c.response(&rid)?, Response::LastCommitIndex(12));
        let rid = c.request(2, Request::GetLastCommitIndex);
        assert_eq!(c.response(&rid), Err(Error::NotLeader(Some(1))));
        Ok(())
    }

    /// A reject hint backs up over an entire conflicting term in one round.
    #[test]
    fn append_mismatch_skips_conflicting_term() -> Result<()> {
        let mut log = seeded_log(&[1, 2]);
        log.set_term(2, None)?;
        for payload in [b"a", b"b", b"c"] {
            log.append(EntryKind::Data, payload.to_vec(), 0)?;
        }
        let mut c = Cluster::default();
        c.add_node(2, log);

        // A term-4 leader probes at 4@3; the whole term-2 run is skipped.
        let probe = Envelope {
            from: 1,
            to: 2,
            term: 4,
            message: Message::Append {
                base_index: 4,
                base_term: 3,
                commit_index: 0,
                entries: vec![],
            },
        };
        c.transition(2, |n| n.step(probe));
        c.drain();
        let reply = c.pending.pop_front().expect("no reply");
        assert_eq!(reply.to, 1);
        assert_eq!(
            reply.message,
            Message::AppendResponse { outcome: AppendOutcome::LogMismatch, last_index: 1 },
        );
        Ok(())
    }

    /// An isolated leader steps down once it can no longer hear a quorum,
    /// and refuses writes afterwards.
    #[test]
    fn isolated_leader_steps_down() {
        let mut c = Cluster::new(&[1, 2, 3]);
        c.campaign(1);
        c.settle();
        c.partition(1);

        for _ in 0..TIMEOUT {
            c.tick(1);
        }
        assert!(matches!(c.node(1), Node::Follower(_)));

        let rid = c.request(1, Request::Replicate(b"x".to_vec()));
        assert_eq!(c.response(&rid), Err(Error::NotLeader(None)));
    }

    /// Entries replicated only to a minority are never committed nor
    /// delivered, and are overwritten by the next leader's history.
    #[test]
    fn uncommitted_entries_from_old_term_are_discarded() -> Result<()> {
        let mut c = Cluster::new(&[1, 2, 3]);
        c.campaign(1);
        c.settle();
        for id in [1, 2, 3] {
            c.applies(id);
        }

        // The isolated leader appends an entry it can never commit.
        c.partition(1);
        let rid = c.request(1, Request::Replicate(b"lost".to_vec()));
        assert!(!c.responses.contains_key(&rid), "write committed without quorum");

        // A new leader is elected on the majority side and commits a write.
        c.campaign(2);
        c.settle();
        assert!(c.is_leader(2));
        let rid2 = c.request(2, Request::Replicate(b"kept".to_vec()));
        c.response(&rid2)?;

        // The deposed leader rejoins: its divergent entry is truncated and
        // its pending write aborted.
        c.heal();
        c.tick(2);
        c.settle();
        c.tick(2);
        c.settle();
        assert_eq!(c.response(&rid), Err(Error::NotLeader(None)));

        let log2 = c.log_entries(2);
        assert_eq!(c.log_entries(1), log2);
        assert_eq!(c.log_entries(3), log2);
        for id in [1, 2, 3] {
            let data = c.applied_data(id);
            assert!(!data.contains(&b"lost".to_vec()), "server {id} delivered the lost entry");
            assert!(data.contains(&b"kept".to_vec()), "server {id} missed the kept entry");
        }
        Ok(())
    }

    /// A joint-consensus membership change catches up the new server,
    /// commits the transitional and final configurations, and starts
    /// replicating to the new member.
    #[test]
    fn configuration_change_adds_server() -> Result<()> {
        let mut c = Cluster::default();
        c.add_node(1, empty_log());
        let rid = c.request(1, Request::Bootstrap);
        c.response(&rid)?;
        assert!(c.is_leader(1));

        // A brand-new, unconfigured server joins the cluster.
        c.add_node(2, empty_log());
        let rid = c.request(
            1,
            Request::SetConfiguration { old_id: 1, members: vec![member(1), member(2)] },
        );
        assert_eq!(c.response(&rid)?, Response::SetConfiguration);

        // The final simple configuration has committed.
        let rid = c.request(1, Request::GetConfiguration);
        let Response::Configuration { id, members } = c.response(&rid)? else {
            panic!("unexpected response");
        };
        assert!(id > 1);
        assert_eq!(members, vec![member(1), member(2)]);

        // The log carries the bootstrap, transitional, and final
        // configurations.
        let configs: Vec<Entry> = c
            .log_entries(1)
            .into_iter()
            .filter(|e| e.kind == EntryKind::Configuration)
            .collect();
        assert_eq!(configs.len(), 3);

        // Replication reaches the new member.
        let rid = c.request(1, Request::Replicate(b"x".to_vec()));
        c.response(&rid)?;
        c.tick(1);
        c.settle();
        assert_eq!(c.applied_data(2).last(), Some(&b"x".to_vec()));
        assert_eq!(c.log_entries(2), c.log_entries(1));
        Ok(())
    }

    /// A leader that removes itself steps down once the final configuration
    /// commits, and the remaining server takes over.
    #[test]
    fn removed_leader_steps_down() -> Result<()> {
        let mut c = Cluster::new(&[1, 2]);
        c.campaign(1);
        c.settle();

        let rid = c.request(1, Request::SetConfiguration { old_id: 1, members: vec![member(2)] });
        assert_eq!(c.response(&rid)?, Response::SetConfiguration);
        assert!(matches!(c.node(1), Node::Follower(_)));

        // The remaining server is now the sole voter and elects itself.
        c.campaign(2);
        c.settle();
        assert!(c.is_leader(2));
        Ok(())
    }

    /// A membership change aborts with the list of servers that could not
    /// catch up, leaving the old configuration serving.
    #[test]
    fn configuration_change_aborts_unreachable_server() -> Result<()> {
        let mut c = Cluster::new(&[1, 2]);
        c.campaign(1);
        c.settle();

        // Server 3 does not exist; its catch-up rounds all expire.
        let rid = c.request(
            1,
            Request::SetConfiguration {
                old_id: 1,
                members: vec![member(1), member(2), member(3)],
            },
        );
        for _ in 0..200 {
            c.tick(1);
            c.settle();
            if c.responses.contains_key(&rid) {
                break;
            }
        }
        assert_eq!(c.response(&rid), Err(Error::ConfigurationBad(vec![3])));

        // The old configuration still serves writes.
        let rid = c.request(1, Request::Replicate(b"x".to_vec()));
        c.response(&rid)?;
        Ok(())
    }

    /// A follower that lost its log receives a snapshot install followed by
    /// entry replication, and its host sees a restore signal rather than
    /// individual entries below the snapshot.
    #[test]
    fn snapshot_install_catches_up_follower() -> Result<()> {
        let mut c = Cluster::new(&[1, 2]);
        c.campaign(1);
        c.settle();
        for i in 0..3u32 {
            let rid = c.request(1, Request::Replicate(format!("{i}").into_bytes()));
            c.response(&rid)?;
        }
        c.tick(1);
        c.settle();

        // The host snapshots its state through the last applied entry
        // (config 1, noop 2, data 3-5) and compacts the log.
        let rid = c.request(1, Request::BeginSnapshot { until: 5 });
        let Response::BeginSnapshot(meta) = c.response(&rid)? else {
            panic!("unexpected response");
        };
        assert_eq!(meta.index, 5);
        let mut writer = c.nodes[&1].snapshots.lock()?.writer(&meta)?;
        writer.append(b"state through 5")?;
        writer.save()?;
        let rid = c.request(1, Request::CompleteSnapshot { index: 5 });
        assert_eq!(c.response(&rid)?, Response::CompleteSnapshot);
        assert_eq!(c.log_entries(1), vec![]);

        // Server 2 loses its disk and restarts empty. The leader has
        // compacted the entries away, so it must send its snapshot.
        c.replace_node(2);
        c.tick(1);
        c.settle();

        let applies = c.applies(2);
        assert!(
            matches!(applies.first(), Some(Apply::Snapshot { index: 5, .. })),
            "expected a snapshot restore, got {applies:?}"
        );

        // Subsequent writes flow to the restored follower as entries.
        let rid = c.request(1, Request::Replicate(b"after".to_vec()));
        c.response(&rid)?;
        c.tick(1);
        c.settle();
        assert_eq!(c.applied_data(2), vec![b"after".to_vec()]);
        Ok(())
    }

    /// A restarted node replays its snapshot and committed entries to the
    /// host exactly once per boot.
    #[test]
    fn restart_replays_committed_state() -> Result<()> {
        let mut c = Cluster::new(&[1, 2]);
        c.campaign(1);
        c.settle();
        let rid = c.request(1, Request::Replicate(b"a".to_vec()));
        c.response(&rid)?;
        c.tick(1);
        c.settle();
        assert_eq!(c.applied_data(2), vec![b"a".to_vec()]);

        // Rebuild node 2 from its log, as after a restart.
        let test_node = c.nodes.remove(&2).expect("unknown node");
        let node = test_node.node.expect("node missing");
        let log = match node {
            Node::Candidate(n) => n.log,
            Node::Follower(n) => n.log,
            Node::Leader(n) => n.log,
        };
        c.add_node(2, log);
        assert_eq!(c.applied_data(2), vec![b"a".to_vec()]);
        Ok(())
    }
}
