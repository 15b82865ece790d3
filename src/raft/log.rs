use super::snapshot;
use super::{Configuration, Index, ServerId, Term};
use crate::encoding::{self, bincode, Value as _};
use crate::errdata;
use crate::error::Result;
use crate::storage;

use serde_derive::{Deserialize, Serialize};
use std::ops::{Bound, RangeBounds};

/// The log entry kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// An opaque host payload.
    Data,
    /// A membership configuration, effective as soon as it is appended.
    Configuration,
    /// An empty entry appended by a new leader to commit an entry in its own
    /// term, see section 5.4.2 in the Raft paper.
    Noop,
}

/// A log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was appended.
    pub term: Term,
    /// The entry kind.
    pub kind: EntryKind,
    /// The payload: opaque bytes for Data, an encoded Configuration for
    /// Configuration, empty for Noop.
    pub payload: Vec<u8>,
    /// The leader's cluster time when the entry was appended, a monotonic
    /// millisecond clock.
    pub cluster_time: u64,
}

impl encoding::Value for Entry {}

impl Entry {
    /// Decodes the configuration payload of a Configuration entry.
    pub fn configuration(&self) -> Result<Configuration> {
        assert_eq!(self.kind, EntryKind::Configuration, "not a configuration entry");
        Configuration::decode(&self.payload)
    }
}

/// Metadata keys in the underlying store.
mod meta {
    /// The current term and vote, as a bincode (term, vote) pair.
    pub const TERM_VOTE: &[u8] = b"term_vote";
    /// The commit index and term, as a bincode (index, term) pair.
    pub const COMMIT: &[u8] = b"commit_index";
    /// The cluster UUID, immutable once set.
    pub const CLUSTER_UUID: &[u8] = b"cluster_uuid";
}

/// The Raft log: a durable sequence of entries replicated across the cluster,
/// plus the persistent term/vote cells. Entries below the current snapshot
/// have been discarded; the snapshot's last included index and term stand in
/// for them when matching log prefixes.
///
/// Invariants:
///
/// * Entry indexes are contiguous in (snapshot_index, last_index].
/// * Entry terms never decrease, and never exceed the current term.
/// * snapshot_index ≤ commit_index ≤ last_index.
/// * Appended entries are durable (synced) before any reply that could form
///   a quorum on them is sent.
/// * Committed entries are never truncated or replaced.
pub struct Log {
    /// The underlying storage module. A trait object so the backend (memory
    /// or filesystem) is chosen at startup.
    store: Box<dyn storage::log::Store>,
    /// The current term.
    term: Term,
    /// The vote cast in the current term, if any.
    vote: Option<ServerId>,
    /// The index of the last entry.
    last_index: Index,
    /// The term of the last entry.
    last_term: Term,
    /// The index of the last committed entry.
    commit_index: Index,
    /// The term of the last committed entry.
    commit_term: Term,
    /// The last index covered by the installed snapshot, or 0.
    snapshot_index: Index,
    /// The term of the entry at snapshot_index, or 0.
    snapshot_term: Term,
    /// The configuration recorded in the snapshot header, with its original
    /// entry index.
    snapshot_config: Option<(Index, Configuration)>,
}

impl Log {
    /// Opens a log using the given storage module and the currently installed
    /// snapshot's metadata, if any.
    pub fn new(
        mut store: Box<dyn storage::log::Store>,
        snapshot: Option<&snapshot::Meta>,
    ) -> Result<Self> {
        let (term, vote) = store
            .get_metadata(meta::TERM_VOTE)?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or((0, None));

        let (snapshot_index, snapshot_term, snapshot_config) = match snapshot {
            Some(meta) => {
                (meta.index, meta.term, Some((meta.config_index, meta.config.clone())))
            }
            None => (0, 0, None),
        };

        // A crash between snapshot installation and log compaction leaves the
        // log prefix behind; compact it now.
        let (first, _) = store.bounds();
        if first <= snapshot_index {
            store.truncate_prefix(snapshot_index + 1)?;
        }
        let (first, last) = store.bounds();
        if first != snapshot_index + 1 {
            return errdata!("log begins at {first}, expected {}", snapshot_index + 1);
        }

        let (last_index, last_term) = if last >= first {
            let entry = store
                .get(last)?
                .map(|v| Entry::decode(&v))
                .transpose()?
                .expect("missing last entry");
            (entry.index, entry.term)
        } else {
            (snapshot_index, snapshot_term)
        };

        let (mut commit_index, mut commit_term) = store
            .get_metadata(meta::COMMIT)?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or((0, 0));
        if commit_index < snapshot_index {
            (commit_index, commit_term) = (snapshot_index, snapshot_term);
        }
        if commit_index > last_index {
            return errdata!("commit index {commit_index} beyond last index {last_index}");
        }

        Ok(Self {
            store,
            term,
            vote,
            last_index,
            last_term,
            commit_index,
            commit_term,
            snapshot_index,
            snapshot_term,
            snapshot_config,
        })
    }

    /// Returns the current term (0 if none) and vote.
    pub fn get_term(&self) -> (Term, Option<ServerId>) {
        (self.term, self.vote)
    }

    /// Returns the last log index and term.
    pub fn get_last_index(&self) -> (Index, Term) {
        (self.last_index, self.last_term)
    }

    /// Returns the commit index and term.
    pub fn get_commit_index(&self) -> (Index, Term) {
        (self.commit_index, self.commit_term)
    }

    /// Returns the snapshot's last included index and term.
    pub fn get_snapshot_index(&self) -> (Index, Term) {
        (self.snapshot_index, self.snapshot_term)
    }

    /// Returns the snapshot's configuration and its entry index, if any.
    pub fn get_snapshot_config(&self) -> Option<&(Index, Configuration)> {
        self.snapshot_config.as_ref()
    }

    /// Returns the persisted cluster UUID, if any.
    pub fn get_cluster_uuid(&mut self) -> Result<Option<String>> {
        self.store
            .get_metadata(meta::CLUSTER_UUID)?
            .map(|v| bincode::deserialize(&v))
            .transpose()
    }

    /// Persists the cluster UUID. Immutable once set.
    pub fn set_cluster_uuid(&mut self, uuid: &str) -> Result<()> {
        match self.get_cluster_uuid()? {
            Some(current) if current != uuid => {
                errdata!("cluster UUID is already {current}, refusing {uuid}")
            }
            Some(_) => Ok(()),
            None => self.store.set_metadata(meta::CLUSTER_UUID, bincode::serialize(&uuid)?),
        }
    }

    /// Persists the current term and vote. Enforces that the term never
    /// regresses and that the vote is only cast once per term. Durable before
    /// this returns, so a vote can be granted as soon as it is recorded.
    pub fn set_term(&mut self, term: Term, vote: Option<ServerId>) -> Result<()> {
        assert!(term > 0, "can't set term 0");
        assert!(term >= self.term, "term regression {} → {}", self.term, term);
        assert!(term > self.term || self.vote.is_none() || vote == self.vote, "can't change vote");
        if term == self.term && vote == self.vote {
            return Ok(());
        }
        self.store.set_metadata(meta::TERM_VOTE, bincode::serialize(&(term, vote))?)?;
        self.term = term;
        self.vote = vote;
        Ok(())
    }

    /// Appends an entry of the given kind at the current term, syncing it to
    /// durable storage. Returns the entry index.
    pub fn append(&mut self, kind: EntryKind, payload: Vec<u8>, cluster_time: u64) -> Result<Index> {
        assert!(self.term > 0, "can't append entry in term 0");
        let entry =
            Entry { index: self.last_index + 1, term: self.term, kind, payload, cluster_time };
        self.store.append(entry.encode()?)?;
        self.store.sync()?;
        self.last_index = entry.index;
        self.last_term = entry.term;
        Ok(entry.index)
    }

    /// Commits entries up to and including the given index. The index must
    /// exist, and be at or above the current commit index.
    pub fn commit(&mut self, index: Index) -> Result<Index> {
        if index == self.commit_index {
            return Ok(index);
        }
        assert!(index > self.commit_index, "commit regression {} → {index}", self.commit_index);
        let term = self.term_of(index)?.expect("commit index does not exist");
        // The commit index is advisory and can be recovered from a log quorum,
        // but persisting it avoids re-delivering long prefixes on restart.
        self.store.set_metadata(meta::COMMIT, bincode::serialize(&(index, term))?)?;
        self.commit_index = index;
        self.commit_term = term;
        Ok(index)
    }

    /// Fetches an entry at an index, or None if it does not exist (including
    /// entries discarded by the snapshot).
    pub fn get(&mut self, index: Index) -> Result<Option<Entry>> {
        if index <= self.snapshot_index || index > self.last_index {
            return Ok(None);
        }
        self.store.get(index)?.map(|v| Entry::decode(&v)).transpose()
    }

    /// Returns the term of the entry at the given index: 0 for index 0, the
    /// snapshot term at the snapshot index, and None for entries discarded
    /// below the snapshot or beyond the end of the log.
    pub fn term_of(&mut self, index: Index) -> Result<Option<Term>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if index == self.snapshot_index {
            return Ok(Some(self.snapshot_term));
        }
        if index == self.last_index {
            return Ok(Some(self.last_term));
        }
        Ok(self.get(index)?.map(|e| e.term))
    }

    /// Checks if the log has an entry with the given index and term. The
    /// snapshot acts as a matching prefix at its last included index.
    pub fn has(&mut self, index: Index, term: Term) -> Result<bool> {
        if index == 0 && term == 0 {
            return Ok(true);
        }
        Ok(self.term_of(index)? == Some(term))
    }

    /// Iterates over entries in the given index range. Entries at or below
    /// the snapshot index are not available.
    pub fn scan(&mut self, range: impl RangeBounds<Index>) -> impl Iterator<Item = Result<Entry>> + '_ {
        let start = match range.start_bound() {
            Bound::Included(&i) => Bound::Included(i.max(self.snapshot_index + 1)),
            Bound::Excluded(&i) => Bound::Included((i + 1).max(self.snapshot_index + 1)),
            Bound::Unbounded => Bound::Included(self.snapshot_index + 1),
        };
        let end = match range.end_bound() {
            Bound::Included(&i) => Bound::Included(i),
            Bound::Excluded(&i) => Bound::Excluded(i),
            Bound::Unbounded => Bound::Unbounded,
        };
        self.store.scan((start, end)).map(|r| r.and_then(|v| Entry::decode(&v)))
    }

    /// Iterates over entries that are ready to deliver to the host: those
    /// above the given applied index, up to the commit index.
    pub fn scan_apply(
        &mut self,
        applied_index: Index,
    ) -> Box<dyn Iterator<Item = Result<Entry>> + '_> {
        if applied_index >= self.commit_index {
            return Box::new(std::iter::empty());
        }
        Box::new(self.scan(applied_index + 1..=self.commit_index))
    }

    /// Iterates over the configuration entries in the log, with their
    /// indexes.
    pub fn scan_configurations(&mut self) -> Result<Vec<(Index, Configuration)>> {
        let mut configs = Vec::new();
        let mut scan = self.scan(..);
        while let Some(entry) = scan.next().transpose()? {
            if entry.kind == EntryKind::Configuration {
                let config = Configuration::decode(&entry.payload)?;
                configs.push((entry.index, config));
            }
        }
        Ok(configs)
    }

    /// Splices a batch of replicated entries into the log, syncing them to
    /// durable storage. The entries must be contiguous with increasing terms,
    /// and connect to the existing log. Entries already present with the same
    /// term are kept as-is; on a term conflict the log suffix is truncated
    /// from the first conflicting index before the new entries are appended.
    /// Returns the resulting last index.
    pub fn splice(&mut self, entries: Vec<Entry>) -> Result<Index> {
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(self.last_index);
        };

        assert!(first.index > 0 && first.term > 0, "spliced entry has index or term 0");
        assert!(first.index > self.snapshot_index, "spliced entries below snapshot");
        assert!(
            entries.windows(2).all(|w| w[0].index + 1 == w[1].index),
            "spliced entries are not contiguous"
        );
        assert!(
            entries.windows(2).all(|w| w[0].term <= w[1].term),
            "spliced entries have term regression"
        );
        assert!(last.term <= self.term, "splice term {} beyond current {}", last.term, self.term);
        assert!(first.index <= self.last_index + 1, "splice disconnected from log");

        // Skip entries that are already present with the same term.
        let mut entries = entries.as_slice();
        {
            let mut scan = self.scan(first.index..=last.index);
            while let Some(entry) = scan.next().transpose()? {
                assert_eq!(entry.index, entries[0].index, "index mismatch at {entry:?}");
                if entry.term != entries[0].term {
                    break;
                }
                entries = &entries[1..];
            }
        }
        let Some(first) = entries.first() else {
            return Ok(self.last_index);
        };

        // Committed entries are immutable; a conflict below the commit index
        // means a safety violation upstream.
        assert!(first.index > self.commit_index, "splice below commit index");

        // Truncate the conflicting suffix, then append.
        if first.index <= self.last_index {
            self.store.truncate_suffix(first.index - 1)?;
        }
        for entry in entries {
            self.store.append(entry.encode()?)?;
        }
        self.store.sync()?;

        self.last_index = entries.last().expect("no entries").index;
        self.last_term = entries.last().expect("no entries").term;
        Ok(self.last_index)
    }

    /// Installs a received snapshot: discards the covered log prefix (or the
    /// entire log if it does not connect to the snapshot), adopts the
    /// snapshot's bounds, and advances the commit index to at least the
    /// snapshot index.
    pub fn install_snapshot(&mut self, meta: &snapshot::Meta) -> Result<()> {
        assert!(meta.index > self.snapshot_index, "snapshot regression");

        // Retain the log tail only if it connects to the snapshot; a
        // diverging or missing entry at the snapshot index discards it.
        let connects = self.has(meta.index, meta.term)?;
        if !connects {
            self.store.truncate_suffix(meta.index.min(self.last_index))?;
            self.last_index = meta.index;
            self.last_term = meta.term;
        }
        self.store.truncate_prefix(meta.index + 1)?;

        self.snapshot_index = meta.index;
        self.snapshot_term = meta.term;
        self.snapshot_config = Some((meta.config_index, meta.config.clone()));
        if self.commit_index < meta.index {
            self.commit_index = meta.index;
            self.commit_term = meta.term;
            self.store.set_metadata(
                meta::COMMIT,
                bincode::serialize(&(self.commit_index, self.commit_term))?,
            )?;
        }
        Ok(())
    }

    /// Compacts the log after a local snapshot has been taken, discarding
    /// entries covered by it. The snapshot index must be committed.
    pub fn compact(&mut self, meta: &snapshot::Meta) -> Result<()> {
        assert!(meta.index <= self.commit_index, "snapshot of uncommitted entries");
        if meta.index <= self.snapshot_index {
            return Ok(());
        }
        self.store.truncate_prefix(meta.index + 1)?;
        self.snapshot_index = meta.index;
        self.snapshot_term = meta.term;
        self.snapshot_config = Some((meta.config_index, meta.config.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{Member, SimpleConfiguration};
    use crate::storage::Memory;

    fn setup() -> Log {
        Log::new(Box::new(Memory::new()), None).expect("log init failed")
    }

    fn entry(index: Index, term: Term, payload: &[u8]) -> Entry {
        Entry { index, term, kind: EntryKind::Data, payload: payload.to_vec(), cluster_time: 0 }
    }

    #[test]
    fn append_and_get() -> Result<()> {
        let mut log = setup();
        log.set_term(1, None)?;
        assert_eq!(log.append(EntryKind::Noop, vec![], 0)?, 1);
        assert_eq!(log.append(EntryKind::Data, b"foo".to_vec(), 2)?, 2);
        assert_eq!(log.get_last_index(), (2, 1));
        assert_eq!(
            log.get(2)?,
            Some(Entry {
                index: 2,
                term: 1,
                kind: EntryKind::Data,
                payload: b"foo".to_vec(),
                cluster_time: 2
            })
        );
        assert_eq!(log.get(3)?, None);
        assert_eq!(log.term_of(0)?, Some(0));
        assert_eq!(log.term_of(1)?, Some(1));
        assert!(log.has(2, 1)?);
        assert!(!log.has(2, 2)?);
        Ok(())
    }

    #[test]
    fn set_term_persists_vote() -> Result<()> {
        let mut log = setup();
        log.set_term(3, Some(2))?;
        assert_eq!(log.get_term(), (3, Some(2)));
        // Idempotent for the same term and vote.
        log.set_term(3, Some(2))?;
        // A new term clears the vote.
        log.set_term(4, None)?;
        assert_eq!(log.get_term(), (4, None));
        Ok(())
    }

    #[test]
    #[should_panic(expected = "can't change vote")]
    fn set_term_rejects_vote_change() {
        let mut log = setup();
        log.set_term(3, Some(2)).unwrap();
        log.set_term(3, Some(1)).ok();
    }

    #[test]
    fn splice_appends_and_skips_duplicates() -> Result<()> {
        let mut log = setup();
        log.set_term(2, None)?;
        log.splice(vec![entry(1, 1, b"a"), entry(2, 1, b"b")])?;
        assert_eq!(log.get_last_index(), (2, 1));

        // Splicing an overlapping batch with matching terms is a noop for the
        // overlap and appends the rest.
        log.splice(vec![entry(2, 1, b"b"), entry(3, 2, b"c")])?;
        assert_eq!(log.get_last_index(), (3, 2));
        assert_eq!(log.get(2)?.unwrap().payload, b"b".to_vec());
        Ok(())
    }

    #[test]
    fn splice_truncates_conflicts() -> Result<()> {
        let mut log = setup();
        log.set_term(3, None)?;
        log.splice(vec![entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 1, b"c")])?;

        // A conflicting entry at index 2 truncates the old suffix.
        log.splice(vec![entry(2, 3, b"x")])?;
        assert_eq!(log.get_last_index(), (2, 3));
        assert_eq!(log.get(2)?.unwrap().payload, b"x".to_vec());
        assert_eq!(log.get(3)?, None);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "splice below commit index")]
    fn splice_protects_committed() {
        let mut log = setup();
        log.set_term(3, None).unwrap();
        log.splice(vec![entry(1, 1, b"a"), entry(2, 1, b"b")]).unwrap();
        log.commit(2).unwrap();
        log.splice(vec![entry(2, 3, b"x")]).ok();
    }

    #[test]
    fn commit_tracks_term() -> Result<()> {
        let mut log = setup();
        log.set_term(2, None)?;
        log.splice(vec![entry(1, 1, b"a"), entry(2, 2, b"b")])?;
        log.commit(1)?;
        assert_eq!(log.get_commit_index(), (1, 1));
        log.commit(2)?;
        assert_eq!(log.get_commit_index(), (2, 2));
        // Idempotent.
        log.commit(2)?;
        Ok(())
    }

    fn test_meta(index: Index, term: Term) -> snapshot::Meta {
        snapshot::Meta {
            index,
            term,
            config_index: 1,
            config: Configuration::Simple(SimpleConfiguration::new(vec![Member {
                id: 1,
                addresses: "127.0.0.1:5254".to_string(),
            }])),
        }
    }

    #[test]
    fn install_snapshot_discards_prefix() -> Result<()> {
        let mut log = setup();
        log.set_term(2, None)?;
        log.splice(vec![entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 2, b"c")])?;

        // A snapshot at (2, 1) matches the log, so the tail is retained.
        log.install_snapshot(&test_meta(2, 1))?;
        assert_eq!(log.get_snapshot_index(), (2, 1));
        assert_eq!(log.get_last_index(), (3, 2));
        assert_eq!(log.get_commit_index(), (2, 1));
        assert_eq!(log.get(2)?, None);
        assert!(log.has(2, 1)?, "snapshot must act as a matching prefix");
        assert_eq!(log.get(3)?.unwrap().payload, b"c".to_vec());
        Ok(())
    }

    #[test]
    fn install_snapshot_discards_divergent_log() -> Result<()> {
        let mut log = setup();
        log.set_term(2, None)?;
        log.splice(vec![entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 1, b"c")])?;

        // A snapshot at (5, 2) does not connect; the whole log is discarded.
        log.install_snapshot(&test_meta(5, 2))?;
        assert_eq!(log.get_snapshot_index(), (5, 2));
        assert_eq!(log.get_last_index(), (5, 2));
        assert_eq!(log.get_commit_index(), (5, 2));
        assert_eq!(log.get(3)?, None);

        // Appends continue after the snapshot.
        log.set_term(3, None)?;
        assert_eq!(log.append(EntryKind::Noop, vec![], 0)?, 6);
        Ok(())
    }

    #[test]
    fn compact_preserves_state_across_reopen() -> Result<()> {
        let dir = tempdir::TempDir::new("quorum")?;
        let meta = test_meta(2, 1);

        let mut log =
            Log::new(Box::new(crate::storage::Filesystem::new(dir.path())?), None)?;
        log.set_term(2, None)?;
        log.splice(vec![entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 2, b"c")])?;
        log.commit(2)?;
        log.compact(&meta)?;
        assert_eq!(log.get(1)?, None);
        drop(log);

        let mut log =
            Log::new(Box::new(crate::storage::Filesystem::new(dir.path())?), Some(&meta))?;
        assert_eq!(log.get_snapshot_index(), (2, 1));
        assert_eq!(log.get_commit_index(), (2, 1));
        assert_eq!(log.get_last_index(), (3, 2));
        assert_eq!(log.get(1)?, None);
        assert_eq!(log.get(3)?.unwrap().payload, b"c".to_vec());
        Ok(())
    }

    #[test]
    fn cluster_uuid_is_immutable() -> Result<()> {
        let mut log = setup();
        assert_eq!(log.get_cluster_uuid()?, None);
        log.set_cluster_uuid("cafebabe")?;
        assert_eq!(log.get_cluster_uuid()?, Some("cafebabe".to_string()));
        log.set_cluster_uuid("cafebabe")?;
        assert!(log.set_cluster_uuid("deadbeef").is_err());
        Ok(())
    }
}
