//! Log stores hold an ordered sequence of opaque, durable log entries plus a
//! small set of metadata cells (current term, vote, commit index). Entry
//! indexes are 1-based and absolute: they are preserved across prefix
//! truncation, which discards entries covered by a snapshot.

mod file;
mod memory;

pub use file::Filesystem;
pub use memory::Memory;

use crate::error::Result;

use std::ops::Bound;

/// A durable log store. Implementations must retain the absolute index range
/// of their entries across restarts.
///
/// The store does not know about commit indexes or terms; the Raft log above
/// it is responsible for never truncating entries it has promised to keep.
pub trait Store: Send {
    /// Appends a log entry and returns its index. The entry is not guaranteed
    /// durable until sync() returns.
    fn append(&mut self, entry: Vec<u8>) -> Result<u64>;

    /// Returns the first and last entry index. An empty store returns
    /// (first, first - 1), where first is the next index to be appended.
    fn bounds(&self) -> (u64, u64);

    /// Fetches an entry by index, or None if it does not exist.
    fn get(&mut self, index: u64) -> Result<Option<Vec<u8>>>;

    /// Iterates over entries in the given index range.
    fn scan(&mut self, range: (Bound<u64>, Bound<u64>)) -> Scan<'_>;

    /// Removes all entries with indexes above last. last may be first - 1,
    /// which removes every entry while preserving the index position.
    fn truncate_suffix(&mut self, last: u64) -> Result<()>;

    /// Removes all entries with indexes below first, and persists first as
    /// the lower bound. Used when a snapshot covers the log prefix. first
    /// may lie beyond the last index, leaving an empty store positioned at
    /// it (the snapshot covers entries the store never held).
    fn truncate_prefix(&mut self, first: u64) -> Result<()>;

    /// Gets a metadata value.
    fn get_metadata(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Sets a metadata value. Durable once this returns.
    fn set_metadata(&mut self, key: &[u8], value: Vec<u8>) -> Result<()>;

    /// Flushes all appended entries to stable storage.
    fn sync(&mut self) -> Result<()>;
}

/// An iterator over a range of log entries.
pub type Scan<'a> = Box<dyn Iterator<Item = Result<Vec<u8>>> + 'a>;

/// Resolves a range over the given bounds into concrete (start, end) indexes,
/// inclusive. Returns an empty range as (1, 0).
pub(crate) fn resolve_range(range: (Bound<u64>, Bound<u64>), bounds: (u64, u64)) -> (u64, u64) {
    let (first, last) = bounds;
    let start = match range.0 {
        Bound::Included(i) => i.max(first),
        Bound::Excluded(i) => (i + 1).max(first),
        Bound::Unbounded => first,
    };
    let end = match range.1 {
        Bound::Included(i) => i.min(last),
        Bound::Excluded(0) => return (1, 0),
        Bound::Excluded(i) => (i - 1).min(last),
        Bound::Unbounded => last,
    };
    if start > end {
        return (1, 0);
    }
    (start, end)
}

/// A test suite exercised against every Store implementation.
#[cfg(test)]
pub(super) trait TestSuite<S: Store> {
    fn setup() -> Result<S>;

    fn test() -> Result<()> {
        Self::test_append()?;
        Self::test_get()?;
        Self::test_metadata()?;
        Self::test_scan()?;
        Self::test_truncate_prefix()?;
        Self::test_truncate_suffix()?;
        Ok(())
    }

    fn test_append() -> Result<()> {
        let mut s = Self::setup()?;
        assert_eq!(s.bounds(), (1, 0));
        assert_eq!(s.append(vec![0x01])?, 1);
        assert_eq!(s.append(vec![0x02])?, 2);
        assert_eq!(s.append(vec![0x03])?, 3);
        s.sync()?;
        assert_eq!(s.bounds(), (1, 3));
        assert_eq!(
            s.scan((std::ops::Bound::Unbounded, std::ops::Bound::Unbounded))
                .collect::<Result<Vec<_>>>()?,
            vec![vec![1], vec![2], vec![3]],
        );
        Ok(())
    }

    fn test_get() -> Result<()> {
        let mut s = Self::setup()?;
        s.append(vec![0x01])?;
        s.append(vec![0x02])?;
        s.sync()?;
        assert_eq!(s.get(0)?, None);
        assert_eq!(s.get(1)?, Some(vec![0x01]));
        assert_eq!(s.get(2)?, Some(vec![0x02]));
        assert_eq!(s.get(3)?, None);
        Ok(())
    }

    fn test_metadata() -> Result<()> {
        let mut s = Self::setup()?;
        s.set_metadata(b"a", vec![0x01])?;
        assert_eq!(s.get_metadata(b"a")?, Some(vec![0x01]));
        assert_eq!(s.get_metadata(b"b")?, None);
        s.set_metadata(b"a", vec![0x02])?;
        assert_eq!(s.get_metadata(b"a")?, Some(vec![0x02]));
        Ok(())
    }

    fn test_scan() -> Result<()> {
        use std::ops::Bound::*;
        let mut s = Self::setup()?;
        for i in 1..=5u8 {
            s.append(vec![i])?;
        }
        s.sync()?;

        assert_eq!(
            s.scan((Unbounded, Unbounded)).collect::<Result<Vec<_>>>()?,
            vec![vec![1], vec![2], vec![3], vec![4], vec![5]],
        );
        assert_eq!(
            s.scan((Included(2), Included(4))).collect::<Result<Vec<_>>>()?,
            vec![vec![2], vec![3], vec![4]],
        );
        assert_eq!(
            s.scan((Excluded(3), Unbounded)).collect::<Result<Vec<_>>>()?,
            vec![vec![4], vec![5]],
        );
        assert_eq!(s.scan((Included(4), Excluded(4))).collect::<Result<Vec<_>>>()?, Vec::<Vec<u8>>::new());
        assert_eq!(s.scan((Included(6), Unbounded)).collect::<Result<Vec<_>>>()?, Vec::<Vec<u8>>::new());
        Ok(())
    }

    fn test_truncate_prefix() -> Result<()> {
        use std::ops::Bound::*;
        let mut s = Self::setup()?;
        for i in 1..=5u8 {
            s.append(vec![i])?;
        }
        s.sync()?;

        s.truncate_prefix(3)?;
        assert_eq!(s.bounds(), (3, 5));
        assert_eq!(s.get(2)?, None);
        assert_eq!(s.get(3)?, Some(vec![3]));
        assert_eq!(
            s.scan((Unbounded, Unbounded)).collect::<Result<Vec<_>>>()?,
            vec![vec![3], vec![4], vec![5]],
        );

        // Appends continue from the absolute index.
        assert_eq!(s.append(vec![6])?, 6);

        // Truncating the entire log leaves the index position intact.
        s.truncate_prefix(7)?;
        assert_eq!(s.bounds(), (7, 6));
        assert_eq!(s.append(vec![7])?, 7);

        // Truncating far beyond the end repositions the store there.
        s.truncate_prefix(20)?;
        assert_eq!(s.bounds(), (20, 19));
        assert_eq!(s.append(vec![20])?, 20);
        Ok(())
    }

    fn test_truncate_suffix() -> Result<()> {
        use std::ops::Bound::*;
        let mut s = Self::setup()?;
        for i in 1..=5u8 {
            s.append(vec![i])?;
        }
        s.sync()?;

        // Truncating above the end is a noop.
        s.truncate_suffix(7)?;
        assert_eq!(s.bounds(), (1, 5));

        s.truncate_suffix(3)?;
        assert_eq!(s.bounds(), (1, 3));
        assert_eq!(s.get(4)?, None);
        assert_eq!(
            s.scan((Unbounded, Unbounded)).collect::<Result<Vec<_>>>()?,
            vec![vec![1], vec![2], vec![3]],
        );

        // Replacement entries take the truncated indexes.
        assert_eq!(s.append(vec![0x14])?, 4);
        assert_eq!(s.get(4)?, Some(vec![0x14]));

        // Truncating everything leaves an empty store at the same position.
        s.truncate_suffix(0)?;
        assert_eq!(s.bounds(), (1, 0));
        assert_eq!(s.append(vec![0x11])?, 1);
        Ok(())
    }
}
