use super::{resolve_range, Scan, Store};
use crate::error::Result;

use std::collections::{HashMap, VecDeque};
use std::ops::Bound;

/// An in-memory log store. Data is not persisted; used for tests and
/// temporary storage.
pub struct Memory {
    /// The index of the first entry (or of the next append when empty).
    first: u64,
    /// The stored entries, starting at first.
    entries: VecDeque<Vec<u8>>,
    /// Metadata cells.
    metadata: HashMap<Vec<u8>, Vec<u8>>,
}

impl Memory {
    /// Creates a new in-memory log store.
    pub fn new() -> Self {
        Self { first: 1, entries: VecDeque::new(), metadata: HashMap::new() }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for Memory {
    fn append(&mut self, entry: Vec<u8>) -> Result<u64> {
        self.entries.push_back(entry);
        Ok(self.first + self.entries.len() as u64 - 1)
    }

    fn bounds(&self) -> (u64, u64) {
        (self.first, self.first + self.entries.len() as u64 - 1)
    }

    fn get(&mut self, index: u64) -> Result<Option<Vec<u8>>> {
        if index < self.first {
            return Ok(None);
        }
        Ok(self.entries.get((index - self.first) as usize).cloned())
    }

    fn scan(&mut self, range: (Bound<u64>, Bound<u64>)) -> Scan<'_> {
        let (start, end) = resolve_range(range, self.bounds());
        if start > end {
            return Box::new(std::iter::empty());
        }
        let skip = (start - self.first) as usize;
        let take = (end - start + 1) as usize;
        Box::new(self.entries.iter().skip(skip).take(take).cloned().map(Ok))
    }

    fn truncate_suffix(&mut self, last: u64) -> Result<()> {
        assert!(last + 1 >= self.first, "truncation below first index {}", self.first);
        self.entries.truncate((last + 1 - self.first) as usize);
        Ok(())
    }

    fn truncate_prefix(&mut self, first: u64) -> Result<()> {
        while self.first < first && !self.entries.is_empty() {
            self.entries.pop_front();
            self.first += 1;
        }
        self.first = self.first.max(first);
        Ok(())
    }

    fn get_metadata(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.metadata.get(key).cloned())
    }

    fn set_metadata(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.metadata.insert(key.to_vec(), value);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}
