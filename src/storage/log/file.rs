use super::{resolve_range, Scan, Store};
use crate::errdata;
use crate::error::Result;

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek as _, SeekFrom, Write as _};
use std::ops::Bound;
use std::path::{Path, PathBuf};

/// The segment size threshold. A new segment file is started once the active
/// segment grows past this.
const SEGMENT_BYTES: u64 = 4 << 20;

/// The metadata file name, holding the durable metadata cells.
const METADATA_FILE: &str = "metadata";

/// The reserved metadata key recording the first retained entry index.
const FIRST_INDEX_KEY: &[u8] = b"first_index";

/// A filesystem log store: a directory of numbered segment files plus a
/// metadata file. Each segment file is named after the index of its first
/// entry and contains sequential entries, length-prefixed with a big-endian
/// u64. Entries are written append-only and a new segment is rolled once the
/// active one exceeds a size threshold; suffix truncation cuts files short,
/// prefix truncation deletes whole segments once a snapshot covers them.
///
/// An in-memory index of entry positions is rebuilt on startup by scanning
/// the segments, which avoids fsyncing a separate index file. Metadata is a
/// bincode-encoded map rewritten and fsynced on every change, since it holds
/// the term/vote cells whose durability Raft's safety depends on.
pub struct Filesystem {
    /// The log directory.
    dir: PathBuf,
    /// Open segments, keyed by the index of their first entry.
    segments: BTreeMap<u64, Segment>,
    /// The index of the first retained entry (or of the next append when the
    /// store is empty). Persisted in metadata across prefix truncations.
    first: u64,
    /// The index of the last entry.
    last: u64,
    /// Metadata cache, mirroring the metadata file.
    metadata: HashMap<Vec<u8>, Vec<u8>>,
    /// The metadata file.
    metadata_file: File,
}

/// A single segment file.
struct Segment {
    /// The index of the segment's first entry.
    first: u64,
    /// The file path, kept for deletion.
    path: PathBuf,
    /// The open file handle.
    file: File,
    /// Byte offset and length of each entry, in index order.
    entries: Vec<(u64, u64)>,
    /// The file size in bytes.
    size: u64,
}

impl Segment {
    /// Opens a segment file and scans its entry positions.
    fn open(path: PathBuf, first: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();
        let mut entries = Vec::new();
        let mut reader = BufReader::new(&file);
        let mut sizebuf = [0; 8];
        let mut pos = 0;
        while pos < size {
            reader.read_exact(&mut sizebuf)?;
            pos += 8;
            let len = u64::from_be_bytes(sizebuf);
            entries.push((pos, len));
            reader.seek_relative(len as i64)?;
            pos += len;
        }
        Ok(Self { first, path, file, entries, size })
    }

    /// Creates a new, empty segment file.
    fn create(path: PathBuf, first: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(&path)?;
        Ok(Self { first, path, file, entries: Vec::new(), size: 0 })
    }

    /// The index of the entry after the segment's last.
    fn end(&self) -> u64 {
        self.first + self.entries.len() as u64
    }

    /// Appends an entry to the segment.
    fn append(&mut self, entry: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&(entry.len() as u64).to_be_bytes())?;
        self.file.write_all(entry)?;
        self.entries.push((self.size + 8, entry.len() as u64));
        self.size += 8 + entry.len() as u64;
        Ok(())
    }

    /// Reads the entry at the given index.
    fn get(&mut self, index: u64) -> Result<Vec<u8>> {
        let (pos, len) = self.entries[(index - self.first) as usize];
        let mut entry = vec![0; len as usize];
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(&mut entry)?;
        Ok(entry)
    }

    /// Truncates the segment after the given index.
    fn truncate(&mut self, last: u64) -> Result<()> {
        let keep = (last + 1 - self.first) as usize;
        self.size = self.entries.get(keep).map(|(pos, _)| pos - 8).unwrap_or(self.size);
        self.entries.truncate(keep);
        self.file.set_len(self.size)?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl Filesystem {
    /// Creates or opens a filesystem log store in the given directory.
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let metadata_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join(METADATA_FILE))?;
        let metadata = Self::load_metadata(&metadata_file)?;
        let first = metadata
            .get(FIRST_INDEX_KEY)
            .map(|v| crate::encoding::bincode::deserialize(v))
            .transpose()?
            .unwrap_or(1);

        let mut segments = BTreeMap::new();
        let mut names = Vec::new();
        for dirent in std::fs::read_dir(dir)? {
            let dirent = dirent?;
            if let Ok(index) = dirent.file_name().to_string_lossy().parse::<u64>() {
                names.push((index, dirent.path()));
            }
        }
        names.sort();
        let mut last = first - 1;
        for (index, path) in names {
            let segment = Segment::open(path, index)?;
            if last >= first && index != last + 1 {
                return errdata!("log segment {index} is not contiguous with {last}");
            }
            if last < first && index > first {
                return errdata!("log segments begin at {index}, after lower bound {first}");
            }
            last = segment.end() - 1;
            segments.insert(index, segment);
        }
        // Segments fully covered by a prefix truncation may survive a crash;
        // drop them now.
        let stale: Vec<u64> =
            segments.iter().filter(|(_, s)| s.end() <= first).map(|(i, _)| *i).collect();
        for index in stale {
            let segment = segments.remove(&index).unwrap();
            std::fs::remove_file(&segment.path)?;
        }
        last = last.max(first - 1);

        Ok(Self { dir: dir.to_path_buf(), segments, first, last, metadata, metadata_file })
    }

    /// Loads the metadata map from the metadata file.
    fn load_metadata(file: &File) -> Result<HashMap<Vec<u8>, Vec<u8>>> {
        if file.metadata()?.len() == 0 {
            return Ok(HashMap::new());
        }
        crate::encoding::bincode::deserialize_from(BufReader::new(file))
    }

    /// Rewrites and fsyncs the metadata file.
    fn save_metadata(&mut self) -> Result<()> {
        self.metadata_file.set_len(0)?;
        self.metadata_file.seek(SeekFrom::Start(0))?;
        crate::encoding::bincode::serialize_into(&mut self.metadata_file, &self.metadata)?;
        self.metadata_file.sync_data()?;
        Ok(())
    }

    /// Returns the segment containing the given index, if any.
    fn segment_for(&mut self, index: u64) -> Option<&mut Segment> {
        self.segments
            .range_mut(..=index)
            .next_back()
            .map(|(_, s)| s)
            .filter(|s| index < s.end())
    }
}

impl Store for Filesystem {
    fn append(&mut self, entry: Vec<u8>) -> Result<u64> {
        let index = self.last + 1;
        // Roll a new segment if the active one is full or missing.
        let roll = match self.segments.values().next_back() {
            Some(segment) => segment.size >= SEGMENT_BYTES,
            None => true,
        };
        if roll {
            if let Some(segment) = self.segments.values_mut().next_back() {
                segment.file.sync_data()?;
            }
            let path = self.dir.join(format!("{index:020}"));
            self.segments.insert(index, Segment::create(path, index)?);
        }
        self.segments.values_mut().next_back().unwrap().append(&entry)?;
        self.last = index;
        Ok(index)
    }

    fn bounds(&self) -> (u64, u64) {
        (self.first, self.last)
    }

    fn get(&mut self, index: u64) -> Result<Option<Vec<u8>>> {
        if index < self.first || index > self.last {
            return Ok(None);
        }
        match self.segment_for(index) {
            Some(segment) => Ok(Some(segment.get(index)?)),
            None => Ok(None),
        }
    }

    fn scan(&mut self, range: (Bound<u64>, Bound<u64>)) -> Scan<'_> {
        let (start, end) = resolve_range(range, self.bounds());
        let mut next = start;
        Box::new(std::iter::from_fn(move || {
            if next > end {
                return None;
            }
            let index = next;
            next += 1;
            match self.get(index) {
                Ok(Some(entry)) => Some(Ok(entry)),
                Ok(None) => None,
                Err(err) => Some(Err(err)),
            }
        }))
    }

    fn truncate_suffix(&mut self, last: u64) -> Result<()> {
        assert!(last + 1 >= self.first, "truncation below first index {}", self.first);
        if last >= self.last {
            return Ok(());
        }
        // Remove segments entirely above the cut, then cut the boundary one.
        let removed: Vec<u64> =
            self.segments.range(last + 1..).map(|(index, _)| *index).collect();
        for index in removed {
            let segment = self.segments.remove(&index).unwrap();
            std::fs::remove_file(&segment.path)?;
        }
        if let Some(segment) = self.segments.values_mut().next_back() {
            if segment.end() > last + 1 {
                segment.truncate(last)?;
            }
        }
        self.last = last;
        Ok(())
    }

    fn truncate_prefix(&mut self, first: u64) -> Result<()> {
        if first <= self.first {
            return Ok(());
        }
        // Persist the new lower bound before deleting anything, so a crash
        // mid-delete recovers to a consistent range.
        self.metadata
            .insert(FIRST_INDEX_KEY.to_vec(), crate::encoding::bincode::serialize(&first)?);
        self.save_metadata()?;
        self.first = first;
        // Only delete segments whose entries all fall below the bound; a
        // partially covered segment is retained and its leading entries are
        // simply masked by the bound.
        let removed: Vec<u64> = self
            .segments
            .iter()
            .filter(|(_, s)| s.end() <= first)
            .map(|(index, _)| *index)
            .collect();
        for index in removed {
            let segment = self.segments.remove(&index).unwrap();
            std::fs::remove_file(&segment.path)?;
        }
        if self.last < first {
            self.last = first - 1;
        }
        Ok(())
    }

    fn get_metadata(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.metadata.get(key).cloned())
    }

    fn set_metadata(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.metadata.insert(key.to_vec(), value);
        self.save_metadata()
    }

    fn sync(&mut self) -> Result<()> {
        if let Some(segment) = self.segments.values_mut().next_back() {
            segment.file.sync_data()?;
        }
        Ok(())
    }
}

impl Drop for Filesystem {
    /// Attempts to fsync all data on drop.
    fn drop(&mut self) {
        self.metadata_file.sync_all().ok();
        for segment in self.segments.values_mut() {
            segment.file.sync_all().ok();
        }
    }
}
