//! Snapshot storage. A snapshot is a single file: a header with the last
//! included index, term, and configuration, followed by opaque host state
//! bytes. In-progress snapshots are staged under a distinctive name and only
//! renamed into place once complete, so a crash never leaves a torn
//! snapshot; leftover staging files are swept at startup.

use super::{Configuration, Index, Term};
use crate::encoding::{self, bincode};
use crate::errdata;
use crate::error::Result;

use log::info;
use serde_derive::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read as _, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// The installed snapshot file name.
const SNAPSHOT_FILE: &str = "snapshot";

/// The staging file prefix for in-progress snapshots.
const PARTIAL_PREFIX: &str = "partial";

/// Snapshot metadata, written as the file header.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// The last log index included in the snapshot.
    pub index: Index,
    /// The term of the entry at index.
    pub term: Term,
    /// The log index of the configuration below.
    pub config_index: Index,
    /// The configuration in effect at the snapshot point.
    pub config: Configuration,
}

impl encoding::Value for Meta {}

/// A snapshot store. The variant (memory or filesystem) is chosen at
/// construction. The store is shared between the engine (which installs
/// received snapshots and streams chunks to followers) and the host (which
/// writes its own snapshots), so implementations are used behind a mutex.
pub trait Store: Send {
    /// Returns the installed snapshot's metadata, if any.
    fn installed(&mut self) -> Result<Option<Meta>>;

    /// Reads the installed snapshot's metadata and state bytes.
    fn read(&mut self) -> Result<(Meta, Vec<u8>)>;

    /// Reads a chunk of the installed snapshot's raw file bytes, returning
    /// the chunk and the total file size.
    fn chunk(&mut self, offset: u64, size: u64) -> Result<(Vec<u8>, u64)>;

    /// Creates a staged writer for a new local snapshot. The header for the
    /// given metadata is written before any state bytes.
    fn writer(&mut self, meta: &Meta) -> Result<Box<dyn Writer>>;

    /// Creates a staged writer for raw file bytes received from a leader.
    fn staging(&mut self) -> Result<Box<dyn Writer>>;
}

/// An in-progress snapshot. Appending is sequential; save atomically
/// installs the snapshot, discard reclaims it.
pub trait Writer: Send {
    /// Appends bytes to the staged snapshot.
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// The number of bytes written so far, including any header.
    fn written(&self) -> u64;

    /// Atomically installs the staged snapshot, returning its file size.
    fn save(self: Box<Self>) -> Result<u64>;

    /// Discards the staged snapshot.
    fn discard(self: Box<Self>) -> Result<()>;
}

/// Splits raw snapshot file bytes into the header and the state bytes.
fn decode_file(bytes: &[u8]) -> Result<(Meta, Vec<u8>)> {
    let mut reader = std::io::Cursor::new(bytes);
    let meta: Meta = bincode::deserialize_from(&mut reader)?;
    let state = bytes[reader.position() as usize..].to_vec();
    Ok((meta, state))
}

/// An in-memory snapshot store, for tests and temporary storage. Holds the
/// raw file bytes of the installed snapshot.
pub struct Memory {
    installed: Arc<Mutex<Option<Vec<u8>>>>,
}

impl Memory {
    pub fn new() -> Self {
        Self { installed: Arc::new(Mutex::new(None)) }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for Memory {
    fn installed(&mut self) -> Result<Option<Meta>> {
        match self.installed.lock()?.as_ref() {
            Some(bytes) => Ok(Some(decode_file(bytes)?.0)),
            None => Ok(None),
        }
    }

    fn read(&mut self) -> Result<(Meta, Vec<u8>)> {
        match self.installed.lock()?.as_ref() {
            Some(bytes) => decode_file(bytes),
            None => errdata!("no snapshot installed"),
        }
    }

    fn chunk(&mut self, offset: u64, size: u64) -> Result<(Vec<u8>, u64)> {
        match self.installed.lock()?.as_ref() {
            Some(bytes) => {
                let total = bytes.len() as u64;
                let start = offset.min(total) as usize;
                let end = (offset + size).min(total) as usize;
                Ok((bytes[start..end].to_vec(), total))
            }
            None => errdata!("no snapshot installed"),
        }
    }

    fn writer(&mut self, meta: &Meta) -> Result<Box<dyn Writer>> {
        let mut writer =
            MemoryWriter { buffer: Vec::new(), installed: self.installed.clone() };
        writer.append(&bincode::serialize(meta)?)?;
        Ok(Box::new(writer))
    }

    fn staging(&mut self) -> Result<Box<dyn Writer>> {
        Ok(Box::new(MemoryWriter { buffer: Vec::new(), installed: self.installed.clone() }))
    }
}

struct MemoryWriter {
    buffer: Vec<u8>,
    installed: Arc<Mutex<Option<Vec<u8>>>>,
}

impl Writer for MemoryWriter {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    fn written(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn save(self: Box<Self>) -> Result<u64> {
        let MemoryWriter { buffer, installed } = *self;
        let size = buffer.len() as u64;
        // Reject torn snapshots up front rather than at the next read.
        decode_file(&buffer)?;
        *installed.lock()? = Some(buffer);
        Ok(size)
    }

    fn discard(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// A filesystem snapshot store: a directory containing exactly one installed
/// `snapshot` file plus any in-progress `partial.<seconds>.<micros>` files,
/// which are purged at startup.
pub struct Filesystem {
    dir: PathBuf,
}

impl Filesystem {
    /// Creates or opens a snapshot directory, sweeping stale staging files.
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let fs = Self { dir: dir.to_path_buf() };
        fs.sweep()?;
        Ok(fs)
    }

    /// Removes leftover staging files, typically after a crash mid-snapshot.
    fn sweep(&self) -> Result<()> {
        for dirent in std::fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let name = dirent.file_name().to_string_lossy().to_string();
            if name.starts_with(PARTIAL_PREFIX) {
                info!("Removing incomplete snapshot {name}");
                std::fs::remove_file(dirent.path())?;
            }
        }
        Ok(())
    }

    fn open_installed(&self) -> Result<Option<File>> {
        match File::open(self.dir.join(SNAPSHOT_FILE)) {
            Ok(file) => Ok(Some(file)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Generates a staging file name from the current wall clock.
    fn staging_name() -> String {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        format!("{PARTIAL_PREFIX}.{:010}.{:06}", now.as_secs(), now.subsec_micros())
    }

    fn open_staging(&self) -> Result<FileWriter> {
        let name = Self::staging_name();
        let path = self.dir.join(&name);
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        Ok(FileWriter {
            file,
            path,
            install_path: self.dir.join(SNAPSHOT_FILE),
            dir: self.dir.clone(),
            written: 0,
        })
    }
}

impl Store for Filesystem {
    fn installed(&mut self) -> Result<Option<Meta>> {
        match self.open_installed()? {
            Some(file) => Ok(Some(bincode::deserialize_from(BufReader::new(file))?)),
            None => Ok(None),
        }
    }

    fn read(&mut self) -> Result<(Meta, Vec<u8>)> {
        let Some(file) = self.open_installed()? else {
            return errdata!("no snapshot installed");
        };
        let mut reader = BufReader::new(file);
        let meta: Meta = bincode::deserialize_from(&mut reader)?;
        let mut state = Vec::new();
        reader.read_to_end(&mut state)?;
        Ok((meta, state))
    }

    fn chunk(&mut self, offset: u64, size: u64) -> Result<(Vec<u8>, u64)> {
        let Some(mut file) = self.open_installed()? else {
            return errdata!("no snapshot installed");
        };
        let total = file.metadata()?.len();
        let len = size.min(total.saturating_sub(offset));
        let mut data = vec![0; len as usize];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut data)?;
        Ok((data, total))
    }

    fn writer(&mut self, meta: &Meta) -> Result<Box<dyn Writer>> {
        let mut writer = self.open_staging()?;
        writer.append(&bincode::serialize(meta)?)?;
        Ok(Box::new(writer))
    }

    fn staging(&mut self) -> Result<Box<dyn Writer>> {
        Ok(Box::new(self.open_staging()?))
    }
}

struct FileWriter {
    file: File,
    path: PathBuf,
    install_path: PathBuf,
    dir: PathBuf,
    written: u64,
}

impl Writer for FileWriter {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn written(&self) -> u64 {
        self.written
    }

    fn save(self: Box<Self>) -> Result<u64> {
        let FileWriter { file, path, install_path, dir, .. } = *self;
        file.sync_all()?;
        let size = file.metadata()?.len();
        drop(file);
        std::fs::rename(&path, &install_path)?;
        // Make the rename durable.
        File::open(&dir)?.sync_all()?;
        Ok(size)
    }

    fn discard(self: Box<Self>) -> Result<()> {
        let FileWriter { file, path, .. } = *self;
        drop(file);
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
