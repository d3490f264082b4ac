//! Byte stores backing the ledger.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{RecoveryError, RecoveryResult};

/// Random-access durable storage for the ledger.
pub trait LedgerStore: Send + Sync {
    /// Current size in bytes.
    fn size(&self) -> RecoveryResult<u64>;

    /// Reads exactly `len` bytes at `offset`; `ShortRead` past the end.
    fn read_at(&self, offset: u64, len: usize) -> RecoveryResult<Vec<u8>>;

    /// Writes `data` at `offset`, growing the store as needed.
    fn write_at(&self, offset: u64, data: &[u8]) -> RecoveryResult<()>;

    /// Returns once earlier writes are durable.
    fn sync(&self) -> RecoveryResult<()>;
}

/// Ledger kept in a regular file.
pub struct FileStore {
    path: PathBuf,
    file: File,
}

impl FileStore {
    /// Opens `path`, creating an empty file if it does not exist.
    pub fn open(path: &Path) -> RecoveryResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        debug!(path = %path.display(), "ledger file opened");
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LedgerStore for FileStore {
    fn size(&self) -> RecoveryResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_at(&self, offset: u64, len: usize) -> RecoveryResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut got = 0;
        while got < len {
            let n = self.file.read_at(&mut buf[got..], offset + got as u64)?;
            if n == 0 {
                return Err(RecoveryError::ShortRead {
                    offset,
                    wanted: len,
                    got,
                });
            }
            got += n;
        }
        Ok(buf)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> RecoveryResult<()> {
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn sync(&self) -> RecoveryResult<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[derive(Default)]
struct MemState {
    data: Vec<u8>,
    fail_write_at: Option<u64>,
    short_read_from: Option<u64>,
    syncs: u64,
}

/// In-memory store with fault injection. Clones share the same bytes,
/// so a clone can reopen a ledger after the first handle is dropped.
#[derive(Clone, Default)]
pub struct MemStore {
    state: Arc<Mutex<MemState>>,
}

impl MemStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store holding `data`.
    pub fn with_contents(data: Vec<u8>) -> Self {
        let store = Self::default();
        store.state.lock().data = data;
        store
    }

    /// Copy of the stored bytes.
    pub fn contents(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }

    /// Makes writes covering byte `offset` fail with an I/O error.
    pub fn fail_writes_at(&self, offset: Option<u64>) {
        self.state.lock().fail_write_at = offset;
    }

    /// Makes reads reaching `offset` or beyond come back short.
    pub fn short_reads_from(&self, offset: Option<u64>) {
        self.state.lock().short_read_from = offset;
    }

    /// Number of completed syncs.
    pub fn sync_count(&self) -> u64 {
        self.state.lock().syncs
    }
}

impl LedgerStore for MemStore {
    fn size(&self) -> RecoveryResult<u64> {
        Ok(self.state.lock().data.len() as u64)
    }

    fn read_at(&self, offset: u64, len: usize) -> RecoveryResult<Vec<u8>> {
        let state = self.state.lock();
        let mut end = offset as usize + len;
        if let Some(limit) = state.short_read_from {
            end = end.min(limit as usize);
        }
        end = end.min(state.data.len());
        let start = (offset as usize).min(end);
        if end - start < len {
            return Err(RecoveryError::ShortRead {
                offset,
                wanted: len,
                got: end - start,
            });
        }
        Ok(state.data[start..end].to_vec())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> RecoveryResult<()> {
        let mut state = self.state.lock();
        if let Some(bad) = state.fail_write_at {
            if bad >= offset && bad < offset + data.len() as u64 {
                return Err(RecoveryError::IoError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("injected write failure at {}", bad),
                )));
            }
        }
        let start = offset as usize;
        let end = start + data.len();
        if state.data.len() < end {
            state.data.resize(end, 0);
        }
        state.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn sync(&self) -> RecoveryResult<()> {
        self.state.lock().syncs += 1;
        Ok(())
    }
}
