//! Append-only file revision store.
//!
//! Directory layout:
//!
//! ```text
//! <dir>/
//! ├─ LOCK            # Advisory lock for single-process access
//! └─ revisions.log   # Framed log records
//! ```

use crate::error::{StorageError, StorageResult};
use crate::memory::DEFAULT_LOCK_TIMEOUT;
use crate::record::{read_frame, Frame, LogRecord};
use crate::revision::{DocumentId, Revision, RevisionId, SequenceNumber, StoredDocument};
use crate::store::RevisionStore;
use crate::table::DocumentTable;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const LOCK_FILE: &str = "LOCK";
const LOG_FILE: &str = "revisions.log";

/// A revision store persisted as an append-only log.
///
/// On open, the log is replayed into memory. A torn tail left by a crash
/// is truncated; every record before it is kept. Appends always start at
/// the end of the last complete record, and a failed append is rolled
/// back, so a torn frame never hides later records.
///
/// # Thread Safety
///
/// The table lock is held across the log append so that log order matches
/// sequence order.
#[derive(Debug)]
pub struct FileRevisionStore {
    dir: PathBuf,
    log: Mutex<LogFile>,
    table: RwLock<DocumentTable>,
    lock_timeout: Duration,
    _lock_file: File,
}

impl FileRevisionStore {
    /// Opens or creates a store in `dir`.
    ///
    /// # Errors
    ///
    /// Returns `Locked` if another process holds the directory, or an I/O
    /// error if it cannot be created or read.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        Self::open_with_timeout(dir, DEFAULT_LOCK_TIMEOUT)
    }

    /// Opens or creates a store with a custom write-lock timeout.
    ///
    /// # Errors
    ///
    /// See [`FileRevisionStore::open`].
    pub fn open_with_timeout(dir: &Path, lock_timeout: Duration) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked {
                path: dir.to_path_buf(),
            });
        }

        let mut log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOG_FILE))?;

        let (table, end) = replay(&mut log)?;
        debug!(
            path = %dir.display(),
            last_sequence = table.last_sequence().as_u64(),
            log_bytes = end,
            "opened revision log"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            log: Mutex::new(LogFile { file: log, end }),
            table: RwLock::new(table),
            lock_timeout,
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn append(&self, record: &LogRecord) -> StorageResult<()> {
        let frame = record.encode()?;
        self.log.lock().append(&frame)
    }

    /// Writes bytes past the last complete record without advancing it,
    /// leaving the log as a failed append whose rollback also failed.
    #[cfg(test)]
    fn write_torn_bytes(&self, bytes: &[u8]) -> StorageResult<()> {
        let mut log = self.log.lock();
        let end = log.end;
        log.file.seek(SeekFrom::Start(end))?;
        log.file.write_all(bytes)?;
        log.file.flush()?;
        Ok(())
    }
}

/// The open log and the offset just past its last complete record.
#[derive(Debug)]
struct LogFile {
    file: File,
    end: u64,
}

impl LogFile {
    fn append(&mut self, frame: &[u8]) -> StorageResult<()> {
        let start = self.end;
        match self.write_at(start, frame) {
            Ok(()) => {
                self.end = start + frame.len() as u64;
                Ok(())
            }
            Err(err) => {
                warn!(offset = start, error = %err, "revision log append failed; rolling back");
                if let Err(rollback) = self.file.set_len(start) {
                    warn!(offset = start, error = %rollback, "cannot truncate failed append");
                }
                Err(err.into())
            }
        }
    }

    fn write_at(&mut self, offset: u64, frame: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(frame)?;
        self.file.flush()
    }
}

/// Rebuilds the table from the log, truncating any torn tail. Returns the
/// table and the length of the valid log.
fn replay(log: &mut File) -> StorageResult<(DocumentTable, u64)> {
    let mut data = Vec::new();
    log.seek(SeekFrom::Start(0))?;
    log.read_to_end(&mut data)?;

    let mut table = DocumentTable::default();
    let mut offset = 0usize;
    loop {
        match read_frame(&data[offset..])? {
            Frame::Record(record, used) => {
                match record {
                    LogRecord::Commit {
                        sequence,
                        revision,
                        history,
                    } => table.apply_commit(revision, history, sequence),
                    LogRecord::Purge { sequence, doc_id } => {
                        table.apply_purge(&doc_id, sequence);
                    }
                    LogRecord::Raw { key, value } => table.apply_raw(&key, value),
                }
                offset += used;
            }
            Frame::Torn => {
                warn!(
                    valid_bytes = offset,
                    discarded_bytes = data.len() - offset,
                    "truncating torn revision log tail"
                );
                log.set_len(offset as u64)?;
                log.sync_all()?;
                break;
            }
            Frame::End => break,
        }
    }
    Ok((table, offset as u64))
}

impl RevisionStore for FileRevisionStore {
    fn current(&self, doc_id: &DocumentId) -> StorageResult<Option<StoredDocument>> {
        Ok(self.table.read().get(doc_id).cloned())
    }

    fn commit(
        &self,
        revision: Revision,
        history: Vec<RevisionId>,
        expected_parent: Option<&RevisionId>,
    ) -> StorageResult<SequenceNumber> {
        let mut table = self
            .table
            .try_write_for(self.lock_timeout)
            .ok_or(StorageError::Busy)?;
        table.check_parent(&revision.doc_id, expected_parent)?;

        let sequence = table.next_sequence();
        let record = LogRecord::Commit {
            sequence,
            revision,
            history,
        };
        self.append(&record)?;

        if let LogRecord::Commit {
            revision, history, ..
        } = record
        {
            table.apply_commit(revision, history, sequence);
        }
        Ok(sequence)
    }

    fn purge(&self, doc_id: &DocumentId) -> StorageResult<Option<SequenceNumber>> {
        let mut table = self
            .table
            .try_write_for(self.lock_timeout)
            .ok_or(StorageError::Busy)?;
        if table.get(doc_id).is_none() {
            return Ok(None);
        }

        let sequence = table.next_sequence();
        self.append(&LogRecord::Purge {
            sequence,
            doc_id: doc_id.clone(),
        })?;
        table.apply_purge(doc_id, sequence);
        Ok(Some(sequence))
    }

    fn changes_since(
        &self,
        since: SequenceNumber,
        limit: usize,
    ) -> StorageResult<Vec<StoredDocument>> {
        Ok(self.table.read().changes_since(since, limit))
    }

    fn last_sequence(&self) -> SequenceNumber {
        self.table.read().last_sequence()
    }

    fn get_raw(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.table.read().get_raw(key).cloned())
    }

    fn put_raw(&self, key: &str, value: Option<Vec<u8>>) -> StorageResult<()> {
        let mut table = self
            .table
            .try_write_for(self.lock_timeout)
            .ok_or(StorageError::Busy)?;
        self.append(&LogRecord::Raw {
            key: key.to_string(),
            value: value.clone(),
        })?;
        table.apply_raw(key, value);
        Ok(())
    }

    fn document_count(&self) -> usize {
        self.table.read().live_count()
    }

    fn sync(&self) -> StorageResult<()> {
        self.log.lock().file.sync_all()?;
        Ok(())
    }
}
