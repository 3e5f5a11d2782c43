//! Write-ahead log for the document database.
//!
//! Every mutation is appended here before it is applied in memory. On open,
//! the database loads the latest segment and replays the log on top of it.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec frame]
//! [ENTRY 2: codec frame]
//! ...
//! ```

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::Document;

use super::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Sequence number, starting at 1 after every truncation.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The logged mutation.
    pub kind: WalEntryKind,
}

/// A logged mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WalEntryKind {
    /// Merge `fields` into a document, creating it if needed.
    Upsert {
        collection: String,
        id: String,
        fields: Document,
    },
    /// Replace a document wholesale.
    Replace {
        collection: String,
        id: String,
        document: Document,
    },
    /// Remove one key from a document.
    Unset {
        collection: String,
        id: String,
        key: String,
    },
    /// Remove a document.
    Delete { collection: String, id: String },
    /// Remove every document whose id is not listed.
    Retain {
        collection: String,
        ids: BTreeSet<String>,
    },
    /// Remove a whole collection.
    DropCollection { collection: String },
    /// Copy every document of `source` into `target`.
    CopyCollection { source: String, target: String },
    /// All entries before this one are persisted in a segment.
    Checkpoint { up_to_sequence: u64 },
}

struct WalWriter {
    out: BufWriter<File>,
    sequence: u64,
}

/// Append-only log of mutations.
///
/// Thread-safe via an internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    sync_on_write: bool,
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("path", &self.path)
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

fn poisoned() -> IoError {
    IoError::new(ErrorKind::Other, "poisoned lock: wal.writer")
}

impl WriteAheadLog {
    /// Opens the log, creating it with a header if absent.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let fresh = std::fs::metadata(path).map_or(true, |m| m.len() < codec::HEADER_LEN);

        let sequence = if fresh {
            let mut file = File::create(path)?;
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
            0
        } else {
            Self::last_valid_sequence(path)?
        };

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(WalWriter {
                out: BufWriter::new(file),
                sequence,
            }),
            sync_on_write,
        })
    }

    fn lock(&self) -> IoResult<MutexGuard<'_, WalWriter>> {
        self.writer.lock().map_err(|_| poisoned())
    }

    /// Appends an entry and returns its sequence number.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut writer = self.lock()?;
        let entry = WalEntry {
            sequence: writer.sequence + 1,
            timestamp: Utc::now(),
            kind,
        };

        let frame = codec::encode(&entry)?;
        writer.out.write_all(&frame)?;
        writer.out.flush()?;
        if self.sync_on_write {
            writer.out.get_ref().sync_data()?;
        }

        writer.sequence = entry.sequence;
        Ok(entry.sequence)
    }

    /// Iterates over the logged entries, oldest first.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// The sequence number of the last appended entry.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.lock()?.sequence)
    }

    /// Size of the log file in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Empties the log after a checkpoint.
    ///
    /// Only call this once the state the entries describe is durable in a
    /// segment.
    pub fn truncate(&self) -> IoResult<()> {
        let mut writer = self.lock()?;
        writer.out.flush()?;

        OpenOptions::new().write(true).open(&self.path)?.set_len(0)?;
        let mut out = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        codec::write_header(&mut out)?;
        out.flush()?;
        if self.sync_on_write {
            out.get_ref().sync_all()?;
        }

        writer.out = out;
        writer.sequence = 0;
        Ok(())
    }

    /// Scans the log for its last intact entry.
    ///
    /// A torn tail (an entry cut short by a crash) is cut off so that new
    /// appends follow the last intact entry. A corrupted entry is left in
    /// place for replay to report.
    fn last_valid_sequence(path: &Path) -> IoResult<u64> {
        let mut iter = WalIterator::new(path)?;
        let mut last = 0;
        let mut valid_len = codec::HEADER_LEN;

        loop {
            match iter.next() {
                Some(Ok(entry)) => {
                    last = entry.sequence;
                    valid_len = iter.reader.stream_position()?;
                }
                Some(Err(e)) => {
                    tracing::warn!(after_sequence = last, error = %e, "WAL corruption detected");
                    return Ok(last);
                }
                None => break,
            }
        }

        if valid_len < iter.file_size {
            tracing::warn!(
                discarded_bytes = iter.file_size - valid_len,
                after_sequence = last,
                "discarding torn WAL tail"
            );
            drop(iter);
            OpenOptions::new().write(true).open(path)?.set_len(valid_len)?;
        }
        Ok(last)
    }
}

/// Iterator over WAL entries.
///
/// Stops silently at a torn tail; yields an error for a corrupted frame.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
    done: bool,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;

        Ok(Self {
            reader,
            file_size,
            done: false,
        })
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.stream_position() {
            Ok(pos) if pos >= self.file_size => {
                self.done = true;
                return None;
            }
            Ok(_) => {}
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        }

        match codec::decode::<WalEntry>(&mut self.reader) {
            Ok(entry) => Some(Ok(entry)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use tempfile::tempdir;

    fn upsert(id: &str) -> WalEntryKind {
        let mut fields = Document::new();
        fields.insert("text".to_string(), Value::from("hi"));
        WalEntryKind::Upsert {
            collection: "c_v0_utterances".to_string(),
            id: id.to_string(),
            fields,
        }
    }

    #[test]
    fn test_wal_append_and_iterate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let wal = WriteAheadLog::open(&path, false).unwrap();
        wal.append(upsert("0")).unwrap();
        wal.append(WalEntryKind::Delete {
            collection: "c_v0_utterances".to_string(),
            id: "0".to_string(),
        })
        .unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 2);
        drop(wal);

        let wal = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 2);

        let entries: Vec<_> = wal.iter().unwrap().collect::<IoResult<_>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, 1);
        assert!(matches!(entries[0].kind, WalEntryKind::Upsert { .. }));
        assert!(matches!(entries[1].kind, WalEntryKind::Delete { .. }));
    }

    #[test]
    fn test_wal_truncate_resets_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let wal = WriteAheadLog::open(&path, true).unwrap();
        wal.append(upsert("0")).unwrap();
        wal.append(upsert("1")).unwrap();
        wal.truncate().unwrap();

        assert_eq!(wal.current_sequence().unwrap(), 0);
        assert_eq!(wal.size_bytes().unwrap(), codec::HEADER_LEN);
        assert_eq!(wal.iter().unwrap().count(), 0);

        wal.append(upsert("2")).unwrap();
        let entries: Vec<_> = wal.iter().unwrap().collect::<IoResult<_>>().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence, 1);
    }

    #[test]
    fn test_wal_torn_tail_is_cut_off() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        {
            let wal = WriteAheadLog::open(&path, true).unwrap();
            wal.append(upsert("0")).unwrap();
            wal.append(upsert("1")).unwrap();
        }

        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let wal = WriteAheadLog::open(&path, true).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 1);
        let entries: Vec<_> = wal.iter().unwrap().collect::<IoResult<_>>().unwrap();
        assert_eq!(entries.len(), 1);

        wal.append(upsert("2")).unwrap();
        drop(wal);

        let wal = WriteAheadLog::open(&path, true).unwrap();
        let entries: Vec<_> = wal.iter().unwrap().collect::<IoResult<_>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].sequence, 2);
    }
}
