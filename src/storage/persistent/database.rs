//! The embedded document database.
//!
//! Holds every collection in memory for reads, logs each mutation to the WAL
//! before applying it, and periodically compacts the state into a snapshot
//! segment. Opening the same directory again restores the state from the
//! newest segment plus the log.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use uuid::Uuid;

use crate::storage::traits::StorageError;
use crate::value::{Document, Value};

use super::file_lock::FileLock;
use super::segment::{SegmentData, SegmentManager};
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

/// File name of the write-ahead log inside the database directory.
pub const WAL_FILE: &str = "convostore.wal";

/// Directory holding snapshot segments.
pub const SEGMENTS_DIR: &str = "segments";

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn io_err(context: &str, err: &std::io::Error) -> StorageError {
    StorageError::BackendError(format!("{context}: {err}"))
}

/// Applies one logged mutation to the in-memory state.
///
/// Used both for live writes and for WAL replay, so it must never fail.
fn apply(state: &mut SegmentData, kind: &WalEntryKind) {
    match kind {
        WalEntryKind::Upsert {
            collection,
            id,
            fields,
        } => {
            let doc = state
                .collections
                .entry(collection.clone())
                .or_default()
                .entry(id.clone())
                .or_default();
            doc.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        WalEntryKind::Replace {
            collection,
            id,
            document,
        } => {
            state
                .collections
                .entry(collection.clone())
                .or_default()
                .insert(id.clone(), document.clone());
        }
        WalEntryKind::Unset { collection, id, key } => {
            if let Some(doc) = state.collections.get_mut(collection).and_then(|c| c.get_mut(id)) {
                doc.remove(key);
            }
        }
        WalEntryKind::Delete { collection, id } => {
            if let Some(coll) = state.collections.get_mut(collection) {
                coll.remove(id);
            }
        }
        WalEntryKind::Retain { collection, ids } => {
            if let Some(coll) = state.collections.get_mut(collection) {
                coll.retain(|id, _| ids.contains(id));
            }
        }
        WalEntryKind::DropCollection { collection } => {
            state.collections.remove(collection);
        }
        WalEntryKind::CopyCollection { source, target } => {
            let copy = state.collections.get(source).cloned().unwrap_or_default();
            state.collections.insert(target.clone(), copy);
        }
        WalEntryKind::Checkpoint { .. } => {}
    }
}

/// Result of a compaction.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// Number of WAL entries folded into the snapshot.
    pub entries_compacted: u64,
    /// Number of documents in the snapshot.
    pub documents: u64,
    /// Path to the new segment file (if one was written).
    pub segment_path: Option<PathBuf>,
    /// WAL size before compaction.
    pub wal_size_before: u64,
    /// WAL size after compaction.
    pub wal_size_after: u64,
}

/// A durable store of named document collections in one directory.
///
/// Shared between storage managers as `Arc<DocumentDatabase>`; every manager
/// holding the same handle sees the same data.
pub struct DocumentDatabase {
    dir: PathBuf,
    instance: Uuid,
    _lock: FileLock,
    wal: WriteAheadLog,
    segments: Mutex<SegmentManager>,
    state: RwLock<SegmentData>,
    claims: Mutex<BTreeMap<String, usize>>,
    config: PersistentConfig,
}

impl std::fmt::Debug for DocumentDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentDatabase")
            .field("dir", &self.dir)
            .field("instance", &self.instance)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DocumentDatabase {
    /// Opens or creates a database in `dir`.
    ///
    /// # Errors
    /// - `ConnectionError` if the directory cannot be created or is already open
    /// - `BackendError` if the log or segments cannot be read
    /// - `SerializationError` if a WAL entry is corrupted
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|e| {
            StorageError::ConnectionError(format!(
                "failed to create database directory {}: {e}",
                dir.display()
            ))
        })?;

        let lock = FileLock::acquire(dir).map_err(|e| {
            StorageError::ConnectionError(format!(
                "failed to lock database directory {}: {e}",
                dir.display()
            ))
        })?;

        let segments = SegmentManager::open(&dir.join(SEGMENTS_DIR))
            .map_err(|e| io_err("failed to open segments", &e))?;
        let mut state = segments
            .load_latest()
            .map_err(|e| io_err("failed to load segment data", &e))?;

        let wal = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)
            .map_err(|e| io_err("failed to open WAL", &e))?;

        let mut replayed = 0u64;
        for entry in wal.iter().map_err(|e| io_err("failed to iterate WAL", &e))? {
            let entry = entry.map_err(|e| {
                StorageError::SerializationError(format!("corrupted WAL entry: {e}"))
            })?;
            apply(&mut state, &entry.kind);
            replayed += 1;
        }

        tracing::info!(
            dir = %dir.display(),
            segments = segments.segments().len(),
            replayed,
            collections = state.collections.len(),
            "opened document database"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            instance: Uuid::new_v4(),
            _lock: lock,
            wal,
            segments: Mutex::new(segments),
            state: RwLock::new(state),
            claims: Mutex::new(BTreeMap::new()),
            config,
        })
    }

    /// The database directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Identity of this open handle.
    #[must_use]
    pub const fn instance_id(&self) -> Uuid {
        self.instance
    }

    /// The configuration this database was opened with.
    #[must_use]
    pub const fn config(&self) -> &PersistentConfig {
        &self.config
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, SegmentData>, StorageError> {
        self.state.read().map_err(|_| lock_err("database.read"))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, SegmentData>, StorageError> {
        self.state.write().map_err(|_| lock_err("database.write"))
    }

    fn log_and_apply(&self, state: &mut SegmentData, kind: WalEntryKind) -> Result<(), StorageError> {
        self.wal
            .append(kind.clone())
            .map_err(|e| io_err("failed to append to WAL", &e))?;
        apply(state, &kind);
        Ok(())
    }

    fn commit(&self, kind: WalEntryKind) -> Result<(), StorageError> {
        {
            let mut state = self.write_state()?;
            self.log_and_apply(&mut state, kind)?;
        }
        self.maybe_compact();
        Ok(())
    }

    fn maybe_compact(&self) {
        if !self.config.auto_compact {
            return;
        }
        match self.wal.size_bytes() {
            Ok(size) if size > self.config.max_wal_size => {
                if let Err(e) = self.compact() {
                    tracing::warn!(error = %e, "automatic compaction failed");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "failed to read WAL size"),
        }
    }

    // --- namespace claims ---

    /// Registers a holder of a collection prefix on this handle.
    ///
    /// Claims live as long as the handle and are not persisted. An exclusive
    /// claim fails when the prefix is already held; a shared claim always
    /// succeeds. Returns true if the claim was granted.
    pub fn claim_namespace(&self, prefix: &str, exclusive: bool) -> Result<bool, StorageError> {
        let mut claims = self.claims.lock().map_err(|_| lock_err("database.claims"))?;
        if exclusive && claims.contains_key(prefix) {
            return Ok(false);
        }
        *claims.entry(prefix.to_string()).or_insert(0) += 1;
        Ok(true)
    }

    /// Gives back one claim on `prefix`.
    pub fn release_namespace(&self, prefix: &str) {
        let Ok(mut claims) = self.claims.lock() else {
            tracing::warn!(prefix, "claims lock poisoned; namespace not released");
            return;
        };
        if let Some(holders) = claims.get_mut(prefix) {
            *holders = holders.saturating_sub(1);
            if *holders == 0 {
                claims.remove(prefix);
            }
        }
    }

    /// Returns true if any holder has claimed `prefix`.
    pub fn is_claimed(&self, prefix: &str) -> Result<bool, StorageError> {
        Ok(self
            .claims
            .lock()
            .map_err(|_| lock_err("database.claims"))?
            .contains_key(prefix))
    }

    // --- reads ---

    /// Returns a copy of a document.
    pub fn find_one(&self, collection: &str, id: &str) -> Result<Option<Document>, StorageError> {
        Ok(self
            .read_state()?
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned())
    }

    /// Returns one field of a document.
    pub fn get_field(
        &self,
        collection: &str,
        id: &str,
        key: &str,
    ) -> Result<Option<Value>, StorageError> {
        Ok(self
            .read_state()?
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .and_then(|d| d.get(key))
            .cloned())
    }

    /// Keys of a document; empty if the document is missing.
    pub fn keys(&self, collection: &str, id: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .read_state()?
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// Returns true if the document exists.
    pub fn contains(&self, collection: &str, id: &str) -> Result<bool, StorageError> {
        Ok(self
            .read_state()?
            .collections
            .get(collection)
            .map_or(false, |c| c.contains_key(id)))
    }

    /// Document ids of a collection, sorted.
    pub fn ids(&self, collection: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .read_state()?
            .collections
            .get(collection)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> Result<usize, StorageError> {
        Ok(self
            .read_state()?
            .collections
            .get(collection)
            .map_or(0, |c| c.len()))
    }

    /// Names of all collections, sorted.
    pub fn collection_names(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.read_state()?.collections.keys().cloned().collect())
    }

    /// Returns true if the collection exists.
    pub fn has_collection(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.read_state()?.collections.contains_key(name))
    }

    // --- writes ---

    /// Merges `fields` into a document, creating it if needed.
    pub fn upsert(&self, collection: &str, id: &str, fields: Document) -> Result<(), StorageError> {
        self.commit(WalEntryKind::Upsert {
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
        })
    }

    /// Sets a single field, leaving the rest of the document untouched.
    pub fn set_field(
        &self,
        collection: &str,
        id: &str,
        key: &str,
        value: Value,
    ) -> Result<(), StorageError> {
        let mut fields = Document::new();
        fields.insert(key.to_string(), value);
        self.upsert(collection, id, fields)
    }

    /// Replaces a document wholesale.
    pub fn replace(&self, collection: &str, id: &str, document: Document) -> Result<(), StorageError> {
        self.commit(WalEntryKind::Replace {
            collection: collection.to_string(),
            id: id.to_string(),
            document,
        })
    }

    /// Creates an empty document unless one exists. Returns true if created.
    pub fn ensure(&self, collection: &str, id: &str) -> Result<bool, StorageError> {
        let created = {
            let mut state = self.write_state()?;
            let exists = state
                .collections
                .get(collection)
                .map_or(false, |c| c.contains_key(id));
            if !exists {
                self.log_and_apply(
                    &mut state,
                    WalEntryKind::Replace {
                        collection: collection.to_string(),
                        id: id.to_string(),
                        document: Document::new(),
                    },
                )?;
            }
            !exists
        };
        if created {
            self.maybe_compact();
        }
        Ok(created)
    }

    /// Removes one key. Returns false if the key was not present.
    pub fn unset(&self, collection: &str, id: &str, key: &str) -> Result<bool, StorageError> {
        let removed = {
            let mut state = self.write_state()?;
            let present = state
                .collections
                .get(collection)
                .and_then(|c| c.get(id))
                .map_or(false, |d| d.contains_key(key));
            if present {
                self.log_and_apply(
                    &mut state,
                    WalEntryKind::Unset {
                        collection: collection.to_string(),
                        id: id.to_string(),
                        key: key.to_string(),
                    },
                )?;
            }
            present
        };
        if removed {
            self.maybe_compact();
        }
        Ok(removed)
    }

    /// Removes a document. Returns false if it did not exist.
    pub fn delete_one(&self, collection: &str, id: &str) -> Result<bool, StorageError> {
        let removed = {
            let mut state = self.write_state()?;
            let present = state
                .collections
                .get(collection)
                .map_or(false, |c| c.contains_key(id));
            if present {
                self.log_and_apply(
                    &mut state,
                    WalEntryKind::Delete {
                        collection: collection.to_string(),
                        id: id.to_string(),
                    },
                )?;
            }
            present
        };
        if removed {
            self.maybe_compact();
        }
        Ok(removed)
    }

    /// Removes every document whose id is not in `keep`. Returns the number removed.
    pub fn retain(&self, collection: &str, keep: &BTreeSet<String>) -> Result<usize, StorageError> {
        let removed = {
            let mut state = self.write_state()?;
            let doomed = state
                .collections
                .get(collection)
                .map_or(0, |c| c.keys().filter(|id| !keep.contains(*id)).count());
            if doomed > 0 {
                self.log_and_apply(
                    &mut state,
                    WalEntryKind::Retain {
                        collection: collection.to_string(),
                        ids: keep.clone(),
                    },
                )?;
            }
            doomed
        };
        if removed > 0 {
            self.maybe_compact();
        }
        Ok(removed)
    }

    /// Drops a collection. Returns false if it did not exist.
    pub fn drop_collection(&self, name: &str) -> Result<bool, StorageError> {
        let existed = {
            let mut state = self.write_state()?;
            let existed = state.collections.contains_key(name);
            if existed {
                self.log_and_apply(
                    &mut state,
                    WalEntryKind::DropCollection {
                        collection: name.to_string(),
                    },
                )?;
            }
            existed
        };
        if existed {
            self.maybe_compact();
        }
        Ok(existed)
    }

    /// Drops every collection. Returns the number dropped.
    pub fn drop_all(&self) -> Result<usize, StorageError> {
        let mut dropped = 0;
        for name in self.collection_names()? {
            if self.drop_collection(&name)? {
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    /// Replaces `target` with a copy of `source`. Returns the number of documents copied.
    pub fn copy_collection(&self, source: &str, target: &str) -> Result<usize, StorageError> {
        let copied = {
            let mut state = self.write_state()?;
            self.log_and_apply(
                &mut state,
                WalEntryKind::CopyCollection {
                    source: source.to_string(),
                    target: target.to_string(),
                },
            )?;
            state.collections.get(target).map_or(0, |c| c.len())
        };
        self.maybe_compact();
        Ok(copied)
    }

    // --- maintenance ---

    /// Writes the current state into a new segment and truncates the WAL.
    ///
    /// Writers are blocked for the duration, so no mutation can slip between
    /// the snapshot and the truncation.
    pub fn compact(&self) -> Result<CompactionResult, StorageError> {
        let state = self.write_state()?;

        let entries = self
            .wal
            .current_sequence()
            .map_err(|e| io_err("failed to read WAL sequence", &e))?;
        let wal_size_before = self.wal.size_bytes().unwrap_or(0);
        if entries == 0 {
            return Ok(CompactionResult {
                entries_compacted: 0,
                documents: state.document_count(),
                segment_path: None,
                wal_size_before,
                wal_size_after: wal_size_before,
            });
        }

        let mut segments = self.segments.lock().map_err(|_| lock_err("database.segments"))?;
        let mut writer = segments
            .create_segment_writer()
            .map_err(|e| io_err("failed to create segment writer", &e))?;
        if let Err(e) = writer.write_data(&state) {
            let _ = writer.abort();
            return Err(io_err("failed to write segment data", &e));
        }
        let segment = writer
            .finalize()
            .map_err(|e| io_err("failed to finalize segment", &e))?;
        let segment_path = segment.path().to_path_buf();
        segments
            .install(segment)
            .map_err(|e| io_err("failed to install segment", &e))?;
        drop(segments);

        self.wal
            .append(WalEntryKind::Checkpoint {
                up_to_sequence: entries,
            })
            .map_err(|e| io_err("failed to write checkpoint", &e))?;
        self.wal
            .truncate()
            .map_err(|e| io_err("failed to truncate WAL", &e))?;

        let result = CompactionResult {
            entries_compacted: entries,
            documents: state.document_count(),
            segment_path: Some(segment_path),
            wal_size_before,
            wal_size_after: self.wal.size_bytes().unwrap_or(0),
        };
        tracing::info!(
            entries = result.entries_compacted,
            documents = result.documents,
            "compacted document database"
        );
        Ok(result)
    }

    /// Current WAL size in bytes.
    #[must_use]
    pub fn wal_size(&self) -> u64 {
        self.wal.size_bytes().unwrap_or(0)
    }

    /// Number of segment files on disk.
    pub fn segment_count(&self) -> Result<usize, StorageError> {
        Ok(self
            .segments
            .lock()
            .map_err(|_| lock_err("database.segments"))?
            .segments()
            .len())
    }
}
