//! Persistent storage backend.
//!
//! An embedded document database living in one directory:
//! - Write-ahead logging for crash recovery
//! - File locking so only one handle owns the directory
//! - CRC32 checksums for corruption detection
//! - Snapshot segments written on compaction
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     DocumentDatabase                         │
//! │          collections: name → id → Document (RwLock)          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐                    │
//! │  │ WriteAheadLog   │  │ SegmentManager  │                    │
//! │  │ (append-only)   │  │ (snapshots)     │                    │
//! │  └────────┬────────┘  └────────┬────────┘                    │
//! │           └──────────┬─────────┘                             │
//! │                      ↓                                       │
//! │           ┌─────────────────────┐                            │
//! │           │   FileLock (flock)  │                            │
//! │           └─────────────────────┘                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod codec;
mod collection;
mod database;
mod file_lock;
mod segment;
mod wal;

pub use collection::{PersistentCollection, PersistentRecord};
pub use database::{CompactionResult, DocumentDatabase, SEGMENTS_DIR, WAL_FILE};
pub use file_lock::FileLock;
pub use segment::{Segment, SegmentManager};
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;
use std::sync::Arc;

use crate::error::{ConfigError, ConvoResult};

/// Configuration for the document database.
#[derive(Debug, Clone)]
pub struct PersistentConfig {
    /// WAL size (bytes) above which the database compacts itself.
    pub max_wal_size: u64,
    /// Whether to fsync after every write (slower but safer).
    pub sync_on_write: bool,
    /// Whether to compact automatically once the WAL exceeds `max_wal_size`.
    pub auto_compact: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 64 * 1024 * 1024, // 64 MB
            sync_on_write: true,
            auto_compact: true,
        }
    }
}

impl PersistentConfig {
    const MIN_WAL_SIZE: u64 = 4 * 1024;

    /// Rejects settings that would make compaction degenerate.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max_wal_size must be at least {} bytes (got {})",
                Self::MIN_WAL_SIZE,
                self.max_wal_size
            )));
        }
        Ok(self)
    }
}

/// Open or create a document database at the given path.
///
/// # Errors
/// - If the configuration is invalid
/// - If the path cannot be created or accessed
/// - If the directory is already open
/// - If WAL replay fails due to corruption
///
/// # Example
/// ```rust,no_run
/// use convostore::storage::persistent::open_database;
/// use convostore::{Backend, StorageManager, StorageOptions};
///
/// let db = open_database("./corpora.db", None)?;
/// let manager = StorageManager::new(Backend::Persistent(db), StorageOptions::default())?;
/// # Ok::<(), convostore::ConvoError>(())
/// ```
pub fn open_database(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> ConvoResult<Arc<DocumentDatabase>> {
    let config = config.unwrap_or_default().validate()?;
    Ok(Arc::new(DocumentDatabase::open(path.as_ref(), config)?))
}
