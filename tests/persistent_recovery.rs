//! Crash recovery tests for the document database.
//!
//! These tests verify that the persistent backend correctly handles:
//! - Torn writes at the end of the WAL (simulated crash mid-write)
//! - CRC corruption detection
//! - Compaction into snapshot segments
//! - Reopen through a storage manager

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use convostore::storage::persistent::WAL_FILE;
use convostore::{
    open_database, Backend, ConvoError, DocumentDatabase, PersistentConfig, Speaker, StorageError,
    StorageManager, StorageOptions, Utterance, Value,
};
use tempfile::tempdir;

fn open(dir: &Path) -> Arc<DocumentDatabase> {
    open_database(dir, None).unwrap()
}

fn doc(key: &str, value: impl Into<Value>) -> convostore::Document {
    std::iter::once((key.to_string(), value.into())).collect()
}

/// A torn final entry is dropped; everything before it survives, and writes
/// after recovery are not lost behind the torn bytes.
#[test]
fn test_torn_wal_tail_recovery() {
    let dir = tempdir().unwrap();
    let wal_path = dir.path().join(WAL_FILE);

    {
        let db = open(dir.path());
        for i in 0..5 {
            db.upsert("c", &i.to_string(), doc("n", i)).unwrap();
        }
    }

    {
        let file = OpenOptions::new().write(true).open(&wal_path).unwrap();
        let size = file.metadata().unwrap().len();
        file.set_len(size - 3).unwrap();
    }

    {
        let db = open(dir.path());
        assert_eq!(db.ids("c").unwrap(), vec!["0", "1", "2", "3"]);
        db.upsert("c", "5", doc("n", 5)).unwrap();
    }

    let db = open(dir.path());
    assert_eq!(db.ids("c").unwrap(), vec!["0", "1", "2", "3", "5"]);
    assert_eq!(db.get_field("c", "5", "n").unwrap(), Some(Value::from(5)));
}

/// A flipped byte inside a frame is reported, not silently skipped.
#[test]
fn test_crc_corruption_detection() {
    let dir = tempdir().unwrap();
    let wal_path = dir.path().join(WAL_FILE);

    {
        let db = open(dir.path());
        db.upsert("c", "0", doc("text", "a fairly long value to corrupt")).unwrap();
    }

    {
        let mut bytes = fs::read(&wal_path).unwrap();
        let target = bytes.len() - 12;
        bytes[target] ^= 0xFF;
        fs::write(&wal_path, bytes).unwrap();
    }

    let err = open_database(dir.path(), None).unwrap_err();
    assert!(matches!(
        err,
        ConvoError::Storage(StorageError::SerializationError(_))
    ));
}

/// WAL replay after repeated reopen yields the same state.
#[test]
fn test_wal_replay_idempotency() {
    let dir = tempdir().unwrap();
    {
        let db = open(dir.path());
        db.upsert("c", "x", doc("a", 1)).unwrap();
        db.set_field("c", "x", "b", Value::from(2)).unwrap();
        db.unset("c", "x", "a").unwrap();
    }

    for _ in 0..2 {
        let db = open(dir.path());
        assert_eq!(db.find_one("c", "x").unwrap(), Some(doc("b", 2)));
    }
}

/// Compaction writes a segment, empties the WAL and keeps every document.
#[test]
fn test_compaction_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let db = open(dir.path());
        for i in 0..50 {
            db.upsert("c", &format!("{i:03}"), doc("n", i)).unwrap();
        }
        db.drop_collection("gone").unwrap();
        db.upsert("gone", "0", doc("n", 0)).unwrap();
        db.drop_collection("gone").unwrap();

        let result = db.compact().unwrap();
        assert_eq!(result.documents, 50);
        assert!(result.wal_size_after < result.wal_size_before);
        assert_eq!(db.segment_count().unwrap(), 1);
    }

    let db = open(dir.path());
    assert_eq!(db.count("c").unwrap(), 50);
    assert!(!db.has_collection("gone").unwrap());
}

/// A small WAL limit triggers compaction on its own.
#[test]
fn test_auto_compaction_through_manager() {
    let dir = tempdir().unwrap();
    let config = PersistentConfig {
        max_wal_size: 4 * 1024,
        sync_on_write: false,
        auto_compact: true,
    };

    {
        let db = open_database(dir.path(), Some(config.clone())).unwrap();
        let manager =
            StorageManager::new(Backend::Persistent(Arc::clone(&db)), StorageOptions::named("big"))
                .unwrap();
        let mut bob = Speaker::new(&manager, "bob").unwrap();
        for i in 0..40 {
            let utt = Utterance::builder()
                .id(i)
                .speaker(&mut bob)
                .text("some text that takes up room in the log")
                .build(&manager)
                .unwrap();
            utt.meta().set("index", i).unwrap();
        }
        assert!(db.segment_count().unwrap() >= 1);
        assert!(db.wal_size() <= config.max_wal_size * 2);
    }

    let db = open_database(dir.path(), Some(config)).unwrap();
    let manager = StorageManager::new(
        Backend::Persistent(db),
        StorageOptions::named("big").in_place(true),
    )
    .unwrap();
    assert_eq!(manager.utterances().unwrap().len().unwrap(), 40);
    assert_eq!(
        manager.get_utterance(39).unwrap().meta().get("index").unwrap(),
        Value::from(39)
    );
    assert_eq!(
        manager.get_speaker("bob").unwrap().utterance_ids().unwrap().len(),
        40
    );
}

/// Only one handle may own a database directory.
#[test]
fn test_directory_is_locked_while_open() {
    let dir = tempdir().unwrap();
    let _db = open(dir.path());

    let err = open_database(dir.path(), None).unwrap_err();
    assert!(matches!(
        err,
        ConvoError::Storage(StorageError::ConnectionError(_))
    ));
    assert!(err.is_retryable());
}
