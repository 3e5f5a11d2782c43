//! Collection and record handles over a [`DocumentDatabase`].
//!
//! Handles hold no data themselves: every call reads from or writes to the
//! database, so all handles for the same document agree.

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::storage::traits::{BackendKind, Collection, CollectionId, FieldRecord, StorageError};
use crate::value::{Document, Value};

use super::DocumentDatabase;

/// A named collection inside a document database.
#[derive(Debug, Clone)]
pub struct PersistentCollection {
    id: CollectionId,
    db: Arc<DocumentDatabase>,
}

impl PersistentCollection {
    /// Binds a handle to the physical collection `name`.
    #[must_use]
    pub fn new(db: &Arc<DocumentDatabase>, name: impl Into<String>) -> Self {
        Self {
            id: CollectionId::new(BackendKind::Persistent, db.instance_id(), name),
            db: Arc::clone(db),
        }
    }

    fn handle(&self, id: &str) -> Arc<dyn FieldRecord> {
        Arc::new(PersistentRecord {
            id: id.to_string(),
            collection: self.id.clone(),
            db: Arc::clone(&self.db),
        })
    }

    fn missing(&self, id: &str) -> StorageError {
        StorageError::RecordNotFound {
            collection: self.id.name.clone(),
            id: id.to_string(),
        }
    }
}

impl Collection for PersistentCollection {
    fn collection_id(&self) -> &CollectionId {
        &self.id
    }

    fn insert_record(&self, id: &str, data: Document) -> Result<Arc<dyn FieldRecord>, StorageError> {
        self.db.replace(&self.id.name, id, data)?;
        Ok(self.handle(id))
    }

    fn open_record(&self, id: &str) -> Result<Arc<dyn FieldRecord>, StorageError> {
        if !self.db.contains(&self.id.name, id)? {
            return Err(self.missing(id));
        }
        Ok(self.handle(id))
    }

    fn ensure_record(&self, id: &str) -> Result<Arc<dyn FieldRecord>, StorageError> {
        self.db.ensure(&self.id.name, id)?;
        Ok(self.handle(id))
    }

    fn adopt_record(&self, record: &Arc<dyn FieldRecord>) -> Result<(), StorageError> {
        self.db.ensure(&self.id.name, record.id())?;
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), StorageError> {
        if self.db.delete_one(&self.id.name, id)? {
            Ok(())
        } else {
            Err(self.missing(id))
        }
    }

    fn ids(&self) -> Result<Vec<String>, StorageError> {
        self.db.ids(&self.id.name)
    }

    fn len(&self) -> Result<usize, StorageError> {
        self.db.count(&self.id.name)
    }

    fn contains(&self, id: &str) -> Result<bool, StorageError> {
        self.db.contains(&self.id.name, id)
    }

    fn retain_ids(&self, keep: &BTreeSet<String>) -> Result<usize, StorageError> {
        self.db.retain(&self.id.name, keep)
    }

    fn drop_collection(&self) -> Result<(), StorageError> {
        if self.db.drop_collection(&self.id.name)? {
            tracing::warn!(collection = %self.id.name, "dropped persistent collection");
        }
        Ok(())
    }
}

/// One document, read and written through the database on every call.
///
/// A missing document reads as empty.
#[derive(Debug, Clone)]
pub struct PersistentRecord {
    id: String,
    collection: CollectionId,
    db: Arc<DocumentDatabase>,
}

impl PersistentRecord {
    fn key_missing(&self, key: &str) -> StorageError {
        StorageError::KeyNotFound {
            owner: self.id.clone(),
            key: key.to_string(),
        }
    }
}

impl FieldRecord for PersistentRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn collection_id(&self) -> &CollectionId {
        &self.collection
    }

    fn get(&self, key: &str) -> Result<Value, StorageError> {
        self.db
            .get_field(&self.collection.name, &self.id, key)?
            .ok_or_else(|| self.key_missing(key))
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.db.set_field(&self.collection.name, &self.id, key, value)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        if self.db.unset(&self.collection.name, &self.id, key)? {
            Ok(())
        } else {
            Err(self.key_missing(key))
        }
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.db.keys(&self.collection.name, &self.id)
    }

    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self
            .db
            .get_field(&self.collection.name, &self.id, key)?
            .is_some())
    }

    fn as_map(&self) -> Result<Document, StorageError> {
        Ok(self
            .db
            .find_one(&self.collection.name, &self.id)?
            .unwrap_or_default())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::persistent::PersistentConfig;
    use tempfile::tempdir;

    fn open(dir: &std::path::Path) -> Arc<DocumentDatabase> {
        Arc::new(
            DocumentDatabase::open(
                dir,
                PersistentConfig {
                    sync_on_write: false,
                    ..PersistentConfig::default()
                },
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_record_set_does_not_clobber_siblings() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let coll = PersistentCollection::new(&db, "c_v0_utterances");

        let rec = coll.create_record("0").unwrap();
        rec.set("text", Value::from("hi")).unwrap();
        rec.set("reply_to", Value::Null).unwrap();

        let other = coll.open_record("0").unwrap();
        other.set("text", Value::from("bye")).unwrap();

        assert_eq!(rec.get("text").unwrap(), Value::from("bye"));
        assert!(rec.contains("reply_to").unwrap());
        assert_eq!(rec.len().unwrap(), 2);
    }

    #[test]
    fn test_binary_values_roundtrip_through_reopen() {
        let dir = tempdir().unwrap();
        let bytes = vec![0u8, 1, 254, 255];
        {
            let db = open(dir.path());
            let coll = PersistentCollection::new(&db, "c_v0_metas");
            let rec = coll.create_record("utterance_0").unwrap();
            rec.set("blob", Value::binary(bytes.clone())).unwrap();
        }

        let db = open(dir.path());
        let coll = PersistentCollection::new(&db, "c_v0_metas");
        let rec = coll.open_record("utterance_0").unwrap();
        assert_eq!(rec.get("blob").unwrap().as_bytes(), Some(bytes.as_slice()));
    }

    #[test]
    fn test_missing_document_reads_empty() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let coll = PersistentCollection::new(&db, "c");

        let rec = coll.create_record("0").unwrap();
        coll.remove("0").unwrap();

        assert!(rec.as_map().unwrap().is_empty());
        assert!(matches!(rec.get("x"), Err(StorageError::KeyNotFound { .. })));
        assert!(matches!(rec.delete("x"), Err(StorageError::KeyNotFound { .. })));
        assert!(matches!(coll.open_record("0"), Err(StorageError::RecordNotFound { .. })));
    }

    #[test]
    fn test_collection_identity() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());

        let a = PersistentCollection::new(&db, "x");
        let b = PersistentCollection::new(&db, "x");
        let c = PersistentCollection::new(&db, "y");
        assert_eq!(a.collection_id(), b.collection_id());
        assert_ne!(a.collection_id(), c.collection_id());

        a.create_record("1").unwrap();
        assert!(b.contains("1").unwrap());
    }

    #[test]
    fn test_transfer_into_persistent_is_a_copy() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let source = PersistentCollection::new(&db, "a");
        let target = PersistentCollection::new(&db, "b");

        let rec = source.create_record("0").unwrap();
        rec.set("text", Value::from("hi")).unwrap();
        let copy = rec.transfer(&target).unwrap();
        copy.set("text", Value::from("changed")).unwrap();

        assert_eq!(rec.get("text").unwrap(), Value::from("hi"));
        assert_eq!(copy.get("text").unwrap(), Value::from("changed"));
    }

    #[test]
    fn test_retain_and_drop() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let coll = PersistentCollection::new(&db, "c");
        for id in ["a", "b"] {
            coll.create_record(id).unwrap();
        }

        let keep: BTreeSet<String> = ["a".to_string()].into_iter().collect();
        assert_eq!(coll.retain_ids(&keep).unwrap(), 1);

        coll.drop_collection().unwrap();
        assert!(!db.has_collection("c").unwrap());
        coll.drop_collection().unwrap();
    }
}
