//! In-memory storage backend.
//!
//! A [`MemoryNamespace`] is a process-local set of named collections. Each
//! manager using the memory backend gets its own namespace, so two managers
//! never see each other's data. Records are shared handles: every holder of a
//! record sees writes immediately.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::storage::traits::{BackendKind, Collection, CollectionId, FieldRecord, StorageError};
use crate::value::{Document, Value};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

type SharedDocument = Arc<RwLock<Document>>;

/// A process-local set of named collections.
#[derive(Debug)]
pub struct MemoryNamespace {
    id: Uuid,
    collections: RwLock<HashMap<String, Arc<MemoryCollection>>>,
}

impl MemoryNamespace {
    /// Allocates a fresh, empty namespace.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            collections: RwLock::new(HashMap::new()),
        })
    }

    /// Unique id of this namespace.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the named collection, creating it on first use.
    pub fn collection(&self, name: &str) -> Result<Arc<MemoryCollection>, StorageError> {
        if let Some(existing) = self
            .collections
            .read()
            .map_err(|_| lock_err("namespace.collection"))?
            .get(name)
        {
            return Ok(Arc::clone(existing));
        }

        let mut collections = self
            .collections
            .write()
            .map_err(|_| lock_err("namespace.collection"))?;
        let collection = collections.entry(name.to_string()).or_insert_with(|| {
            Arc::new(MemoryCollection::new(CollectionId::new(
                BackendKind::Memory,
                self.id,
                name,
            )))
        });
        Ok(Arc::clone(collection))
    }

    /// Names of all collections created so far, sorted.
    pub fn collection_names(&self) -> Result<Vec<String>, StorageError> {
        let collections = self
            .collections
            .read()
            .map_err(|_| lock_err("namespace.names"))?;
        let mut names: Vec<String> = collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// A named set of shared records.
#[derive(Debug)]
pub struct MemoryCollection {
    id: CollectionId,
    records: RwLock<BTreeMap<String, SharedDocument>>,
}

impl MemoryCollection {
    fn new(id: CollectionId) -> Self {
        Self {
            id,
            records: RwLock::new(BTreeMap::new()),
        }
    }

    fn handle(&self, id: &str, data: SharedDocument) -> Arc<dyn FieldRecord> {
        Arc::new(MemoryRecord {
            id: id.to_string(),
            collection: self.id.clone(),
            data,
        })
    }
}

impl Collection for MemoryCollection {
    fn collection_id(&self) -> &CollectionId {
        &self.id
    }

    fn insert_record(&self, id: &str, data: Document) -> Result<Arc<dyn FieldRecord>, StorageError> {
        let shared = Arc::new(RwLock::new(data));
        self.records
            .write()
            .map_err(|_| lock_err("memory.insert"))?
            .insert(id.to_string(), Arc::clone(&shared));
        Ok(self.handle(id, shared))
    }

    fn open_record(&self, id: &str) -> Result<Arc<dyn FieldRecord>, StorageError> {
        let records = self.records.read().map_err(|_| lock_err("memory.open"))?;
        let shared = records
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::RecordNotFound {
                collection: self.id.name.clone(),
                id: id.to_string(),
            })?;
        Ok(self.handle(id, shared))
    }

    fn ensure_record(&self, id: &str) -> Result<Arc<dyn FieldRecord>, StorageError> {
        let mut records = self.records.write().map_err(|_| lock_err("memory.ensure"))?;
        let shared = Arc::clone(records.entry(id.to_string()).or_default());
        Ok(self.handle(id, shared))
    }

    fn adopt_record(&self, record: &Arc<dyn FieldRecord>) -> Result<(), StorageError> {
        let mut records = self.records.write().map_err(|_| lock_err("memory.adopt"))?;
        if records.contains_key(record.id()) {
            return Ok(());
        }

        let shared = match record.as_any().downcast_ref::<MemoryRecord>() {
            Some(memory) => Arc::clone(&memory.data),
            None => Arc::new(RwLock::new(record.as_map()?)),
        };
        records.insert(record.id().to_string(), shared);
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), StorageError> {
        self.records
            .write()
            .map_err(|_| lock_err("memory.remove"))?
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::RecordNotFound {
                collection: self.id.name.clone(),
                id: id.to_string(),
            })
    }

    fn ids(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .records
            .read()
            .map_err(|_| lock_err("memory.ids"))?
            .keys()
            .cloned()
            .collect())
    }

    fn len(&self) -> Result<usize, StorageError> {
        Ok(self.records.read().map_err(|_| lock_err("memory.len"))?.len())
    }

    fn contains(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self
            .records
            .read()
            .map_err(|_| lock_err("memory.contains"))?
            .contains_key(id))
    }

    fn retain_ids(&self, keep: &BTreeSet<String>) -> Result<usize, StorageError> {
        let mut records = self.records.write().map_err(|_| lock_err("memory.retain"))?;
        let before = records.len();
        records.retain(|id, _| keep.contains(id));
        Ok(before - records.len())
    }

    fn drop_collection(&self) -> Result<(), StorageError> {
        self.records.write().map_err(|_| lock_err("memory.drop"))?.clear();
        Ok(())
    }
}

/// A shared in-memory record.
#[derive(Debug, Clone)]
pub struct MemoryRecord {
    id: String,
    collection: CollectionId,
    data: SharedDocument,
}

impl MemoryRecord {
    fn key_missing(&self, key: &str) -> StorageError {
        StorageError::KeyNotFound {
            owner: self.id.clone(),
            key: key.to_string(),
        }
    }
}

impl FieldRecord for MemoryRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn collection_id(&self) -> &CollectionId {
        &self.collection
    }

    fn get(&self, key: &str) -> Result<Value, StorageError> {
        self.data
            .read()
            .map_err(|_| lock_err("record.get"))?
            .get(key)
            .cloned()
            .ok_or_else(|| self.key_missing(key))
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.data
            .write()
            .map_err(|_| lock_err("record.set"))?
            .insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data
            .write()
            .map_err(|_| lock_err("record.delete"))?
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| self.key_missing(key))
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .data
            .read()
            .map_err(|_| lock_err("record.keys"))?
            .keys()
            .cloned()
            .collect())
    }

    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self
            .data
            .read()
            .map_err(|_| lock_err("record.contains"))?
            .contains_key(key))
    }

    fn as_map(&self) -> Result<Document, StorageError> {
        Ok(self.data.read().map_err(|_| lock_err("record.as_map"))?.clone())
    }

    fn len(&self) -> Result<usize, StorageError> {
        Ok(self.data.read().map_err(|_| lock_err("record.len"))?.len())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
