//! Abstract storage traits for convostore.
//!
//! These traits define the contract both backends implement:
//! - [`FieldRecord`]: one entity's flat key→value record
//! - [`Collection`]: a named set of records addressed by string id
//!
//! Everything above this layer (metadata views, typed collection stores,
//! entities) is written against the traits only, so the in-memory and the
//! persistent backend behave identically.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::value::{Document, Value};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Record not found in a collection.
    #[error("Record not found: {id} in {collection}")]
    RecordNotFound {
        /// Physical collection name.
        collection: String,
        /// Requested record id.
        id: String,
    },

    /// Key not found in a record.
    #[error("Key not found: {key} in {owner}")]
    KeyNotFound {
        /// Record id.
        owner: String,
        /// Requested key.
        key: String,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// Which kind of backend holds a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local, transient.
    Memory,
    /// Durable document database.
    Persistent,
}

impl BackendKind {
    /// Short name used in configuration (`mem` / `db`).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "mem",
            Self::Persistent => "db",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical identity of a collection.
///
/// Two handles refer to the same data iff their ids are equal: same backend,
/// same namespace instance (memory namespace or opened database) and same
/// physical name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionId {
    /// Backend holding the collection.
    pub backend: BackendKind,
    /// Memory namespace or database instance.
    pub namespace: Uuid,
    /// Physical collection name.
    pub name: String,
}

impl CollectionId {
    /// Creates a collection id.
    #[must_use]
    pub fn new(backend: BackendKind, namespace: Uuid, name: impl Into<String>) -> Self {
        Self {
            backend,
            namespace,
            name: name.into(),
        }
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.backend, self.namespace, self.name)
    }
}

/// One entity's flat key→value record.
///
/// The record id is the collection key and is never stored inside the value
/// map.
pub trait FieldRecord: Send + Sync + fmt::Debug {
    /// The key of this record inside its collection.
    fn id(&self) -> &str;

    /// The collection this record belongs to.
    fn collection_id(&self) -> &CollectionId;

    /// Get a value. Missing keys are `KeyNotFound`.
    fn get(&self, key: &str) -> Result<Value, StorageError>;

    /// Set a single key without touching its siblings.
    fn set(&self, key: &str, value: Value) -> Result<(), StorageError>;

    /// Remove a key entirely. Missing keys are `KeyNotFound`.
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All keys, in sorted order.
    fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Returns true if the key is present.
    fn contains(&self, key: &str) -> Result<bool, StorageError>;

    /// A detached copy of the whole record.
    fn as_map(&self) -> Result<Document, StorageError>;

    /// Number of keys.
    fn len(&self) -> Result<usize, StorageError> {
        Ok(self.keys()?.len())
    }

    /// Returns true if the record holds no keys.
    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Copy every key into a fresh record of `target`, under the same id.
    ///
    /// The two records share nothing afterwards.
    fn transfer(&self, target: &dyn Collection) -> Result<Arc<dyn FieldRecord>, StorageError> {
        target.insert_record(self.id(), self.as_map()?)
    }

    /// Downcasting support for backends that share record state.
    fn as_any(&self) -> &dyn Any;
}

/// A named set of field records addressed by string id.
pub trait Collection: Send + Sync + fmt::Debug {
    /// Physical identity of this collection.
    fn collection_id(&self) -> &CollectionId;

    /// Physical collection name.
    fn name(&self) -> &str {
        &self.collection_id().name
    }

    /// Create (or reset) an empty record. Last writer wins.
    fn create_record(&self, id: &str) -> Result<Arc<dyn FieldRecord>, StorageError> {
        self.insert_record(id, Document::new())
    }

    /// Create (or replace) a record with the given content.
    fn insert_record(&self, id: &str, data: Document) -> Result<Arc<dyn FieldRecord>, StorageError>;

    /// Open an existing record. Missing ids are `RecordNotFound`.
    fn open_record(&self, id: &str) -> Result<Arc<dyn FieldRecord>, StorageError>;

    /// Open a record, creating it empty if absent.
    fn ensure_record(&self, id: &str) -> Result<Arc<dyn FieldRecord>, StorageError>;

    /// Make sure `record`, which already belongs to this collection, is
    /// reachable under its id.
    fn adopt_record(&self, record: &Arc<dyn FieldRecord>) -> Result<(), StorageError>;

    /// Remove a record. Missing ids are `RecordNotFound`.
    fn remove(&self, id: &str) -> Result<(), StorageError>;

    /// All record ids, in sorted order.
    fn ids(&self) -> Result<Vec<String>, StorageError>;

    /// Number of records.
    fn len(&self) -> Result<usize, StorageError>;

    /// Returns true if the collection holds no records.
    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Returns true if a record with this id exists.
    fn contains(&self, id: &str) -> Result<bool, StorageError>;

    /// Remove every record whose id is not in `keep`. Returns the number removed.
    fn retain_ids(&self, keep: &BTreeSet<String>) -> Result<usize, StorageError>;

    /// Drop the whole collection. Dropping an absent collection is a no-op.
    fn drop_collection(&self) -> Result<(), StorageError>;
}
