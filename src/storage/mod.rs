//! Storage layer for convostore.
//!
//! - the [`FieldRecord`] and [`Collection`] contracts
//! - [`memory`]: process-local backend
//! - [`persistent`]: embedded document database backend
//! - [`CollectionStore`]: typed view over one collection
//! - [`StorageManager`]: backend selection, namespaces and lifecycle

pub mod memory;
pub mod persistent;
mod manager;
mod store;
mod traits;

pub use manager::{purge_database, Backend, StorageManager, StorageOptions};
pub use memory::{MemoryCollection, MemoryNamespace, MemoryRecord};
pub use persistent::{open_database, DocumentDatabase, PersistentConfig};
pub use store::{CollectionStore, StoredItem};
pub use traits::{BackendKind, Collection, CollectionId, FieldRecord, StorageError};
