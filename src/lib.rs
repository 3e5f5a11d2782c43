//! # convostore - storage for conversational corpora
//!
//! convostore keeps utterances, conversations and speakers together with
//! arbitrary, dynamically-typed metadata. The same entity model runs on a
//! transient in-process backend or on a durable embedded document database,
//! and entities can move between managers on different backends without
//! losing fields or metadata.
//!
//! ## Core Concepts
//!
//! - **StorageManager**: owns one corpus namespace (four collections) and its
//!   schema registry
//! - **CollectionStore**: typed access to one collection
//! - **MetadataView**: dict-like access to one object's metadata
//! - **SchemaRegistry**: every metadata key's observed value types, the
//!   registered vector names and the metadata deletion policy
//! - **DocumentDatabase**: the persistent backend (WAL + snapshot segments)
//!
//! ## Usage
//!
//! ```rust
//! use convostore::{Backend, Speaker, StorageManager, StorageOptions, Utterance, Value};
//!
//! let manager = StorageManager::new(Backend::Memory, StorageOptions::named("demo"))?;
//! let mut bob = Speaker::new(&manager, "bob")?;
//! let utt = Utterance::builder()
//!     .id("0")
//!     .speaker(&mut bob)
//!     .text("hello")
//!     .meta("toxicity", 0.1)
//!     .build(&manager)?;
//!
//! assert_eq!(utt.meta().get("toxicity")?, Value::from(0.1));
//! assert_eq!(bob.utterance_ids()?, vec!["0".to_string()]);
//! # Ok::<(), convostore::ConvoError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod meta;
pub mod model;
pub mod registry;
pub mod storage;
pub mod value;

pub use config::Settings;
pub use error::{ConfigError, ConvoError, ConvoResult, PolicyViolation, TypeError};
pub use meta::{storage_key, MetadataView};
pub use model::{Component, Conversation, ObjKind, Speaker, Utterance, UtteranceBuilder};
pub use registry::{FieldIndex, RegistrySnapshot, SchemaRegistry, SharedRegistry, TypeTag};
pub use storage::{
    open_database, purge_database, Backend, BackendKind, Collection, CollectionId,
    CollectionStore, DocumentDatabase, FieldRecord, PersistentConfig, StorageError,
    StorageManager, StorageOptions, StoredItem,
};
pub use value::{Document, StrLike, Value};
