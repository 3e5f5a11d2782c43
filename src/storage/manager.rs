//! Backend selection, namespace resolution and corpus lifecycle.
//!
//! A [`StorageManager`] owns the four collections of one corpus namespace
//! (`utterances`, `conversations`, `speakers`, `metas`) and the schema
//! registry describing its metadata. Managers are cheap to clone; clones share
//! the same namespace and registry.
//!
//! On the persistent backend a namespace is the set of physical collections
//! named `{corpus_id}_v{version}_{suffix}`. Two managers resolving to the same
//! names see the same data.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};

use regex::Regex;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{ConfigError, ConvoError, ConvoResult, TypeError};
use crate::meta::{storage_key, MetadataView};
use crate::model::{Conversation, ObjKind, Speaker, Utterance};
use crate::registry::{read_registry, write_registry, RegistrySnapshot, SchemaRegistry, SharedRegistry};
use crate::storage::memory::MemoryNamespace;
use crate::storage::persistent::{open_database, DocumentDatabase, PersistentCollection};
use crate::storage::store::CollectionStore;
use crate::storage::traits::{BackendKind, Collection, StorageError};
use crate::value::{Document, StrLike};

/// Suffix of the metadata collection.
const METAS: &str = "metas";

/// Every collection suffix of a namespace.
const SUFFIXES: [&str; 4] = ["utterances", "conversations", "speakers", METAS];

/// Name of the registry snapshot written by [`StorageManager::export_index`].
pub const INDEX_FILE: &str = "index.json";

/// Which backend a manager stores into.
#[derive(Debug, Clone)]
pub enum Backend {
    /// A fresh process-local namespace.
    Memory,
    /// An open document database, shared with other managers.
    Persistent(Arc<DocumentDatabase>),
}

impl Backend {
    /// The kind of this backend.
    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        match self {
            Self::Memory => BackendKind::Memory,
            Self::Persistent(_) => BackendKind::Persistent,
        }
    }
}

/// Options for [`StorageManager::new`].
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Corpus id; a random numeric id when `None`.
    pub corpus_id: Option<String>,
    /// Namespace version.
    pub version: String,
    /// Reconnect to an existing persistent namespace instead of snapshotting it.
    pub in_place: bool,
    /// Directory for exported registry snapshots.
    pub data_dir: Option<PathBuf>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            corpus_id: None,
            version: "0".to_string(),
            in_place: false,
            data_dir: None,
        }
    }
}

impl StorageOptions {
    /// Options for a named corpus at version `0`.
    #[must_use]
    pub fn named(corpus_id: impl Into<String>) -> Self {
        Self {
            corpus_id: Some(corpus_id.into()),
            ..Self::default()
        }
    }

    /// Sets the namespace version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Sets whether an existing namespace is reused in place.
    #[must_use]
    pub fn in_place(mut self, in_place: bool) -> Self {
        self.in_place = in_place;
        self
    }
}

#[derive(Debug, Clone)]
enum Namespace {
    Memory(Arc<MemoryNamespace>),
    Persistent(Arc<DocumentDatabase>),
}

impl Namespace {
    fn id(&self) -> Uuid {
        match self {
            Self::Memory(ns) => ns.id(),
            Self::Persistent(db) => db.instance_id(),
        }
    }

    fn collection(&self, name: &str) -> ConvoResult<Arc<dyn Collection>> {
        let collection: Arc<dyn Collection> = match self {
            Self::Memory(ns) => ns.collection(name)?,
            Self::Persistent(db) => Arc::new(PersistentCollection::new(db, name)),
        };
        Ok(collection)
    }
}

#[derive(Debug, Clone)]
struct Collections {
    utterances: Arc<dyn Collection>,
    conversations: Arc<dyn Collection>,
    speakers: Arc<dyn Collection>,
    metas: Arc<dyn Collection>,
}

impl Collections {
    fn open(namespace: &Namespace, prefix: &str) -> ConvoResult<Self> {
        let open = |suffix: &str| namespace.collection(&format!("{prefix}_{suffix}"));
        Ok(Self {
            utterances: open("utterances")?,
            conversations: open("conversations")?,
            speakers: open("speakers")?,
            metas: open(METAS)?,
        })
    }

    fn all(&self) -> [&Arc<dyn Collection>; 4] {
        [&self.utterances, &self.conversations, &self.speakers, &self.metas]
    }
}

struct ManagerInner {
    namespace: Namespace,
    corpus_id: String,
    version: String,
    data_dir: Option<PathBuf>,
    registry: SharedRegistry,
    collections: RwLock<Collections>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Namespace::Persistent(db) = &self.namespace {
            db.release_namespace(&namespace_prefix(&self.corpus_id, &self.version));
        }
    }
}

/// Owns one corpus namespace and its schema registry.
#[derive(Clone)]
pub struct StorageManager {
    inner: Arc<ManagerInner>,
}

fn name_pattern() -> ConvoResult<&'static Regex> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$"))
        .as_ref()
        .map_err(|e| ConvoError::internal(format!("invalid name pattern: {e}")))
}

fn validate_name(what: &'static str, value: String) -> ConvoResult<String> {
    if name_pattern()?.is_match(&value) {
        Ok(value)
    } else {
        Err(TypeError::InvalidName {
            what,
            value,
            reason: "must start with a letter or digit and contain only letters, digits, '_', '.' or '-'"
                .to_string(),
        }
        .into())
    }
}

fn random_corpus_id() -> String {
    (Uuid::new_v4().as_u128() % 1_000_000_000_000).to_string()
}

fn namespace_prefix(corpus_id: &str, version: &str) -> String {
    format!("{corpus_id}_v{version}")
}

fn physical_name(corpus_id: &str, version: &str, suffix: &str) -> String {
    format!("{}_{suffix}", namespace_prefix(corpus_id, version))
}

fn namespace_has_data(db: &DocumentDatabase, corpus_id: &str, version: &str) -> ConvoResult<bool> {
    for suffix in SUFFIXES {
        if db.has_collection(&physical_name(corpus_id, version, suffix))? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Claims `version` for a new manager if it is neither held by a live
/// manager nor backed by stored data.
fn claim_fresh(db: &DocumentDatabase, corpus_id: &str, version: &str) -> ConvoResult<bool> {
    Ok(!namespace_has_data(db, corpus_id, version)?
        && db.claim_namespace(&namespace_prefix(corpus_id, version), true)?)
}

/// Picks and claims the version a persistent manager will use.
///
/// Returns the resolved version and whether it holds existing data.
fn resolve_persistent(
    db: &DocumentDatabase,
    corpus_id: &str,
    version: &str,
    in_place: bool,
) -> ConvoResult<(String, bool)> {
    if in_place {
        db.claim_namespace(&namespace_prefix(corpus_id, version), false)?;
        let existing = namespace_has_data(db, corpus_id, version)?;
        if existing {
            tracing::info!(corpus_id, version, "connecting to existing namespace in place");
        }
        return Ok((version.to_string(), existing));
    }

    if claim_fresh(db, corpus_id, version)? {
        return Ok((version.to_string(), false));
    }

    let mut n = 1u32;
    let candidate = loop {
        let candidate = format!("{version}.{n}");
        if claim_fresh(db, corpus_id, &candidate)? {
            break candidate;
        }
        n += 1;
    };

    let mut copied = 0;
    for suffix in SUFFIXES {
        let source = physical_name(corpus_id, version, suffix);
        if db.has_collection(&source)? {
            copied += db.copy_collection(&source, &physical_name(corpus_id, &candidate, suffix))?;
        }
    }
    tracing::info!(
        corpus_id,
        existing = version,
        snapshot = %candidate,
        documents = copied,
        "namespace already in use; snapshotting into a new version"
    );
    Ok((candidate, copied > 0))
}

impl StorageManager {
    /// Creates a manager for one corpus namespace.
    ///
    /// # Errors
    /// - `Type(InvalidName)` for a malformed corpus id or version
    /// - `Storage` if the persistent backend fails
    pub fn new(backend: Backend, options: StorageOptions) -> ConvoResult<Self> {
        let corpus_id = match options.corpus_id {
            Some(id) => validate_name("corpus id", id)?,
            None => random_corpus_id(),
        };
        let version = validate_name("version", options.version)?;

        let (namespace, version, existing) = match backend {
            Backend::Memory => (Namespace::Memory(MemoryNamespace::new()), version, false),
            Backend::Persistent(db) => {
                let (version, existing) =
                    resolve_persistent(&db, &corpus_id, &version, options.in_place)?;
                (Namespace::Persistent(db), version, existing)
            }
        };

        let prefix = namespace_prefix(&corpus_id, &version);
        let collections = Collections::open(&namespace, &prefix)?;
        let manager = Self {
            inner: Arc::new(ManagerInner {
                namespace,
                corpus_id,
                version,
                data_dir: options.data_dir,
                registry: SchemaRegistry::new().shared(),
                collections: RwLock::new(collections),
            }),
        };

        if existing {
            manager.reindex()?;
        }
        tracing::debug!(
            backend = %manager.storage_kind(),
            prefix = %manager.prefix(),
            "storage manager ready"
        );
        Ok(manager)
    }

    /// Creates a manager from configuration.
    ///
    /// The configured default storage mode picks the backend; `db_host` is
    /// the database directory and `data_dir` the snapshot directory unless
    /// `options` names one. The database is opened by this call, so only one
    /// manager per process can be built this way for a given `db_host`; share
    /// the database through [`Backend::Persistent`] otherwise.
    pub fn from_settings(settings: &Settings, mut options: StorageOptions) -> ConvoResult<Self> {
        let backend = match settings.storage_mode()? {
            BackendKind::Memory => Backend::Memory,
            BackendKind::Persistent => Backend::Persistent(open_database(settings.db_path(), None)?),
        };
        if options.data_dir.is_none() {
            options.data_dir = Some(settings.data_path());
        }
        Self::new(backend, options)
    }

    // --- identity ---

    /// The backend kind.
    #[must_use]
    pub fn storage_kind(&self) -> BackendKind {
        match self.inner.namespace {
            Namespace::Memory(_) => BackendKind::Memory,
            Namespace::Persistent(_) => BackendKind::Persistent,
        }
    }

    /// The corpus id.
    #[must_use]
    pub fn corpus_id(&self) -> &str {
        &self.inner.corpus_id
    }

    /// The resolved namespace version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.inner.version
    }

    /// `{corpus_id}_v{version}`.
    #[must_use]
    pub fn prefix(&self) -> String {
        namespace_prefix(&self.inner.corpus_id, &self.inner.version)
    }

    /// Physical name of the collection with `suffix`.
    #[must_use]
    pub fn physical_name(&self, suffix: &str) -> String {
        physical_name(&self.inner.corpus_id, &self.inner.version, suffix)
    }

    /// Directory for exported registry snapshots.
    #[must_use]
    pub fn data_dir(&self) -> Option<&Path> {
        self.inner.data_dir.as_deref()
    }

    /// The schema registry shared by every entity of this manager.
    #[must_use]
    pub fn registry(&self) -> &SharedRegistry {
        &self.inner.registry
    }

    /// The database, for persistent managers.
    #[must_use]
    pub fn database(&self) -> Option<&Arc<DocumentDatabase>> {
        match &self.inner.namespace {
            Namespace::Persistent(db) => Some(db),
            Namespace::Memory(_) => None,
        }
    }

    // --- collections ---

    /// Re-opens the four collection handles of this namespace.
    pub fn setup_collections(&self) -> ConvoResult<()> {
        let collections = Collections::open(&self.inner.namespace, &self.prefix())?;
        *self
            .inner
            .collections
            .write()
            .map_err(|_| lock_err("manager.collections"))? = collections;
        Ok(())
    }

    fn collections(&self) -> ConvoResult<Collections> {
        Ok(self
            .inner
            .collections
            .read()
            .map_err(|_| lock_err("manager.collections"))?
            .clone())
    }

    pub(crate) fn entity_collection(&self, kind: ObjKind) -> ConvoResult<Arc<dyn Collection>> {
        let collections = self.collections()?;
        match kind {
            ObjKind::Utterance => Ok(collections.utterances),
            ObjKind::Conversation => Ok(collections.conversations),
            ObjKind::Speaker => Ok(collections.speakers),
            ObjKind::Corpus => Err(TypeError::UnknownKind {
                value: kind.to_string(),
            }
            .into()),
        }
    }

    pub(crate) fn metas_collection(&self) -> ConvoResult<Arc<dyn Collection>> {
        Ok(self.collections()?.metas)
    }

    /// Utterance store.
    pub fn utterances(&self) -> ConvoResult<CollectionStore<Utterance>> {
        Ok(CollectionStore::new(self.collections()?.utterances, self.clone()))
    }

    /// Conversation store.
    pub fn conversations(&self) -> ConvoResult<CollectionStore<Conversation>> {
        Ok(CollectionStore::new(self.collections()?.conversations, self.clone()))
    }

    /// Speaker store.
    pub fn speakers(&self) -> ConvoResult<CollectionStore<Speaker>> {
        Ok(CollectionStore::new(self.collections()?.speakers, self.clone()))
    }

    /// Raw metadata store, keyed by `"{kind}_{id}"`.
    pub fn metas(&self) -> ConvoResult<CollectionStore<Document>> {
        Ok(CollectionStore::new(self.collections()?.metas, self.clone()))
    }

    // --- entities ---

    /// Loads an utterance.
    pub fn get_utterance(&self, id: impl Into<StrLike>) -> ConvoResult<Utterance> {
        self.utterances()?.get(id)
    }

    /// Loads a speaker.
    pub fn get_speaker(&self, id: impl Into<StrLike>) -> ConvoResult<Speaker> {
        self.speakers()?.get(id)
    }

    /// Loads a conversation.
    pub fn get_conversation(&self, id: impl Into<StrLike>) -> ConvoResult<Conversation> {
        self.conversations()?.get(id)
    }

    /// Adds an utterance to this manager, moving it (and its speaker) over
    /// from another manager if needed.
    pub fn insert_utterance(&self, utterance: &mut Utterance) -> ConvoResult<()> {
        match utterance.speaker() {
            Ok(mut speaker) => self.insert_speaker(&mut speaker)?,
            Err(e) if e.is_not_found() => {
                tracing::warn!(
                    utterance = utterance.id(),
                    "speaker of inserted utterance not found; inserting utterance alone"
                );
            }
            Err(e) => return Err(e),
        }
        let id = utterance.id().to_string();
        self.utterances()?.set(id, utterance)
    }

    /// Adds a speaker to this manager.
    pub fn insert_speaker(&self, speaker: &mut Speaker) -> ConvoResult<()> {
        let id = speaker.id().to_string();
        self.speakers()?.set(id, speaker)
    }

    /// Adds a conversation to this manager.
    pub fn insert_conversation(&self, conversation: &mut Conversation) -> ConvoResult<()> {
        let id = conversation.id().to_string();
        self.conversations()?.set(id, conversation)
    }

    /// Corpus-level metadata.
    pub fn corpus_meta(&self) -> ConvoResult<MetadataView> {
        let record = self
            .metas_collection()?
            .ensure_record(&storage_key(ObjKind::Corpus, &self.inner.corpus_id))?;
        Ok(MetadataView::new(
            ObjKind::Corpus,
            self.inner.corpus_id.clone(),
            record,
            Arc::clone(&self.inner.registry),
        ))
    }

    // --- bulk administration ---

    /// Deletes `key` from the metadata of every object of `kind` and from
    /// the type index. Bypasses the deletion lock.
    ///
    /// Returns the number of objects the key was removed from.
    pub fn delete_metadata(&self, kind: ObjKind, key: &str) -> ConvoResult<usize> {
        let metas = self.metas_collection()?;
        let prefix = format!("{kind}_");
        let mut removed = 0;
        for id in metas.ids()? {
            let Some(owner) = id.strip_prefix(&prefix) else {
                continue;
            };
            let view = MetadataView::new(
                kind,
                owner,
                metas.open_record(&id)?,
                Arc::clone(&self.inner.registry),
            );
            if view.contains(key)? {
                view.force_delete(key)?;
                removed += 1;
            }
        }
        write_registry(&self.inner.registry)?.delete_key(kind, key);

        tracing::warn!(%kind, key, removed, prefix = %self.prefix(), "deleted metadata key corpus-wide");
        Ok(removed)
    }

    /// Rebuilds the type index from the stored metadata.
    ///
    /// Vector names, version and deletion policy are kept. Values are
    /// registered even while type checking is disabled.
    pub fn reindex(&self) -> ConvoResult<()> {
        let metas = self.metas_collection()?;
        let mut records = Vec::new();
        for id in metas.ids()? {
            let Some((kind, _)) = id.split_once('_') else {
                continue;
            };
            let Ok(kind) = kind.parse::<ObjKind>() else {
                tracing::warn!(key = %id, "skipping metadata record with unknown kind");
                continue;
            };
            records.push((kind, metas.open_record(&id)?.as_map()?));
        }

        let mut registry = write_registry(&self.inner.registry)?;
        registry.clear_indices();
        for (kind, document) in &records {
            for (key, value) in document {
                registry.check_and_register(*kind, key, value);
            }
        }
        tracing::info!(prefix = %self.prefix(), records = records.len(), "rebuilt metadata index");
        Ok(())
    }

    /// Writes the registry snapshot to `{data_dir}/{corpus_id}/index.json`
    /// and advances the registry version.
    pub fn export_index(&self, exclude_vectors: &[&str]) -> ConvoResult<PathBuf> {
        let dir = self
            .data_dir()
            .ok_or_else(|| ConfigError::Invalid("no data directory configured".to_string()))?
            .join(&self.inner.corpus_id);
        std::fs::create_dir_all(&dir).map_err(|e| ConfigError::WriteFile {
            path: dir.clone(),
            source: e,
        })?;

        let path = dir.join(INDEX_FILE);
        let mut registry = write_registry(&self.inner.registry)?;
        let snapshot = registry.to_dict(exclude_vectors, None);
        snapshot.write_to(&path)?;
        registry.set_version(snapshot.version);
        Ok(path)
    }

    /// Loads a registry snapshot into this manager's registry.
    pub fn import_index(&self, path: impl AsRef<Path>) -> ConvoResult<()> {
        let snapshot = RegistrySnapshot::read_from(path)?;
        write_registry(&self.inner.registry)?.update_from_dict(&snapshot);
        Ok(())
    }

    /// Drops every collection of this namespace.
    pub fn purge_all(&self) -> ConvoResult<()> {
        for collection in self.collections()?.all() {
            collection.drop_collection()?;
        }
        tracing::warn!(prefix = %self.prefix(), backend = %self.storage_kind(), "purged namespace");
        Ok(())
    }

    /// Registered vector names.
    pub fn vectors(&self) -> ConvoResult<BTreeSet<String>> {
        Ok(read_registry(&self.inner.registry)?.vectors().clone())
    }
}

/// Drops every collection in `db`, for every corpus. Returns the number of
/// collections dropped.
pub fn purge_database(db: &DocumentDatabase) -> ConvoResult<usize> {
    let dropped = db.drop_all()?;
    tracing::warn!(dir = %db.dir().display(), dropped, "purged document database");
    Ok(dropped)
}

fn lock_err(context: &'static str) -> ConvoError {
    StorageError::BackendError(format!("poisoned lock: {context}")).into()
}

impl PartialEq for StorageManager {
    fn eq(&self, other: &Self) -> bool {
        self.inner.namespace.id() == other.inner.namespace.id() && self.prefix() == other.prefix()
    }
}

impl fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageManager")
            .field("backend", &self.storage_kind())
            .field("namespace", &self.inner.namespace.id())
            .field("prefix", &self.prefix())
            .finish_non_exhaustive()
    }
}
