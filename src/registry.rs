//! Schema registry: the live type index over all metadata keys.
//!
//! For each object kind and metadata key the registry remembers every type
//! tag the key has held, in first-seen order. A key that ever held a value
//! that cannot be represented as JSON collapses to the single tag `bin` and
//! stays there. The registry also owns the set of registered vector names, a
//! snapshot version counter and the per-kind metadata deletion policy.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ConvoError, ConvoResult, TypeError};
use crate::model::ObjKind;
use crate::storage::StorageError;
use crate::value::Value;

/// Observed type of a metadata value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TypeTag {
    Bool,
    Int,
    Float,
    Str,
    /// JSON array.
    List,
    /// JSON object.
    Dict,
    /// Not representable as JSON. Absorbing.
    Bin,
}

impl TypeTag {
    /// Stable string form used in snapshots.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "<bool>",
            Self::Int => "<int>",
            Self::Float => "<float>",
            Self::Str => "<str>",
            Self::List => "<list>",
            Self::Dict => "<dict>",
            Self::Bin => "bin",
        }
    }

    /// Classifies a value. `Null` has no tag.
    ///
    /// Scalars map to their own tag. Containers are checked for a JSON
    /// representation and fall back to [`TypeTag::Bin`] when there is none.
    #[must_use]
    pub fn classify(value: &Value) -> Option<Self> {
        Some(match value {
            Value::Null => return None,
            Value::Bool(_) => Self::Bool,
            Value::Int(_) => Self::Int,
            Value::Float(_) => Self::Float,
            Value::String(_) => Self::Str,
            Value::Binary(_) => Self::Bin,
            Value::List(_) | Value::Map(_) => match value.to_json() {
                Some(serde_json::Value::Array(_)) => Self::List,
                Some(_) => Self::Dict,
                None => Self::Bin,
            },
        })
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TypeTag {
    type Err = TypeError;

    /// Accepts the short form (`<int>`) and the legacy long form
    /// (`<class 'int'>`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s
            .strip_prefix("<class '")
            .and_then(|rest| rest.strip_suffix("'>"))
            .or_else(|| s.strip_prefix('<').and_then(|rest| rest.strip_suffix('>')))
            .unwrap_or(s);

        match inner {
            "bool" => Ok(Self::Bool),
            "int" => Ok(Self::Int),
            "float" => Ok(Self::Float),
            "str" => Ok(Self::Str),
            "list" => Ok(Self::List),
            "dict" => Ok(Self::Dict),
            "bin" => Ok(Self::Bin),
            _ => Err(TypeError::InvalidTypeTag {
                value: s.to_string(),
            }),
        }
    }
}

impl From<TypeTag> for String {
    fn from(tag: TypeTag) -> Self {
        tag.as_str().to_string()
    }
}

impl TryFrom<String> for TypeTag {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Metadata key → observed tags, for one object kind.
pub type FieldIndex = BTreeMap<String, Vec<TypeTag>>;

/// A registry shared between a manager, its metadata views and its entities.
pub type SharedRegistry = Arc<RwLock<SchemaRegistry>>;

pub(crate) fn read_registry(
    registry: &SharedRegistry,
) -> ConvoResult<RwLockReadGuard<'_, SchemaRegistry>> {
    registry
        .read()
        .map_err(|_| ConvoError::internal("poisoned lock: registry"))
}

pub(crate) fn write_registry(
    registry: &SharedRegistry,
) -> ConvoResult<RwLockWriteGuard<'_, SchemaRegistry>> {
    registry
        .write()
        .map_err(|_| ConvoError::internal("poisoned lock: registry"))
}

/// Serialized form of the registry (`index.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(rename = "utterances-index", default, deserialize_with = "de_index")]
    pub utterances_index: FieldIndex,
    #[serde(rename = "conversations-index", default, deserialize_with = "de_index")]
    pub conversations_index: FieldIndex,
    #[serde(
        rename = "speakers-index",
        alias = "users-index",
        default,
        deserialize_with = "de_index"
    )]
    pub speakers_index: FieldIndex,
    #[serde(rename = "overall-index", default, deserialize_with = "de_index")]
    pub overall_index: FieldIndex,
    #[serde(default)]
    pub vectors: Vec<String>,
    #[serde(default)]
    pub version: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(TypeTag),
    Many(Vec<TypeTag>),
}

fn de_index<'de, D: Deserializer<'de>>(deserializer: D) -> Result<FieldIndex, D::Error> {
    let raw = BTreeMap::<String, OneOrMany>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(key, tags)| match tags {
            OneOrMany::One(tag) => (key, vec![tag]),
            OneOrMany::Many(tags) => (key, tags),
        })
        .collect())
}

impl RegistrySnapshot {
    /// Index for one kind.
    #[must_use]
    pub const fn index(&self, kind: ObjKind) -> &FieldIndex {
        match kind {
            ObjKind::Utterance => &self.utterances_index,
            ObjKind::Conversation => &self.conversations_index,
            ObjKind::Speaker => &self.speakers_index,
            ObjKind::Corpus => &self.overall_index,
        }
    }

    /// Parses a snapshot from JSON.
    pub fn from_json(json: &str) -> ConvoResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            ConvoError::Storage(StorageError::SerializationError(format!(
                "invalid registry snapshot: {e}"
            )))
        })
    }

    /// Renders the snapshot as JSON.
    pub fn to_json(&self) -> ConvoResult<String> {
        serde_json::to_string(self).map_err(|e| {
            ConvoError::Storage(StorageError::SerializationError(e.to_string()))
        })
    }

    /// Reads a snapshot file.
    pub fn read_from(path: impl AsRef<Path>) -> ConvoResult<Self> {
        let json = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConvoError::Storage(StorageError::BackendError(format!(
                "failed to read {}: {e}",
                path.as_ref().display()
            )))
        })?;
        Self::from_json(&json)
    }

    /// Writes a snapshot file.
    pub fn write_to(&self, path: impl AsRef<Path>) -> ConvoResult<()> {
        std::fs::write(path.as_ref(), self.to_json()?).map_err(|e| {
            ConvoError::Storage(StorageError::BackendError(format!(
                "failed to write {}: {e}",
                path.as_ref().display()
            )))
        })
    }
}

/// Per-kind metadata type index, vector registry and deletion policy.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaRegistry {
    indices: BTreeMap<ObjKind, FieldIndex>,
    vectors: BTreeSet<String>,
    version: u64,
    type_check: bool,
    deletion_locked: BTreeMap<ObjKind, bool>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    /// An empty registry at version 0 with type checking on and deletion
    /// locked for every entity kind.
    #[must_use]
    pub fn new() -> Self {
        Self {
            indices: ObjKind::ALL.iter().map(|k| (*k, FieldIndex::new())).collect(),
            vectors: BTreeSet::new(),
            version: 0,
            type_check: true,
            deletion_locked: ObjKind::ENTITY_KINDS.iter().map(|k| (*k, true)).collect(),
        }
    }

    /// Wraps the registry for sharing.
    #[must_use]
    pub fn shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    /// Appends `tag` to the key's tag list unless already present.
    pub fn update_index(&mut self, kind: ObjKind, key: &str, tag: TypeTag) {
        let tags = self
            .indices
            .entry(kind)
            .or_default()
            .entry(key.to_string())
            .or_default();
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }

    /// Replaces the key's tag list with exactly `[tag]`.
    pub fn set_index(&mut self, kind: ObjKind, key: &str, tag: TypeTag) {
        self.indices
            .entry(kind)
            .or_default()
            .insert(key.to_string(), vec![tag]);
    }

    /// The index for one kind.
    #[must_use]
    pub fn get_index(&self, kind: ObjKind) -> &FieldIndex {
        static EMPTY: FieldIndex = FieldIndex::new();
        self.indices.get(&kind).unwrap_or(&EMPTY)
    }

    /// Tags recorded for one key.
    #[must_use]
    pub fn tags(&self, kind: ObjKind, key: &str) -> Option<&[TypeTag]> {
        self.get_index(kind).get(key).map(Vec::as_slice)
    }

    /// Forgets a key. Returns true if it was registered.
    pub fn delete_key(&mut self, kind: ObjKind, key: &str) -> bool {
        self.indices
            .get_mut(&kind)
            .map_or(false, |index| index.remove(key).is_some())
    }

    /// Records the type of a value written under `key`.
    ///
    /// `Null` is ignored. `bin` absorbs: once recorded, nothing else is added,
    /// and recording it replaces every earlier tag.
    pub fn check_and_register(&mut self, kind: ObjKind, key: &str, value: &Value) {
        let Some(tag) = TypeTag::classify(value) else {
            return;
        };

        let absorb = match self.tags(kind, key) {
            None => false,
            Some(tags) if tags == [TypeTag::Bin] || tags.contains(&tag) => return,
            Some(_) => tag == TypeTag::Bin,
        };

        if absorb {
            self.set_index(kind, key, TypeTag::Bin);
        } else {
            self.update_index(kind, key, tag);
        }
    }

    /// Registers a vector name.
    pub fn add_vector(&mut self, name: impl Into<String>) {
        self.vectors.insert(name.into());
    }

    /// Unregisters a vector name. Returns true if it was registered.
    pub fn del_vector(&mut self, name: &str) -> bool {
        self.vectors.remove(name)
    }

    /// Returns true if the vector name is registered.
    #[must_use]
    pub fn has_vector(&self, name: &str) -> bool {
        self.vectors.contains(name)
    }

    /// Registered vector names, sorted.
    #[must_use]
    pub const fn vectors(&self) -> &BTreeSet<String> {
        &self.vectors
    }

    /// Current snapshot version.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Overrides the snapshot version.
    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Returns true if metadata writes are type-registered.
    #[must_use]
    pub const fn type_check_enabled(&self) -> bool {
        self.type_check
    }

    /// Turns metadata type registration on.
    pub fn enable_type_check(&mut self) {
        self.type_check = true;
    }

    /// Turns metadata type registration off.
    pub fn disable_type_check(&mut self) {
        self.type_check = false;
    }

    /// Returns true if single-object metadata deletion is refused for `kind`.
    ///
    /// Corpus-level metadata is never locked.
    #[must_use]
    pub fn is_deletion_locked(&self, kind: ObjKind) -> bool {
        kind != ObjKind::Corpus && self.deletion_locked.get(&kind).copied().unwrap_or(true)
    }

    /// Locks or unlocks single-object metadata deletion for `kind`.
    pub fn set_deletion_lock(&mut self, kind: ObjKind, locked: bool) {
        if kind != ObjKind::Corpus {
            self.deletion_locked.insert(kind, locked);
        }
    }

    /// Serializes the registry.
    ///
    /// Vector names in `exclude_vectors` are left out. The version is
    /// `force_version` when given, otherwise the current version plus one.
    #[must_use]
    pub fn to_dict(&self, exclude_vectors: &[&str], force_version: Option<u64>) -> RegistrySnapshot {
        let index = |kind| self.get_index(kind).clone();
        RegistrySnapshot {
            utterances_index: index(ObjKind::Utterance),
            conversations_index: index(ObjKind::Conversation),
            speakers_index: index(ObjKind::Speaker),
            overall_index: index(ObjKind::Corpus),
            vectors: self
                .vectors
                .iter()
                .filter(|v| !exclude_vectors.contains(&v.as_str()))
                .cloned()
                .collect(),
            version: force_version.unwrap_or(self.version + 1),
        }
    }

    /// Loads indices, vectors and version from a snapshot.
    ///
    /// Indices present in the snapshot replace the current ones; vectors are
    /// added to the current set.
    pub fn update_from_dict(&mut self, snapshot: &RegistrySnapshot) {
        for kind in ObjKind::ALL {
            let index = snapshot.index(kind);
            if !index.is_empty() {
                self.indices.insert(kind, index.clone());
            }
        }
        self.vectors.extend(snapshot.vectors.iter().cloned());
        self.version = snapshot.version;
    }

    /// Builds a registry from a snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: &RegistrySnapshot) -> Self {
        let mut registry = Self::new();
        registry.update_from_dict(snapshot);
        registry
    }

    /// Drops every index, keeping vectors, version and policy.
    pub fn clear_indices(&mut self) {
        for index in self.indices.values_mut() {
            index.clear();
        }
    }
}

impl fmt::Display for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.to_dict(&[], Some(self.version));
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => f.write_str(&json),
            Err(_) => Err(fmt::Error),
        }
    }
}
