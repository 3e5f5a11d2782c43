use std::fmt;
use std::sync::Arc;

use crate::error::{ConvoError, ConvoResult, PolicyViolation, TypeError};
use crate::meta::{storage_key, MetadataView};
use crate::model::ObjKind;
use crate::registry::read_registry;
use crate::storage::{Collection, FieldRecord, StorageManager};
use crate::value::{Document, StrLike, Value};

/// Field holding the object kind.
pub(crate) const OBJ_TYPE: &str = "obj_type";

/// Field holding the names of vectors attached to the object.
pub(crate) const VECTORS: &str = "vectors";

/// State shared by every entity: identity, fields, metadata and owner.
#[derive(Clone)]
pub struct Component {
    kind: ObjKind,
    id: String,
    fields: Arc<dyn FieldRecord>,
    meta: MetadataView,
    manager: StorageManager,
}

impl Component {
    /// Registers a new entity with `manager`, replacing any record stored
    /// under the same id, and applies `meta` through the metadata view.
    pub(crate) fn create(
        kind: ObjKind,
        id: impl Into<StrLike>,
        manager: &StorageManager,
        meta: Document,
    ) -> ConvoResult<Self> {
        let id = id.into().resolve("id");
        let fields = manager.entity_collection(kind)?.create_record(&id)?;
        fields.set(OBJ_TYPE, Value::from(kind.as_str()))?;
        fields.set(VECTORS, Value::List(Vec::new()))?;

        let meta_record = manager
            .metas_collection()?
            .create_record(&storage_key(kind, &id))?;
        let view = MetadataView::new(kind, id.clone(), meta_record, Arc::clone(manager.registry()));
        for (key, value) in meta {
            view.set(key, value)?;
        }

        Ok(Self {
            kind,
            id,
            fields,
            meta: view,
            manager: manager.clone(),
        })
    }

    /// Wraps an existing field record of `manager`.
    pub(crate) fn bind(
        kind: ObjKind,
        fields: Arc<dyn FieldRecord>,
        manager: &StorageManager,
    ) -> ConvoResult<Self> {
        let id = fields.id().to_string();
        let meta_record = manager
            .metas_collection()?
            .ensure_record(&storage_key(kind, &id))?;
        Ok(Self {
            kind,
            meta: MetadataView::new(kind, id.clone(), meta_record, Arc::clone(manager.registry())),
            id,
            fields,
            manager: manager.clone(),
        })
    }

    /// The entity id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The entity kind.
    #[must_use]
    pub const fn kind(&self) -> ObjKind {
        self.kind
    }

    /// Metadata of this entity.
    #[must_use]
    pub const fn meta(&self) -> &MetadataView {
        &self.meta
    }

    /// The manager this entity is stored in.
    #[must_use]
    pub const fn manager(&self) -> &StorageManager {
        &self.manager
    }

    /// The backing field record.
    #[must_use]
    pub fn fields(&self) -> &Arc<dyn FieldRecord> {
        &self.fields
    }

    /// Reads a structural field.
    pub fn field(&self, key: &str) -> ConvoResult<Value> {
        Ok(self.fields.get(key)?)
    }

    pub(crate) fn set_field(&self, key: &str, value: impl Into<Value>) -> ConvoResult<()> {
        self.fields.set(key, value.into())?;
        Ok(())
    }

    /// A string field, `None` when unset or null.
    pub(crate) fn str_field(&self, key: &str) -> ConvoResult<Option<String>> {
        match self.fields.get(key) {
            Ok(Value::Null) => Ok(None),
            Ok(Value::String(s)) => Ok(Some(s)),
            Ok(other) => Err(TypeError::FieldType {
                field: key.to_string(),
                expected: "string",
                actual: other.type_name(),
            }
            .into()),
            Err(e) => match ConvoError::from(e) {
                ConvoError::KeyNotFound { .. } => Ok(None),
                e => Err(e),
            },
        }
    }

    /// A string-list field, empty when unset.
    pub(crate) fn list_field(&self, key: &str) -> ConvoResult<Vec<String>> {
        match self.fields.get(key) {
            Ok(Value::Null) => Ok(Vec::new()),
            Ok(value) => value.as_string_list().ok_or_else(|| {
                TypeError::FieldType {
                    field: key.to_string(),
                    expected: "list of strings",
                    actual: value.type_name(),
                }
                .into()
            }),
            Err(e) => match ConvoError::from(e) {
                ConvoError::KeyNotFound { .. } => Ok(Vec::new()),
                e => Err(e),
            },
        }
    }

    /// Appends `item` to a string-list field unless already present.
    /// Returns true if it was added.
    pub(crate) fn push_unique(&self, key: &str, item: &str) -> ConvoResult<bool> {
        let mut items = self.list_field(key)?;
        if items.iter().any(|existing| existing == item) {
            return Ok(false);
        }
        items.push(item.to_string());
        self.set_field(key, items)?;
        Ok(true)
    }

    /// Sets a metadata value.
    pub fn add_meta(&self, key: impl Into<StrLike>, value: impl Into<Value>) -> ConvoResult<()> {
        self.meta.set(key, value)
    }

    /// Reads a metadata value, `None` when unset.
    pub fn retrieve_meta(&self, key: impl Into<StrLike>) -> ConvoResult<Option<Value>> {
        self.meta.get_opt(key)
    }

    /// Names of the vectors attached to this entity.
    pub fn vectors(&self) -> ConvoResult<Vec<String>> {
        self.list_field(VECTORS)
    }

    /// Attaches a vector by name. The name must be registered with the
    /// manager's schema registry.
    pub fn add_vector(&self, name: &str) -> ConvoResult<()> {
        if !read_registry(self.manager.registry())?.has_vector(name) {
            return Err(PolicyViolation::UnregisteredVector {
                name: name.to_string(),
            }
            .into());
        }
        self.push_unique(VECTORS, name)?;
        Ok(())
    }

    /// Returns true if the named vector is attached.
    pub fn has_vector(&self, name: &str) -> ConvoResult<bool> {
        Ok(self.vectors()?.iter().any(|v| v == name))
    }

    /// Detaches a vector. Returns true if it was attached.
    pub fn delete_vector(&self, name: &str) -> ConvoResult<bool> {
        let mut vectors = self.vectors()?;
        let before = vectors.len();
        vectors.retain(|v| v != name);
        if vectors.len() == before {
            return Ok(false);
        }
        self.set_field(VECTORS, vectors)?;
        Ok(true)
    }

    /// Stores this entity under `key` in `collection`.
    ///
    /// Adoption when the field record already lives there; otherwise fields
    /// and metadata are copied into `manager`'s collections, the metadata
    /// types are registered with its registry, and this entity is rebound.
    pub(crate) fn place(
        &mut self,
        key: &str,
        collection: &Arc<dyn Collection>,
        manager: &StorageManager,
    ) -> ConvoResult<()> {
        if key != self.id {
            return Err(TypeError::IdMismatch {
                kind: self.kind,
                key: key.to_string(),
                item_id: self.id.clone(),
            }
            .into());
        }

        if self.fields.collection_id() == collection.collection_id() {
            collection.adopt_record(&self.fields)?;
            return Ok(());
        }

        tracing::debug!(
            kind = %self.kind,
            id = %self.id,
            from = %self.fields.collection_id(),
            to = %collection.collection_id(),
            "transferring entity"
        );
        let fields = self.fields.transfer(collection.as_ref())?;
        let metas = manager.metas_collection()?;
        let meta_record = self.meta.record().transfer(metas.as_ref())?;
        let meta = MetadataView::new(
            self.kind,
            self.id.clone(),
            meta_record,
            Arc::clone(manager.registry()),
        );
        meta.register_all()?;

        self.fields = fields;
        self.meta = meta;
        self.manager = manager.clone();
        Ok(())
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("collection", self.fields.collection_id())
            .finish_non_exhaustive()
    }
}
