//! Dict-like view over one entity's metadata record.
//!
//! Metadata for all kinds lives in the manager's `metas` collection under the
//! storage key `"{kind}_{id}"`. Every write goes through the schema registry
//! first so the type index always reflects what has been stored, and every
//! single-key deletion is checked against the registry's deletion policy.

use std::fmt;
use std::sync::Arc;

use crate::error::{ConvoError, ConvoResult, PolicyViolation};
use crate::model::ObjKind;
use crate::registry::{read_registry, write_registry, SharedRegistry};
use crate::storage::FieldRecord;
use crate::value::{Document, StrLike, Value};

/// Key of an entity's metadata record in the `metas` collection.
#[must_use]
pub fn storage_key(kind: ObjKind, id: &str) -> String {
    format!("{kind}_{id}")
}

/// Metadata of one utterance, conversation, speaker or corpus.
#[derive(Clone)]
pub struct MetadataView {
    kind: ObjKind,
    owner_id: String,
    record: Arc<dyn FieldRecord>,
    registry: SharedRegistry,
}

impl MetadataView {
    pub(crate) fn new(
        kind: ObjKind,
        owner_id: impl Into<String>,
        record: Arc<dyn FieldRecord>,
        registry: SharedRegistry,
    ) -> Self {
        Self {
            kind,
            owner_id: owner_id.into(),
            record,
            registry,
        }
    }

    /// Kind of the owning object.
    #[must_use]
    pub const fn kind(&self) -> ObjKind {
        self.kind
    }

    /// Id of the owning object.
    #[must_use]
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Key of the backing record in the `metas` collection.
    #[must_use]
    pub fn storage_key(&self) -> String {
        storage_key(self.kind, &self.owner_id)
    }

    pub(crate) fn record(&self) -> &Arc<dyn FieldRecord> {
        &self.record
    }

    /// Reads a value. Missing keys are [`ConvoError::KeyNotFound`].
    pub fn get(&self, key: impl Into<StrLike>) -> ConvoResult<Value> {
        let key = key.into().resolve("metadata key");
        Ok(self.record.get(&key)?)
    }

    /// Reads a value, mapping a missing key to `None`.
    pub fn get_opt(&self, key: impl Into<StrLike>) -> ConvoResult<Option<Value>> {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConvoError::KeyNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Writes a value, registering its type unless type checking is off.
    pub fn set(&self, key: impl Into<StrLike>, value: impl Into<Value>) -> ConvoResult<()> {
        let key = key.into().resolve("metadata key");
        let value = value.into();
        {
            let mut registry = write_registry(&self.registry)?;
            if registry.type_check_enabled() {
                registry.check_and_register(self.kind, &key, &value);
            }
        }
        self.record.set(&key, value)?;
        Ok(())
    }

    /// Deletes a key from this object only.
    ///
    /// Corpus metadata is always deletable and the key leaves the type index
    /// too. For entity kinds the registry's deletion lock decides; an unlocked
    /// deletion leaves the type index alone since other objects may still
    /// hold the key.
    ///
    /// # Errors
    /// [`PolicyViolation::MetadataDeletionLocked`] when the kind is locked,
    /// [`ConvoError::KeyNotFound`] when the key is absent.
    pub fn delete(&self, key: impl Into<StrLike>) -> ConvoResult<()> {
        let key = key.into().resolve("metadata key");

        if self.kind == ObjKind::Corpus {
            self.record.delete(&key)?;
            write_registry(&self.registry)?.delete_key(self.kind, &key);
            return Ok(());
        }

        if read_registry(&self.registry)?.is_deletion_locked(self.kind) {
            return Err(PolicyViolation::MetadataDeletionLocked {
                kind: self.kind,
                key,
            }
            .into());
        }
        self.force_delete(&key)
    }

    /// Deletes without consulting the policy. Used by bulk deletion.
    pub(crate) fn force_delete(&self, key: &str) -> ConvoResult<()> {
        self.record.delete(key)?;
        Ok(())
    }

    /// Keys, sorted.
    pub fn keys(&self) -> ConvoResult<Vec<String>> {
        Ok(self.record.keys()?)
    }

    /// Number of keys.
    pub fn len(&self) -> ConvoResult<usize> {
        Ok(self.record.len()?)
    }

    /// Returns true if no metadata is set.
    pub fn is_empty(&self) -> ConvoResult<bool> {
        Ok(self.record.is_empty()?)
    }

    /// Returns true if the key is set.
    pub fn contains(&self, key: impl Into<StrLike>) -> ConvoResult<bool> {
        let key = key.into().resolve("metadata key");
        Ok(self.record.contains(&key)?)
    }

    /// A detached copy of all metadata.
    pub fn to_map(&self) -> ConvoResult<Document> {
        Ok(self.record.as_map()?)
    }

    /// Replaces all metadata with `document`, registering every value.
    pub fn reinitialize_from(&self, document: &Document) -> ConvoResult<()> {
        for key in self.keys()? {
            if !document.contains_key(&key) {
                self.record.delete(&key)?;
            }
        }
        for (key, value) in document {
            self.set(key, value.clone())?;
        }
        Ok(())
    }

    /// Registers the types of every stored value, as after a transfer into
    /// another manager.
    pub(crate) fn register_all(&self) -> ConvoResult<()> {
        let document = self.to_map()?;
        let mut registry = write_registry(&self.registry)?;
        if registry.type_check_enabled() {
            for (key, value) in &document {
                registry.check_and_register(self.kind, key, value);
            }
        }
        Ok(())
    }
}

impl PartialEq for MetadataView {
    fn eq(&self, other: &Self) -> bool {
        match (self.to_map(), other.to_map()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialEq<Document> for MetadataView {
    fn eq(&self, other: &Document) -> bool {
        self.to_map().map_or(false, |map| &map == other)
    }
}

impl fmt::Debug for MetadataView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("MetadataView");
        dbg.field("kind", &self.kind).field("owner_id", &self.owner_id);
        match self.to_map() {
            Ok(map) => dbg.field("data", &map),
            Err(_) => dbg.field("data", &"<unavailable>"),
        };
        dbg.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{SchemaRegistry, TypeTag};
    use crate::storage::{Collection, MemoryNamespace};

    fn view(kind: ObjKind, id: &str) -> (MetadataView, SharedRegistry) {
        let ns = MemoryNamespace::new();
        let metas = ns.collection("test_v0_metas").unwrap();
        let record = metas.create_record(&storage_key(kind, id)).unwrap();
        let registry = SchemaRegistry::new().shared();
        (
            MetadataView::new(kind, id, record, Arc::clone(&registry)),
            registry,
        )
    }

    #[test]
    fn test_set_registers_type() {
        let (meta, registry) = view(ObjKind::Utterance, "0");
        meta.set("score", 1).unwrap();
        meta.set("score", "high").unwrap();

        assert_eq!(meta.get("score").unwrap(), Value::from("high"));
        assert_eq!(
            registry.read().unwrap().tags(ObjKind::Utterance, "score"),
            Some(&[TypeTag::Int, TypeTag::Str][..])
        );
    }

    #[test]
    fn test_disabled_type_check_skips_registration() {
        let (meta, registry) = view(ObjKind::Speaker, "bob");
        registry.write().unwrap().disable_type_check();
        meta.set("age", 30).unwrap();

        assert_eq!(meta.get("age").unwrap(), Value::from(30));
        assert!(registry.read().unwrap().tags(ObjKind::Speaker, "age").is_none());
    }

    #[test]
    fn test_numeric_keys_are_coerced() {
        let (meta, _) = view(ObjKind::Utterance, "0");
        meta.set(7, "seven").unwrap();
        assert_eq!(meta.get("7").unwrap(), Value::from("seven"));
        assert!(meta.contains(7).unwrap());
    }

    #[test]
    fn test_missing_key() {
        let (meta, _) = view(ObjKind::Utterance, "0");
        assert!(matches!(
            meta.get("color"),
            Err(ConvoError::KeyNotFound { .. })
        ));
        assert_eq!(meta.get_opt("color").unwrap(), None);
    }

    #[test]
    fn test_locked_delete_is_refused() {
        let (meta, _) = view(ObjKind::Conversation, "c1");
        meta.set("topic", "rust").unwrap();

        let err = meta.delete("topic").unwrap_err();
        assert!(err.is_policy_violation());
        assert!(meta.contains("topic").unwrap());
    }

    #[test]
    fn test_unlocked_delete_keeps_index() {
        let (meta, registry) = view(ObjKind::Utterance, "0");
        registry
            .write()
            .unwrap()
            .set_deletion_lock(ObjKind::Utterance, false);
        meta.set("toxicity", 0.3).unwrap();

        meta.delete("toxicity").unwrap();
        assert!(!meta.contains("toxicity").unwrap());
        assert!(registry
            .read()
            .unwrap()
            .tags(ObjKind::Utterance, "toxicity")
            .is_some());
    }

    #[test]
    fn test_corpus_delete_purges_index() {
        let (meta, registry) = view(ObjKind::Corpus, "c");
        meta.set("name", "reddit").unwrap();

        meta.delete("name").unwrap();
        assert!(!meta.contains("name").unwrap());
        assert!(registry.read().unwrap().tags(ObjKind::Corpus, "name").is_none());
        assert!(matches!(
            meta.delete("name"),
            Err(ConvoError::KeyNotFound { .. })
        ));
    }

    #[test]
    fn test_reinitialize_from() {
        let (meta, _) = view(ObjKind::Speaker, "bob");
        meta.set("old", 1).unwrap();

        let mut doc = Document::new();
        doc.insert("new".to_string(), Value::from(2));
        meta.reinitialize_from(&doc).unwrap();

        assert_eq!(meta, doc);
    }

    #[test]
    fn test_views_compare_by_content() {
        let (a, _) = view(ObjKind::Utterance, "0");
        let (b, _) = view(ObjKind::Utterance, "1");
        a.set("k", 1).unwrap();
        assert_ne!(a, b);
        b.set("k", 1).unwrap();
        assert_eq!(a, b);
    }
}
