//! Typed view over one collection.
//!
//! A [`CollectionStore`] pairs a backend [`Collection`] with the manager that
//! owns it and hydrates records into entities (or raw documents for the
//! metadata collection). Stores are cheap, transient handles; the manager
//! hands out a fresh one on every call.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::ConvoResult;
use crate::meta::storage_key;
use crate::model::ObjKind;
use crate::storage::{Collection, FieldRecord, StorageManager};
use crate::value::{Document, StrLike};

/// Something a [`CollectionStore`] can hold.
pub trait StoredItem: Sized {
    /// Kind whose metadata record is removed together with the item.
    const META_KIND: Option<ObjKind> = None;

    /// Builds an item around a record of the store's collection.
    fn hydrate(manager: &StorageManager, record: Arc<dyn FieldRecord>) -> ConvoResult<Self>;

    /// Makes the item reachable under `key` in `collection`.
    ///
    /// Entities already living in `collection` are only adopted; entities
    /// from any other collection are copied over together with their
    /// metadata and rebound to `manager`.
    fn place(
        &mut self,
        key: &str,
        collection: &Arc<dyn Collection>,
        manager: &StorageManager,
    ) -> ConvoResult<()>;
}

impl StoredItem for Document {
    fn hydrate(_manager: &StorageManager, record: Arc<dyn FieldRecord>) -> ConvoResult<Self> {
        Ok(record.as_map()?)
    }

    fn place(
        &mut self,
        key: &str,
        collection: &Arc<dyn Collection>,
        _manager: &StorageManager,
    ) -> ConvoResult<()> {
        collection.insert_record(key, self.clone())?;
        Ok(())
    }
}

/// A named, homogeneously-typed set of items addressed by string id.
pub struct CollectionStore<T> {
    collection: Arc<dyn Collection>,
    manager: StorageManager,
    _item: PhantomData<fn() -> T>,
}

impl<T: StoredItem> CollectionStore<T> {
    pub(crate) fn new(collection: Arc<dyn Collection>, manager: StorageManager) -> Self {
        Self {
            collection,
            manager,
            _item: PhantomData,
        }
    }

    /// Physical collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.collection.name()
    }

    /// The backend collection.
    #[must_use]
    pub fn collection(&self) -> &Arc<dyn Collection> {
        &self.collection
    }

    /// Loads an item. Missing ids are [`ConvoError::NotFound`](crate::ConvoError::NotFound).
    pub fn get(&self, id: impl Into<StrLike>) -> ConvoResult<T> {
        let id = id.into().resolve("id");
        let record = self.collection.open_record(&id)?;
        T::hydrate(&self.manager, record)
    }

    /// Stores an item under `id`, transferring it here if it currently
    /// lives in another collection.
    pub fn set(&self, id: impl Into<StrLike>, item: &mut T) -> ConvoResult<()> {
        let id = id.into().resolve("id");
        item.place(&id, &self.collection, &self.manager)
    }

    /// Removes an item and its metadata record. Missing ids are `NotFound`.
    pub fn delete(&self, id: impl Into<StrLike>) -> ConvoResult<()> {
        let id = id.into().resolve("id");
        self.collection.remove(&id)?;
        self.forget_meta(std::slice::from_ref(&id))
    }

    fn forget_meta(&self, ids: &[String]) -> ConvoResult<()> {
        let Some(kind) = T::META_KIND else {
            return Ok(());
        };
        let metas = self.manager.metas_collection()?;
        for id in ids {
            let key = storage_key(kind, id);
            if metas.contains(&key)? {
                metas.remove(&key)?;
            }
        }
        Ok(())
    }

    /// All ids, sorted.
    pub fn ids(&self) -> ConvoResult<Vec<String>> {
        Ok(self.collection.ids()?)
    }

    /// Hydrates every item, in id order.
    ///
    /// Ids are listed up front; an item deleted while iterating yields
    /// `NotFound`.
    pub fn iter(&self) -> ConvoResult<impl Iterator<Item = ConvoResult<T>> + '_> {
        let ids = self.ids()?;
        Ok(ids.into_iter().map(move |id| self.get(id)))
    }

    /// Number of items.
    pub fn len(&self) -> ConvoResult<usize> {
        Ok(self.collection.len()?)
    }

    /// Returns true if the store holds no items.
    pub fn is_empty(&self) -> ConvoResult<bool> {
        Ok(self.collection.is_empty()?)
    }

    /// Returns true if an item with this id exists.
    pub fn contains(&self, id: impl Into<StrLike>) -> ConvoResult<bool> {
        let id = id.into().resolve("id");
        Ok(self.collection.contains(&id)?)
    }

    /// Keeps only the items matching `predicate` and deletes the rest,
    /// metadata included.
    ///
    /// Returns the number of items removed.
    pub fn filter<F>(&self, mut predicate: F) -> ConvoResult<usize>
    where
        F: FnMut(&T) -> bool,
    {
        let mut keep = std::collections::BTreeSet::new();
        let mut doomed = Vec::new();
        for id in self.ids()? {
            let item = self.get(id.as_str())?;
            if predicate(&item) {
                keep.insert(id);
            } else {
                doomed.push(id);
            }
        }
        let removed = self.collection.retain_ids(&keep)?;
        self.forget_meta(&doomed)?;
        if removed > 0 {
            tracing::debug!(collection = self.name(), removed, "filtered collection");
        }
        Ok(removed)
    }

    /// Drops the whole collection.
    pub fn drop_collection(&self) -> ConvoResult<()> {
        self.collection.drop_collection()?;
        Ok(())
    }
}

impl<T> fmt::Debug for CollectionStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionStore")
            .field("collection", self.collection.collection_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Backend, StorageOptions};
    use crate::value::Value;

    fn doc(pairs: &[(&str, i64)]) -> Document {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn test_raw_store_roundtrip() {
        let manager = StorageManager::new(Backend::Memory, StorageOptions::default()).unwrap();
        let metas = manager.metas().unwrap();

        metas.set("utterance_0", &mut doc(&[("a", 1)])).unwrap();
        assert_eq!(metas.get("utterance_0").unwrap(), doc(&[("a", 1)]));
        assert_eq!(metas.len().unwrap(), 1);

        metas.delete("utterance_0").unwrap();
        assert!(metas.get("utterance_0").unwrap_err().is_not_found());
        assert!(metas.delete("utterance_0").unwrap_err().is_not_found());
    }

    #[test]
    fn test_filter_removes_non_matching() {
        let manager = StorageManager::new(Backend::Memory, StorageOptions::default()).unwrap();
        let metas = manager.metas().unwrap();
        for i in 0..5 {
            metas.set(format!("corpus_{i}"), &mut doc(&[("n", i)])).unwrap();
        }

        let removed = metas
            .filter(|d| d.get("n").and_then(Value::as_int).unwrap_or(0) % 2 == 0)
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(
            metas.ids().unwrap(),
            vec!["corpus_0", "corpus_2", "corpus_4"]
        );
        assert_eq!(metas.iter().unwrap().count(), 3);
    }

    #[test]
    fn test_numeric_ids_are_coerced() {
        let manager = StorageManager::new(Backend::Memory, StorageOptions::default()).unwrap();
        let metas = manager.metas().unwrap();
        metas.set(42, &mut Document::new()).unwrap();
        assert!(metas.contains("42").unwrap());
        assert!(metas.contains(42).unwrap());
    }
}
