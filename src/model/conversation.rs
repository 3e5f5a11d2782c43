use std::ops::Deref;
use std::sync::Arc;

use crate::error::ConvoResult;
use crate::model::{Component, ObjKind, Utterance};
use crate::storage::{Collection, FieldRecord, StorageManager, StoredItem};
use crate::value::{Document, StrLike};

const UTTERANCE_IDS: &str = "utterance_ids";

/// A thread of utterances.
#[derive(Debug, Clone)]
pub struct Conversation {
    inner: Component,
}

impl Conversation {
    /// Creates an empty conversation in `manager`, replacing any
    /// conversation with the same id.
    pub fn new(manager: &StorageManager, id: impl Into<StrLike>) -> ConvoResult<Self> {
        Self::with_utterances(manager, id, Vec::new(), Document::new())
    }

    /// Creates a conversation over existing utterance ids with initial
    /// metadata.
    pub fn with_utterances(
        manager: &StorageManager,
        id: impl Into<StrLike>,
        utterance_ids: Vec<String>,
        meta: Document,
    ) -> ConvoResult<Self> {
        let inner = Component::create(ObjKind::Conversation, id, manager, meta)?;
        inner.set_field(UTTERANCE_IDS, utterance_ids)?;
        Ok(Self { inner })
    }

    /// Ids of the utterances in this conversation, in insertion order.
    pub fn utterance_ids(&self) -> ConvoResult<Vec<String>> {
        self.inner.list_field(UTTERANCE_IDS)
    }

    /// Adds an utterance to this conversation.
    ///
    /// Points the utterance's `conversation_id` here and records the
    /// conversation on its speaker. Returns true if the utterance was new to
    /// the conversation.
    pub fn add_utterance(&self, utterance: &Utterance) -> ConvoResult<bool> {
        let added = self.inner.push_unique(UTTERANCE_IDS, utterance.id())?;
        utterance.set_conversation_id(self.id())?;
        match utterance.speaker() {
            Ok(speaker) => {
                speaker.add_conversation(self.id())?;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        Ok(added)
    }

    /// Loads one utterance from the owning manager.
    pub fn get_utterance(&self, id: impl Into<StrLike>) -> ConvoResult<Utterance> {
        self.inner.manager().get_utterance(id)
    }

    /// Loads every utterance of this conversation.
    pub fn iter_utterances(&self) -> ConvoResult<Vec<Utterance>> {
        self.utterance_ids()?
            .into_iter()
            .map(|id| self.get_utterance(id))
            .collect()
    }

    /// Ids of every speaker in this conversation, in order of first
    /// appearance.
    pub fn speaker_ids(&self) -> ConvoResult<Vec<String>> {
        let mut ids: Vec<String> = Vec::new();
        for utterance in self.iter_utterances()? {
            let speaker_id = utterance.speaker_id()?;
            if !ids.contains(&speaker_id) {
                ids.push(speaker_id);
            }
        }
        Ok(ids)
    }
}

impl Deref for Conversation {
    type Target = Component;

    fn deref(&self) -> &Component {
        &self.inner
    }
}

impl PartialEq for Conversation {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
            && matches!(
                (self.utterance_ids(), other.utterance_ids()),
                (Ok(a), Ok(b)) if a == b
            )
    }
}

impl StoredItem for Conversation {
    const META_KIND: Option<ObjKind> = Some(ObjKind::Conversation);

    fn hydrate(manager: &StorageManager, record: Arc<dyn FieldRecord>) -> ConvoResult<Self> {
        Ok(Self {
            inner: Component::bind(ObjKind::Conversation, record, manager)?,
        })
    }

    fn place(
        &mut self,
        key: &str,
        collection: &Arc<dyn Collection>,
        manager: &StorageManager,
    ) -> ConvoResult<()> {
        self.inner.place(key, collection, manager)
    }
}
