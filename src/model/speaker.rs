use std::ops::Deref;
use std::sync::Arc;

use crate::error::ConvoResult;
use crate::model::{Component, Conversation, ObjKind, Utterance};
use crate::storage::{Collection, FieldRecord, StorageManager, StoredItem};
use crate::value::{Document, StrLike};

const UTTERANCE_IDS: &str = "utterance_ids";
const CONVERSATION_IDS: &str = "conversation_ids";

/// The author of utterances.
#[derive(Debug, Clone)]
pub struct Speaker {
    inner: Component,
}

impl Speaker {
    /// Creates a speaker in `manager`, replacing any speaker with the same id.
    pub fn new(manager: &StorageManager, id: impl Into<StrLike>) -> ConvoResult<Self> {
        Self::with_meta(manager, id, Document::new())
    }

    /// Creates a speaker with initial metadata.
    pub fn with_meta(
        manager: &StorageManager,
        id: impl Into<StrLike>,
        meta: Document,
    ) -> ConvoResult<Self> {
        let inner = Component::create(ObjKind::Speaker, id, manager, meta)?;
        inner.set_field(UTTERANCE_IDS, Vec::<String>::new())?;
        inner.set_field(CONVERSATION_IDS, Vec::<String>::new())?;
        Ok(Self { inner })
    }

    /// Ids of the utterances this speaker authored, in insertion order.
    pub fn utterance_ids(&self) -> ConvoResult<Vec<String>> {
        self.inner.list_field(UTTERANCE_IDS)
    }

    /// Ids of the conversations this speaker took part in.
    pub fn conversation_ids(&self) -> ConvoResult<Vec<String>> {
        self.inner.list_field(CONVERSATION_IDS)
    }

    pub(crate) fn add_utterance_id(&self, id: &str) -> ConvoResult<bool> {
        self.inner.push_unique(UTTERANCE_IDS, id)
    }

    /// Records participation in a conversation. Returns true if it was new.
    pub fn add_conversation(&self, conversation_id: &str) -> ConvoResult<bool> {
        self.inner.push_unique(CONVERSATION_IDS, conversation_id)
    }

    /// Loads one utterance from the owning manager.
    pub fn get_utterance(&self, id: impl Into<StrLike>) -> ConvoResult<Utterance> {
        self.inner.manager().get_utterance(id)
    }

    /// Loads every utterance of this speaker.
    pub fn iter_utterances(&self) -> ConvoResult<Vec<Utterance>> {
        self.utterance_ids()?
            .into_iter()
            .map(|id| self.get_utterance(id))
            .collect()
    }

    /// Loads one conversation from the owning manager.
    pub fn get_conversation(&self, id: impl Into<StrLike>) -> ConvoResult<Conversation> {
        self.inner.manager().get_conversation(id)
    }

    /// Loads every conversation this speaker took part in.
    pub fn iter_conversations(&self) -> ConvoResult<Vec<Conversation>> {
        self.conversation_ids()?
            .into_iter()
            .map(|id| self.get_conversation(id))
            .collect()
    }
}

impl Deref for Speaker {
    type Target = Component;

    fn deref(&self) -> &Component {
        &self.inner
    }
}

impl PartialEq for Speaker {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl StoredItem for Speaker {
    const META_KIND: Option<ObjKind> = Some(ObjKind::Speaker);

    fn hydrate(manager: &StorageManager, record: Arc<dyn FieldRecord>) -> ConvoResult<Self> {
        Ok(Self {
            inner: Component::bind(ObjKind::Speaker, record, manager)?,
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
