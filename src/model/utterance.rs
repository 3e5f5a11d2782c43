use std::ops::Deref;
use std::sync::Arc;

use crate::error::{ConvoResult, TypeError};
use crate::model::{Component, Conversation, ObjKind, Speaker};
use crate::storage::{Collection, FieldRecord, StorageManager, StoredItem};
use crate::value::{Document, StrLike, Value};

const SPEAKER_ID: &str = "speaker_id";
const CONVERSATION_ID: &str = "conversation_id";
const REPLY_TO: &str = "reply_to";
const TIMESTAMP: &str = "timestamp";
const TEXT: &str = "text";

/// A single message.
#[derive(Debug, Clone)]
pub struct Utterance {
    inner: Component,
}

/// Builder for [`Utterance`].
///
/// `id` and `speaker` are required.
#[derive(Debug, Default)]
pub struct UtteranceBuilder<'a> {
    id: Option<StrLike>,
    speaker: Option<&'a mut Speaker>,
    conversation_id: Option<StrLike>,
    reply_to: Option<StrLike>,
    timestamp: Value,
    text: Option<StrLike>,
    meta: Document,
}

impl<'a> UtteranceBuilder<'a> {
    /// Sets the utterance id.
    #[must_use]
    pub fn id(mut self, id: impl Into<StrLike>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the author.
    ///
    /// The speaker is stored in the utterance's manager (moved there if it
    /// lives elsewhere) and gains this utterance in its `utterance_ids`.
    #[must_use]
    pub fn speaker(mut self, speaker: &'a mut Speaker) -> Self {
        self.speaker = Some(speaker);
        self
    }

    /// Sets the conversation this utterance belongs to.
    #[must_use]
    pub fn conversation_id(mut self, id: impl Into<StrLike>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    /// Sets the id of the utterance this one replies to.
    #[must_use]
    pub fn reply_to(mut self, id: impl Into<StrLike>) -> Self {
        self.reply_to = Some(id.into());
        self
    }

    /// Sets the timestamp. Any value is accepted.
    #[must_use]
    pub fn timestamp(mut self, timestamp: impl Into<Value>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    /// Sets the text. Non-string input is stringified with a warning.
    #[must_use]
    pub fn text(mut self, text: impl Into<StrLike>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Adds one initial metadata entry.
    #[must_use]
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Replaces the initial metadata.
    #[must_use]
    pub fn meta_map(mut self, meta: Document) -> Self {
        self.meta = meta;
        self
    }

    /// Creates the utterance in `manager`.
    ///
    /// # Errors
    /// `Type(MissingField)` without an id or a speaker.
    pub fn build(self, manager: &StorageManager) -> ConvoResult<Utterance> {
        let id = self
            .id
            .ok_or_else(|| TypeError::MissingField {
                field: "id".to_string(),
            })?
            .resolve("id");
        let speaker = self.speaker.ok_or_else(|| TypeError::MissingField {
            field: "speaker".to_string(),
        })?;

        manager.insert_speaker(speaker)?;

        let inner = Component::create(ObjKind::Utterance, id.as_str(), manager, self.meta)?;
        inner.set_field(SPEAKER_ID, speaker.id())?;
        inner.set_field(
            CONVERSATION_ID,
            self.conversation_id.map(|c| c.resolve("conversation id")),
        )?;
        inner.set_field(REPLY_TO, self.reply_to.map(|r| r.resolve("reply_to")))?;
        inner.set_field(TIMESTAMP, self.timestamp)?;
        inner.set_field(
            TEXT,
            self.text.map_or_else(String::new, |t| t.resolve("utterance text")),
        )?;

        speaker.add_utterance_id(&id)?;
        Ok(Utterance { inner })
    }
}

impl Utterance {
    /// Starts building an utterance.
    #[must_use]
    pub fn builder<'a>() -> UtteranceBuilder<'a> {
        UtteranceBuilder::default()
    }

    /// The text.
    pub fn text(&self) -> ConvoResult<String> {
        Ok(self.inner.str_field(TEXT)?.unwrap_or_default())
    }

    /// Replaces the text. Non-string input is stringified with a warning.
    pub fn set_text(&self, text: impl Into<StrLike>) -> ConvoResult<()> {
        self.inner
            .set_field(TEXT, text.into().resolve("utterance text"))
    }

    /// Id of the author.
    pub fn speaker_id(&self) -> ConvoResult<String> {
        self.inner.str_field(SPEAKER_ID)?.ok_or_else(|| {
            TypeError::MissingField {
                field: SPEAKER_ID.to_string(),
            }
            .into()
        })
    }

    /// Loads the author from the owning manager.
    pub fn speaker(&self) -> ConvoResult<Speaker> {
        self.inner.manager().get_speaker(self.speaker_id()?)
    }

    /// Id of the conversation, if set.
    pub fn conversation_id(&self) -> ConvoResult<Option<String>> {
        self.inner.str_field(CONVERSATION_ID)
    }

    /// Moves the utterance into another conversation.
    pub fn set_conversation_id(&self, id: impl Into<StrLike>) -> ConvoResult<()> {
        self.inner
            .set_field(CONVERSATION_ID, id.into().resolve("conversation id"))
    }

    /// Id of the utterance this one replies to, if any.
    pub fn reply_to(&self) -> ConvoResult<Option<String>> {
        self.inner.str_field(REPLY_TO)
    }

    /// The timestamp as stored.
    pub fn timestamp(&self) -> ConvoResult<Value> {
        match self.inner.field(TIMESTAMP) {
            Err(e) if e.is_not_found() => Ok(Value::Null),
            other => other,
        }
    }

    /// Loads the conversation from the owning manager.
    ///
    /// # Errors
    /// `Type(MissingField)` when no conversation id is set.
    pub fn get_conversation(&self) -> ConvoResult<Conversation> {
        let id = self.conversation_id()?.ok_or_else(|| TypeError::MissingField {
            field: CONVERSATION_ID.to_string(),
        })?;
        self.inner.manager().get_conversation(id)
    }
}

impl Deref for Utterance {
    type Target = Component;

    fn deref(&self) -> &Component {
        &self.inner
    }
}

impl PartialEq for Utterance {
    fn eq(&self, other: &Self) -> bool {
        let fields = |u: &Self| -> ConvoResult<_> {
            Ok((
                u.conversation_id()?,
                u.reply_to()?,
                u.speaker_id()?,
                u.timestamp()?,
                u.text()?,
            ))
        };
        self.id() == other.id()
            && matches!((fields(self), fields(other)), (Ok(a), Ok(b)) if a == b)
    }
}

impl StoredItem for Utterance {
    const META_KIND: Option<ObjKind> = Some(ObjKind::Utterance);

    fn hydrate(manager: &StorageManager, record: Arc<dyn FieldRecord>) -> ConvoResult<Self> {
        Ok(Self {
            inner: Component::bind(ObjKind::Utterance, record, manager)?,
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
