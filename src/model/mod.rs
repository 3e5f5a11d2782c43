//! Corpus entities: utterances, conversations and speakers.
//!
//! Every entity is a [`Component`]: an immutable id, a field record holding
//! its structural fields, a [`MetadataView`](crate::MetadataView) over its
//! metadata record and a handle to the owning
//! [`StorageManager`](crate::StorageManager).

mod component;
mod conversation;
mod speaker;
mod utterance;

pub use component::Component;
pub use conversation::Conversation;
pub use speaker::Speaker;
pub use utterance::{Utterance, UtteranceBuilder};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// The kind of object a record or metadata entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjKind {
    /// A single message.
    Utterance,
    /// A thread of utterances.
    Conversation,
    /// The author of utterances.
    Speaker,
    /// Corpus-level metadata.
    Corpus,
}

impl ObjKind {
    /// Every kind, corpus included.
    pub const ALL: [Self; 4] = [Self::Utterance, Self::Conversation, Self::Speaker, Self::Corpus];

    /// Kinds backed by an entity collection.
    pub const ENTITY_KINDS: [Self; 3] = [Self::Utterance, Self::Conversation, Self::Speaker];

    /// Lowercase name, also the prefix of metadata storage keys.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Utterance => "utterance",
            Self::Conversation => "conversation",
            Self::Speaker => "speaker",
            Self::Corpus => "corpus",
        }
    }

    /// Suffix of the physical collection holding this kind's field records.
    ///
    /// Corpus-level metadata has no field collection.
    #[must_use]
    pub const fn collection_suffix(&self) -> Option<&'static str> {
        match self {
            Self::Utterance => Some("utterances"),
            Self::Conversation => Some("conversations"),
            Self::Speaker => Some("speakers"),
            Self::Corpus => None,
        }
    }
}

impl fmt::Display for ObjKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjKind {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "utterance" => Ok(Self::Utterance),
            "conversation" => Ok(Self::Conversation),
            "speaker" | "user" => Ok(Self::Speaker),
            "corpus" => Ok(Self::Corpus),
            _ => Err(TypeError::UnknownKind {
                value: s.to_string(),
            }),
        }
    }
}
