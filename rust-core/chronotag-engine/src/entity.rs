// SPDX-License-Identifier: PMPL-1.0-or-later
//! Entity, write and query types
//!
//! [`Mutation`] is the closed set of state changes. It is what the WAL
//! records and the one thing the applier dispatches on.

use std::collections::BTreeSet;

use chronotag_index::{fold_events, Tag, TagAction, TagEvent, TagSnapshot, Timestamp};
use chronotag_store::StoredEntity;
use chronotag_wal::WalOperation;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// An entity as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    /// Every tag-event, oldest first.
    pub tags: Vec<TagEvent>,
    pub content: Option<Vec<u8>>,
    /// Timestamp of the first tag-event.
    pub created_at: Timestamp,
    /// Timestamp of the last tag-event.
    pub updated_at: Timestamp,
    pub deleted: bool,
}

impl Entity {
    pub(crate) fn from_stored(stored: StoredEntity, content: Option<Vec<u8>>) -> Self {
        let created_at = stored.history.first_timestamp().unwrap_or_default();
        let updated_at = stored.history.last_timestamp().unwrap_or_default();
        let deleted = stored.is_deleted();
        Self {
            id: stored.id,
            tags: stored.history.events,
            content,
            created_at,
            updated_at,
            deleted,
        }
    }

    /// The tag set after folding every event.
    pub fn current_tags(&self) -> BTreeSet<Tag> {
        fold_events(&self.tags).0
    }

    pub fn has_tag(&self, canonical: &str) -> bool {
        self.current_tags().iter().any(|t| t.canonical() == canonical)
    }
}

/// The tags of an entity at one instant.
pub type EntitySnapshot = TagSnapshot;

/// One tag change requested by a caller.
///
/// Without an explicit timestamp the engine stamps the write with its own
/// monotonic clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagWrite {
    pub tag: Tag,
    pub action: TagAction,
    pub timestamp: Option<Timestamp>,
}

impl TagWrite {
    pub fn assert(tag: Tag) -> Self {
        Self {
            tag,
            action: TagAction::Assert,
            timestamp: None,
        }
    }

    pub fn retract(tag: Tag) -> Self {
        Self {
            tag,
            action: TagAction::Retract,
            timestamp: None,
        }
    }

    /// Parse `namespace:value` into an assert.
    pub fn parse(text: &str) -> EngineResult<Self> {
        Ok(Self::assert(Tag::parse(text)?))
    }

    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

impl From<Tag> for TagWrite {
    fn from(tag: Tag) -> Self {
        Self::assert(tag)
    }
}

/// Parse a list of `namespace:value` strings into asserts.
pub fn parse_tags<S: AsRef<str>>(tags: &[S]) -> EngineResult<Vec<TagWrite>> {
    tags.iter().map(|t| TagWrite::parse(t.as_ref())).collect()
}

/// A tag query. Terms are ANDed; a term ending in `*` is a prefix match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagQuery {
    pub tags: Vec<String>,
    pub limit: Option<usize>,
    pub include_deleted: bool,
}

impl TagQuery {
    pub fn new<S: Into<String>>(tags: impl IntoIterator<Item = S>) -> Self {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }
}

/// A resolved state change, as recorded in the WAL payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    Create {
        timestamp: Timestamp,
        events: Vec<TagEvent>,
        content: Option<Vec<u8>>,
    },
    Update {
        timestamp: Timestamp,
        events: Vec<TagEvent>,
        content: Option<Vec<u8>>,
    },
    Delete {
        timestamp: Timestamp,
    },
}

impl Mutation {
    pub fn operation(&self) -> WalOperation {
        match self {
            Mutation::Create { .. } => WalOperation::Create,
            Mutation::Update { .. } => WalOperation::Update,
            Mutation::Delete { .. } => WalOperation::Delete,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            Mutation::Create { timestamp, .. }
            | Mutation::Update { timestamp, .. }
            | Mutation::Delete { timestamp } => *timestamp,
        }
    }

    /// Content bytes carried by the mutation.
    pub fn content_len(&self) -> usize {
        match self {
            Mutation::Create { content, .. } | Mutation::Update { content, .. } => {
                content.as_ref().map_or(0, Vec::len)
            }
            Mutation::Delete { .. } => 0,
        }
    }

    pub fn encode(&self) -> EngineResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode a WAL payload and check it against the entry's operation.
    pub fn decode(operation: WalOperation, payload: &[u8]) -> EngineResult<Self> {
        let mutation: Mutation = postcard::from_bytes(payload)?;
        if mutation.operation() != operation {
            return Err(EngineError::InvalidMutation(format!(
                "WAL entry operation {operation:?} does not match payload {:?}",
                mutation.operation()
            )));
        }
        Ok(mutation)
    }
}
