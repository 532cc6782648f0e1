// SPDX-License-Identifier: PMPL-1.0-or-later
//! ChronoTag indexes
//!
//! The tag index answers "which entities carry these tags now"; the
//! temporal index answers "what did an entity carry at time t". Both are
//! projections of entity tag-event histories and can be rebuilt from them
//! at any time.

pub mod diff;
pub mod error;
pub mod snapshot;
pub mod tag;
pub mod tag_index;
pub mod temporal;

use std::collections::BTreeMap;

use tracing::debug;

pub use diff::{TagChange, TagDiff};
pub use error::{IndexError, IndexResult};
pub use snapshot::IndexSnapshot;
pub use tag::{EntityHistory, Tag, TagAction, TagEvent, Timestamp, WriteMark, TOMBSTONE_TAG};
pub use tag_index::{TagIndex, TagPattern};
pub use temporal::{fold_events, ChangeEvent, Revision, TagSnapshot, TemporalIndex};

/// The tag and temporal indexes kept in step, with the highest WAL
/// sequence they reflect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Indexes {
    pub tags: TagIndex,
    pub temporal: TemporalIndex,
    watermark: u64,
}

impl Indexes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild both indexes from a snapshot.
    pub fn from_snapshot(snapshot: IndexSnapshot) -> Self {
        let mut indexes = Self::new();
        for (entity_id, history) in &snapshot.histories {
            indexes.index_entity(entity_id, history);
        }
        indexes.watermark = snapshot.watermark;
        indexes
    }

    /// Capture the histories for persistence.
    pub fn to_snapshot(&self) -> IndexSnapshot {
        let histories: BTreeMap<String, EntityHistory> = self
            .temporal
            .histories()
            .map(|(id, history)| (id.clone(), history.clone()))
            .collect();
        IndexSnapshot {
            watermark: self.watermark,
            histories,
        }
    }

    /// Replace an entity in both indexes from its complete history.
    pub fn index_entity(&mut self, entity_id: &str, history: &EntityHistory) {
        self.tags.index_entity(entity_id, &history.events);
        self.temporal.index_entity(entity_id, history);
        self.watermark = self.watermark.max(history.last_sequence());
        debug!(
            entity_id,
            events = history.events.len(),
            watermark = self.watermark,
            "Indexed entity"
        );
    }

    pub fn remove_entity(&mut self, entity_id: &str) {
        self.tags.remove_entity(entity_id);
        self.temporal.remove_entity(entity_id);
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Raise the watermark for a sequence that changed no entity.
    pub fn advance_watermark(&mut self, sequence: u64) {
        self.watermark = self.watermark.max(sequence);
    }

    pub fn is_deleted(&self, entity_id: &str) -> bool {
        self.tags.has_tag(entity_id, TOMBSTONE_TAG)
            && self
                .temporal
                .entity_history(entity_id)
                .is_some_and(EntityHistory::is_deleted)
    }

    /// Whether the two sets index the same entities identically,
    /// ignoring watermarks.
    pub fn same_content(&self, other: &Indexes) -> bool {
        self.tags == other.tags && self.temporal == other.temporal
    }
}
