// SPDX-License-Identifier: PMPL-1.0-or-later
//! Temporal index
//!
//! Keeps every entity's ordered tag-event history and a global timeline so
//! the engine can answer "what did this entity look like at t", "what
//! changed between t1 and t2" and "what changed anywhere since t".

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::diff::TagDiff;
use crate::error::{IndexError, IndexResult};
use crate::tag::{EntityHistory, Tag, TagAction, TagEvent, Timestamp};

/// An entity's tag set at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSnapshot {
    pub entity_id: String,
    pub at: Timestamp,
    pub tags: BTreeSet<Tag>,
    pub deleted: bool,
}

/// The tag-events appended by one write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub sequence: u64,
    pub timestamp: Timestamp,
    pub events: Vec<TagEvent>,
}

/// One tag-event on the global timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity_id: String,
    pub event: TagEvent,
}

/// Fold tag-events into a tag set.
///
/// Assert inserts, Retract removes, Tombstone clears the set and leaves
/// only the tombstone tag. Returns the set and whether it is tombstoned.
pub fn fold_events<'a>(events: impl IntoIterator<Item = &'a TagEvent>) -> (BTreeSet<Tag>, bool) {
    let mut tags = BTreeSet::new();
    let mut deleted = false;
    for event in events {
        match event.action {
            TagAction::Assert => {
                tags.insert(event.tag.clone());
            }
            TagAction::Retract => {
                tags.remove(&event.tag);
            }
            TagAction::Tombstone => {
                tags.clear();
                tags.insert(event.tag.clone());
                deleted = true;
            }
        }
    }
    (tags, deleted)
}

/// Per-entity histories plus a `(timestamp, entity)` timeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemporalIndex {
    histories: HashMap<String, EntityHistory>,
    timeline: BTreeSet<(Timestamp, String)>,
}

impl TemporalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace an entity's history.
    pub fn index_entity(&mut self, entity_id: &str, history: &EntityHistory) {
        self.remove_entity(entity_id);
        for event in &history.events {
            self.timeline.insert((event.timestamp, entity_id.to_string()));
        }
        self.histories
            .insert(entity_id.to_string(), history.clone());
    }

    pub fn remove_entity(&mut self, entity_id: &str) {
        if let Some(old) = self.histories.remove(entity_id) {
            for event in &old.events {
                self.timeline.remove(&(event.timestamp, entity_id.to_string()));
            }
        }
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.histories.contains_key(entity_id)
    }

    pub fn entity_history(&self, entity_id: &str) -> Option<&EntityHistory> {
        self.histories.get(entity_id)
    }

    pub fn histories(&self) -> impl Iterator<Item = (&String, &EntityHistory)> {
        self.histories.iter()
    }

    pub fn entity_count(&self) -> usize {
        self.histories.len()
    }

    pub fn event_count(&self) -> usize {
        self.histories.values().map(|h| h.events.len()).sum()
    }

    /// All tag-events of an entity, oldest first.
    pub fn history(&self, entity_id: &str) -> IndexResult<Vec<TagEvent>> {
        Ok(self.get(entity_id)?.events.clone())
    }

    /// Tag-events grouped by the write that appended them, oldest first.
    pub fn revisions(&self, entity_id: &str) -> IndexResult<Vec<Revision>> {
        let history = self.get(entity_id)?;
        let mut start = 0usize;
        let mut revisions = Vec::with_capacity(history.writes.len());
        for write in &history.writes {
            let end = (start + write.event_count as usize).min(history.events.len());
            revisions.push(Revision {
                sequence: write.sequence,
                timestamp: write.timestamp,
                events: history.events[start..end].to_vec(),
            });
            start = end;
        }
        Ok(revisions)
    }

    /// The entity's tag set as of `at` (inclusive).
    pub fn as_of(&self, entity_id: &str, at: Timestamp) -> IndexResult<TagSnapshot> {
        let history = self.get(entity_id)?;
        match history.first_timestamp() {
            Some(first) if first <= at => {}
            _ => return Err(IndexError::NotFound(entity_id.to_string())),
        }

        let (tags, deleted) = fold_events(history.events.iter().take_while(|e| e.timestamp <= at));
        Ok(TagSnapshot {
            entity_id: entity_id.to_string(),
            at,
            tags,
            deleted,
        })
    }

    /// Tags added and removed between two instants.
    ///
    /// `from` before the entity existed compares against the empty set;
    /// `to` before the entity existed is `NotFound`.
    pub fn diff(&self, entity_id: &str, from: Timestamp, to: Timestamp) -> IndexResult<TagDiff> {
        let history = self.get(entity_id)?;
        if from > to {
            return Err(IndexError::InvalidTimeRange { from, to });
        }

        let after = self.as_of(entity_id, to)?.tags;
        let before = match history.first_timestamp() {
            Some(first) if first <= from => self.as_of(entity_id, from)?.tags,
            _ => BTreeSet::new(),
        };
        Ok(TagDiff::between(&before, &after))
    }

    /// Every tag-event with `since <= timestamp <= until`, ordered by
    /// timestamp, then entity id, then per-entity insertion order.
    pub fn changes(&self, since: Timestamp, until: Option<Timestamp>) -> IndexResult<Vec<ChangeEvent>> {
        let until = until.unwrap_or(Timestamp::MAX);
        if since > until {
            return Err(IndexError::InvalidTimeRange {
                from: since,
                to: until,
            });
        }

        let mut changes = Vec::new();
        let lower = (since, String::new());
        for (timestamp, entity_id) in self.timeline.range(lower..) {
            if *timestamp > until {
                break;
            }
            if let Some(history) = self.histories.get(entity_id) {
                changes.extend(
                    history
                        .events
                        .iter()
                        .filter(|e| e.timestamp == *timestamp)
                        .map(|event| ChangeEvent {
                            entity_id: entity_id.clone(),
                            event: event.clone(),
                        }),
                );
            }
        }
        Ok(changes)
    }

    fn get(&self, entity_id: &str) -> IndexResult<&EntityHistory> {
        self.histories
            .get(entity_id)
            .ok_or_else(|| IndexError::NotFound(entity_id.to_string()))
    }
}
