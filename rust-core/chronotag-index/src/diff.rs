// SPDX-License-Identifier: PMPL-1.0-or-later
//! Diff functionality for comparing tag sets at two instants

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tag::Tag;

/// A single membership change between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TagChange {
    /// Present after, absent before.
    Added(Tag),
    /// Present before, absent after.
    Removed(Tag),
}

impl TagChange {
    pub fn tag(&self) -> &Tag {
        match self {
            TagChange::Added(tag) | TagChange::Removed(tag) => tag,
        }
    }

    pub fn is_addition(&self) -> bool {
        matches!(self, TagChange::Added(_))
    }
}

impl fmt::Display for TagChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagChange::Added(tag) => write!(f, "+ {}", tag),
            TagChange::Removed(tag) => write!(f, "- {}", tag),
        }
    }
}

/// Set difference between an earlier and a later tag snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDiff {
    pub added: BTreeSet<Tag>,
    pub removed: BTreeSet<Tag>,
}

impl TagDiff {
    /// Compare two snapshots.
    pub fn between(before: &BTreeSet<Tag>, after: &BTreeSet<Tag>) -> Self {
        Self {
            added: after.difference(before).cloned().collect(),
            removed: before.difference(after).cloned().collect(),
        }
    }

    /// Check if there's a change
    pub fn has_change(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Individual changes, removals first.
    pub fn changes(&self) -> Vec<TagChange> {
        self.removed
            .iter()
            .cloned()
            .map(TagChange::Removed)
            .chain(self.added.iter().cloned().map(TagChange::Added))
            .collect()
    }

    /// Replay the diff on the earlier snapshot.
    pub fn apply_to(&self, before: &BTreeSet<Tag>) -> BTreeSet<Tag> {
        before
            .difference(&self.removed)
            .chain(self.added.iter())
            .cloned()
            .collect()
    }
}

impl fmt::Display for TagDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_change() {
            return write!(f, "= (no change)");
        }
        let lines: Vec<String> = self.changes().iter().map(ToString::to_string).collect();
        write!(f, "{}", lines.join("\n"))
    }
}
