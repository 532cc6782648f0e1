// SPDX-License-Identifier: PMPL-1.0-or-later
//! Tags, tag-events and timestamps
//!
//! A tag is `namespace:value`, split at the first `:`. The value may itself
//! contain `:` (for example `content:chunk:0`). Tags are never overwritten;
//! an entity's state is the fold of its ordered tag-events.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, IndexResult};

/// The tag written by a logical delete.
pub const TOMBSTONE_TAG: &str = "status:deleted";

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// Nanoseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(i64::MIN);
    pub const MAX: Timestamp = Timestamp(i64::MAX);

    /// The current wall-clock time.
    pub fn now() -> Self {
        Self::from(Utc::now())
    }

    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(self) -> i64 {
        self.0
    }

    /// The next representable instant.
    pub fn succ(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn to_datetime(self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::<Utc>::from_timestamp(secs, nanos).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    /// Instants outside the nanosecond range (years 1677..2262) saturate.
    fn from(value: DateTime<Utc>) -> Self {
        match value.timestamp_nanos_opt() {
            Some(nanos) => Self(nanos),
            None if value.timestamp() < 0 => Self::MIN,
            None => Self::MAX,
        }
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(value: Timestamp) -> Self {
        value.to_datetime()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.to_datetime()
                .to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
        )
    }
}

// ---------------------------------------------------------------------------
// Tag
// ---------------------------------------------------------------------------

/// A `namespace:value` label.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    namespace: String,
    value: String,
}

impl Tag {
    /// Parse and validate `namespace:value`.
    pub fn parse(text: &str) -> IndexResult<Self> {
        let invalid = |reason| IndexError::InvalidTag {
            tag: text.to_string(),
            reason,
        };

        let (namespace, value) = text.split_once(':').ok_or_else(|| invalid("missing ':'"))?;
        if namespace.is_empty() {
            return Err(invalid("empty namespace"));
        }
        if namespace
            .chars()
            .any(|c| c == '*' || c == '|' || c.is_whitespace())
        {
            return Err(invalid("namespace contains '*', '|' or whitespace"));
        }
        if value.is_empty() {
            return Err(invalid("empty value"));
        }

        Ok(Self {
            namespace: namespace.to_string(),
            value: value.to_string(),
        })
    }

    /// The logical-delete marker tag.
    pub fn tombstone() -> Self {
        Self {
            namespace: "status".to_string(),
            value: "deleted".to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// The `namespace:value` text used as the index key.
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.namespace, self.value)
    }

    pub fn is_tombstone(&self) -> bool {
        self.namespace == "status" && self.value == "deleted"
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.value)
    }
}

impl FromStr for Tag {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Tag-events
// ---------------------------------------------------------------------------

/// What a tag-event does to the entity's tag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagAction {
    /// Add the tag.
    Assert,
    /// Remove the tag.
    Retract,
    /// Logical delete.
    Tombstone,
}

/// A single timestamped change to an entity's tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagEvent {
    pub timestamp: Timestamp,
    pub tag: Tag,
    pub action: TagAction,
}

impl TagEvent {
    pub fn assert(timestamp: Timestamp, tag: Tag) -> Self {
        Self {
            timestamp,
            tag,
            action: TagAction::Assert,
        }
    }

    pub fn retract(timestamp: Timestamp, tag: Tag) -> Self {
        Self {
            timestamp,
            tag,
            action: TagAction::Retract,
        }
    }

    pub fn tombstone(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            tag: Tag::tombstone(),
            action: TagAction::Tombstone,
        }
    }
}

impl fmt::Display for TagEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = match self.action {
            TagAction::Assert => '+',
            TagAction::Retract => '-',
            TagAction::Tombstone => 'x',
        };
        write!(f, "{} {marker} {}", self.timestamp, self.tag)
    }
}

// ---------------------------------------------------------------------------
// Entity history
// ---------------------------------------------------------------------------

/// Boundary of one acknowledged write within an entity's event list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteMark {
    /// WAL sequence of the write.
    pub sequence: u64,
    /// Resolved write timestamp.
    pub timestamp: Timestamp,
    /// Number of tag-events the write appended.
    pub event_count: u32,
}

/// The complete ordered tag-event list of an entity, with write boundaries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityHistory {
    pub events: Vec<TagEvent>,
    pub writes: Vec<WriteMark>,
}

impl EntityHistory {
    /// Append the events of one write.
    pub fn record(&mut self, sequence: u64, timestamp: Timestamp, events: &[TagEvent]) {
        self.events.extend_from_slice(events);
        self.writes.push(WriteMark {
            sequence,
            timestamp,
            event_count: events.len() as u32,
        });
    }

    pub fn first_timestamp(&self) -> Option<Timestamp> {
        self.events.first().map(|e| e.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.events.last().map(|e| e.timestamp)
    }

    /// Sequence of the most recent write.
    pub fn last_sequence(&self) -> u64 {
        self.writes.last().map_or(0, |w| w.sequence)
    }

    /// Whether a tombstone has been written. Deletion is final.
    pub fn is_deleted(&self) -> bool {
        self.events.iter().any(|e| e.action == TagAction::Tombstone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_at_first_colon() {
        let tag = Tag::parse("content:chunk:0").unwrap();
        assert_eq!(tag.namespace(), "content");
        assert_eq!(tag.value(), "chunk:0");
        assert_eq!(tag.canonical(), "content:chunk:0");
    }

    #[test]
    fn test_parse_rejects_malformed_tags() {
        for bad in ["nocolon", ":value", "ns:", "na me:v", "ns*:v", "a|b:v", ""] {
            assert!(Tag::parse(bad).is_err(), "{bad} should be rejected");
        }
        assert!(Tag::parse("rbac:perm:*:*").is_ok());
    }

    #[test]
    fn test_tombstone_tag() {
        assert_eq!(Tag::tombstone().canonical(), TOMBSTONE_TAG);
        assert!(Tag::parse(TOMBSTONE_TAG).unwrap().is_tombstone());
    }

    #[test]
    fn test_timestamp_datetime_conversion() {
        let now = Utc::now();
        let ts = Timestamp::from(now);
        assert_eq!(ts.to_datetime(), now);
        assert!(ts < ts.succ());
        assert_eq!(Timestamp::MAX.succ(), Timestamp::MAX);
    }

    #[test]
    fn test_history_deleted_flag() {
        let doc = Tag::parse("type:doc").unwrap();
        let mut history = EntityHistory::default();
        history.record(1, Timestamp(1), &[TagEvent::assert(Timestamp(1), doc)]);
        assert!(!history.is_deleted());

        history.record(2, Timestamp(2), &[TagEvent::tombstone(Timestamp(2))]);
        assert!(history.is_deleted());
        assert_eq!(history.last_sequence(), 2);
        assert_eq!(history.first_timestamp(), Some(Timestamp(1)));
        assert_eq!(history.writes.len(), 2);
    }
}
