// SPDX-License-Identifier: PMPL-1.0-or-later
//! Inverted tag index
//!
//! Maps each canonical `namespace:value` tag to the set of entities that
//! currently carry it. The index is a pure function of the entities'
//! tag-events: re-indexing an entity from its full event list always yields
//! the same postings, so the whole index can be rebuilt by replay.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::IndexResult;
use crate::tag::{Tag, TagAction, TagEvent};

/// One term of a tag query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagPattern {
    /// Matches one canonical tag.
    Exact(String),
    /// Matches every canonical tag starting with this text.
    Prefix(String),
}

impl TagPattern {
    /// Parse a query term. A trailing `*` makes it a prefix match.
    pub fn parse(text: &str) -> IndexResult<Self> {
        match text.strip_suffix('*') {
            Some(prefix) => Ok(Self::Prefix(prefix.to_string())),
            None => Ok(Self::Exact(Tag::parse(text)?.canonical())),
        }
    }

    pub fn matches(&self, canonical: &str) -> bool {
        match self {
            Self::Exact(tag) => tag == canonical,
            Self::Prefix(prefix) => canonical.starts_with(prefix.as_str()),
        }
    }
}

/// Postings plus the current tag set of every indexed entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagIndex {
    postings: BTreeMap<String, BTreeSet<String>>,
    current: HashMap<String, BTreeSet<String>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one tag-event to an entity's memberships.
    ///
    /// Assert adds membership and Retract removes it. Tombstone adds the
    /// tombstone tag and leaves the other memberships in place; readers
    /// filter deleted entities.
    pub fn apply(&mut self, entity_id: &str, event: &TagEvent) {
        let canonical = event.tag.canonical();
        match event.action {
            TagAction::Assert | TagAction::Tombstone => self.insert(entity_id, canonical),
            TagAction::Retract => self.remove(entity_id, &canonical),
        }
    }

    /// Recompute an entity's memberships from its complete event list.
    pub fn index_entity(&mut self, entity_id: &str, events: &[TagEvent]) {
        self.remove_entity(entity_id);
        self.current.insert(entity_id.to_string(), BTreeSet::new());
        for event in events {
            self.apply(entity_id, event);
        }
    }

    /// Drop every membership of an entity.
    pub fn remove_entity(&mut self, entity_id: &str) {
        let Some(tags) = self.current.remove(entity_id) else {
            return;
        };
        for tag in tags {
            if let Some(ids) = self.postings.get_mut(&tag) {
                ids.remove(entity_id);
                if ids.is_empty() {
                    self.postings.remove(&tag);
                }
            }
        }
    }

    /// Entities matching every pattern, sorted by id. No patterns match
    /// nothing.
    pub fn query(&self, patterns: &[TagPattern]) -> Vec<String> {
        let mut sets: Vec<BTreeSet<&str>> = patterns.iter().map(|p| self.matching(p)).collect();
        if sets.is_empty() {
            return Vec::new();
        }

        sets.sort_by_key(BTreeSet::len);
        let (smallest, rest) = sets.split_at(1);
        smallest[0]
            .iter()
            .filter(|id| rest.iter().all(|set| set.contains(*id)))
            .map(|id| id.to_string())
            .collect()
    }

    /// Parse query terms and run `query`.
    pub fn query_text<S: AsRef<str>>(&self, terms: &[S]) -> IndexResult<Vec<String>> {
        let patterns = terms
            .iter()
            .map(|t| TagPattern::parse(t.as_ref()))
            .collect::<IndexResult<Vec<_>>>()?;
        Ok(self.query(&patterns))
    }

    /// The entity's current canonical tags.
    pub fn tags_of(&self, entity_id: &str) -> Option<&BTreeSet<String>> {
        self.current.get(entity_id)
    }

    pub fn has_tag(&self, entity_id: &str, canonical: &str) -> bool {
        self.current
            .get(entity_id)
            .is_some_and(|tags| tags.contains(canonical))
    }

    /// Every namespace with at least one member, sorted.
    pub fn namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = Vec::new();
        for tag in self.postings.keys() {
            if let Some((namespace, _)) = tag.split_once(':') {
                if namespaces.last().map(String::as_str) != Some(namespace) {
                    namespaces.push(namespace.to_string());
                }
            }
        }
        namespaces
    }

    /// Every value present in a namespace, sorted.
    pub fn values(&self, namespace: &str) -> Vec<String> {
        let prefix = format!("{namespace}:");
        self.postings
            .range(prefix.clone()..)
            .take_while(|(tag, _)| tag.starts_with(&prefix))
            .map(|(tag, _)| tag[prefix.len()..].to_string())
            .collect()
    }

    /// Number of distinct tags with at least one member.
    pub fn tag_count(&self) -> usize {
        self.postings.len()
    }

    /// Number of indexed entities.
    pub fn entity_count(&self) -> usize {
        self.current.len()
    }

    fn matching(&self, pattern: &TagPattern) -> BTreeSet<&str> {
        match pattern {
            TagPattern::Exact(tag) => self
                .postings
                .get(tag)
                .map(|ids| ids.iter().map(String::as_str).collect())
                .unwrap_or_default(),
            TagPattern::Prefix(prefix) => self
                .postings
                .range(prefix.clone()..)
                .take_while(|(tag, _)| tag.starts_with(prefix.as_str()))
                .flat_map(|(_, ids)| ids.iter().map(String::as_str))
                .collect(),
        }
    }

    fn insert(&mut self, entity_id: &str, canonical: String) {
        self.postings
            .entry(canonical.clone())
            .or_default()
            .insert(entity_id.to_string());
        self.current
            .entry(entity_id.to_string())
            .or_default()
            .insert(canonical);
    }

    fn remove(&mut self, entity_id: &str, canonical: &str) {
        if let Some(ids) = self.postings.get_mut(canonical) {
            ids.remove(entity_id);
            if ids.is_empty() {
                self.postings.remove(canonical);
            }
        }
        if let Some(tags) = self.current.get_mut(entity_id) {
            tags.remove(canonical);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::Timestamp;

    fn assert_event(ts: i64, tag: &str) -> TagEvent {
        TagEvent::assert(Timestamp(ts), Tag::parse(tag).unwrap())
    }

    fn sample() -> TagIndex {
        let mut index = TagIndex::new();
        index.index_entity(
            "a",
            &[assert_event(1, "type:doc"), assert_event(1, "priority:high")],
        );
        index.index_entity(
            "b",
            &[assert_event(2, "type:doc"), assert_event(2, "priority:low")],
        );
        index.index_entity("c", &[assert_event(3, "type:image")]);
        index
    }

    #[test]
    fn test_and_query() {
        let index = sample();
        assert_eq!(index.query_text(&["type:doc"]).unwrap(), vec!["a", "b"]);
        assert_eq!(
            index.query_text(&["type:doc", "priority:high"]).unwrap(),
            vec!["a"]
        );
        assert!(index.query_text(&["type:doc", "type:image"]).unwrap().is_empty());
    }

    #[test]
    fn test_empty_query_matches_nothing() {
        let index = sample();
        assert!(index.query(&[]).is_empty());
    }

    #[test]
    fn test_wildcard_matches_namespace() {
        let index = sample();
        assert_eq!(index.query_text(&["priority:*"]).unwrap(), vec!["a", "b"]);
        assert_eq!(index.query_text(&["type:d*"]).unwrap(), vec!["a", "b"]);
        assert_eq!(
            index.query_text(&["type:*", "priority:*"]).unwrap(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_retract_removes_membership() {
        let mut index = sample();
        index.apply(
            "a",
            &TagEvent::retract(Timestamp(5), Tag::parse("priority:high").unwrap()),
        );
        assert!(index.query_text(&["priority:high"]).unwrap().is_empty());
        assert_eq!(index.values("priority"), vec!["low"]);
    }

    #[test]
    fn test_tombstone_keeps_other_memberships() {
        let mut index = sample();
        index.apply("a", &TagEvent::tombstone(Timestamp(9)));
        assert_eq!(index.query_text(&["type:doc"]).unwrap(), vec!["a", "b"]);
        assert!(index.has_tag("a", crate::tag::TOMBSTONE_TAG));
    }

    #[test]
    fn test_reindex_is_idempotent() {
        let mut index = sample();
        let events = [assert_event(1, "type:doc"), assert_event(1, "priority:high")];
        index.index_entity("a", &events);
        index.index_entity("a", &events);
        assert_eq!(index, sample());
    }

    #[test]
    fn test_namespace_listing() {
        let index = sample();
        assert_eq!(index.namespaces(), vec!["priority", "type"]);
        assert_eq!(index.values("type"), vec!["doc", "image"]);
        assert_eq!(index.tag_count(), 4);
        assert_eq!(index.entity_count(), 3);
    }

    #[test]
    fn test_invalid_query_term() {
        assert!(sample().query_text(&["bogus"]).is_err());
    }
}
