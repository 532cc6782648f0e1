// SPDX-License-Identifier: PMPL-1.0-or-later
//! Single writer lane
//!
//! One `tokio::sync::Mutex` guards the WAL writer together with the writer
//! catalog, so WAL sequence order is acknowledgment order. The catalog holds
//! what validation needs about every entity (last event timestamp and
//! whether it is tombstoned) and is updated as soon as a write is durable,
//! which keeps validation correct while the `wal_only` applier lags.

use std::collections::HashMap;
use std::sync::Arc;

use chronotag_index::{Indexes, TagAction, TagEvent, Timestamp};
use chronotag_wal::{WalEntry, WalWriter};
use tokio::sync::mpsc;

use crate::apply::{apply, ApplyJob};
use crate::config::WalMode;
use crate::engine::Core;
use crate::entity::{Mutation, TagWrite};
use crate::error::{EngineError, EngineResult};

/// What the writer lane knows about one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CatalogEntry {
    pub last_timestamp: Timestamp,
    pub deleted: bool,
}

/// Build the catalog from fully built indexes.
pub(crate) fn catalog_from_indexes(indexes: &Indexes) -> HashMap<String, CatalogEntry> {
    indexes
        .temporal
        .histories()
        .map(|(id, history)| {
            (
                id.clone(),
                CatalogEntry {
                    last_timestamp: history.last_timestamp().unwrap_or_default(),
                    deleted: history.is_deleted(),
                },
            )
        })
        .collect()
}

pub(crate) struct WriterLane {
    pub wal: WalWriter,
    mode: WalMode,
    catalog: HashMap<String, CatalogEntry>,
    /// Last timestamp handed out by `stamp`.
    clock: Timestamp,
    last_acknowledged: u64,
    applier: Option<mpsc::Sender<ApplyJob>>,
}

impl WriterLane {
    pub fn new(wal: WalWriter, mode: WalMode, catalog: HashMap<String, CatalogEntry>) -> Self {
        let last_acknowledged = wal.last_sequence();
        let mut lane = Self {
            wal,
            mode,
            catalog: HashMap::new(),
            clock: Timestamp::MIN,
            last_acknowledged,
            applier: None,
        };
        lane.reset_catalog(catalog);
        lane
    }

    pub fn reset_catalog(&mut self, catalog: HashMap<String, CatalogEntry>) {
        let latest = catalog.values().map(|e| e.last_timestamp).max();
        if let Some(latest) = latest {
            self.clock = self.clock.max(latest);
        }
        self.catalog = catalog;
    }

    pub fn set_applier(&mut self, sender: mpsc::Sender<ApplyJob>) {
        self.applier = Some(sender);
    }

    /// Detach the applier. Dropping the returned sender lets it drain and
    /// stop.
    pub fn take_applier(&mut self) -> Option<mpsc::Sender<ApplyJob>> {
        self.applier.take()
    }

    /// Highest sequence acknowledged to a caller.
    pub fn last_acknowledged(&self) -> u64 {
        self.last_acknowledged
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.catalog.contains_key(entity_id)
    }

    /// The catalog entry of a live (not tombstoned) entity.
    pub fn live(&self, entity_id: &str) -> EngineResult<CatalogEntry> {
        match self.catalog.get(entity_id) {
            Some(entry) if !entry.deleted => Ok(*entry),
            _ => Err(EngineError::NotFound(entity_id.to_string())),
        }
    }

    /// A write timestamp from the monotonic clock, no earlier than `floor`.
    pub fn stamp(&mut self, floor: Option<Timestamp>) -> Timestamp {
        self.clock = self.clock.max(Timestamp::now());
        floor.map_or(self.clock, |floor| self.clock.max(floor))
    }

    /// Turn caller tag writes into tag-events, checking that timestamps
    /// never go back past `last` or each other.
    ///
    /// Returns the write timestamp (that of the last event, or a fresh stamp
    /// for a write without events) and the events.
    pub fn resolve_events(
        &mut self,
        entity_id: &str,
        writes: Vec<TagWrite>,
        last: Option<Timestamp>,
    ) -> EngineResult<(Timestamp, Vec<TagEvent>)> {
        let mut previous = last;
        let mut default: Option<Timestamp> = None;
        let mut events = Vec::with_capacity(writes.len());

        for write in writes {
            if write.action == TagAction::Tombstone || write.tag.is_tombstone() {
                return Err(EngineError::InvalidTag {
                    tag: write.tag.canonical(),
                    reason: "tombstones are written by delete_entity",
                });
            }

            let timestamp = match (write.timestamp, default) {
                (Some(explicit), _) => explicit,
                (None, Some(stamp)) if previous.map_or(true, |p| stamp >= p) => stamp,
                (None, _) => {
                    let stamp = self.stamp(previous);
                    default = Some(stamp);
                    stamp
                }
            };
            if let Some(previous) = previous.filter(|p| timestamp < *p) {
                return Err(EngineError::InvalidTimestamp {
                    entity_id: entity_id.to_string(),
                    timestamp,
                    last: previous,
                });
            }
            previous = Some(timestamp);
            events.push(TagEvent {
                timestamp,
                tag: write.tag,
                action: write.action,
            });
        }

        let write_timestamp = match events.last() {
            Some(event) => event.timestamp,
            None => self.stamp(last),
        };
        Ok((write_timestamp, events))
    }

    /// Make `mutation` durable, then apply it (standard mode) or hand it
    /// to the applier (`wal_only`). Returns the WAL sequence.
    pub async fn submit(
        &mut self,
        core: &Arc<Core>,
        entity_id: &str,
        mutation: Mutation,
    ) -> EngineResult<u64> {
        let entry = WalEntry::mutation(mutation.operation(), entity_id, mutation.encode()?);
        let sequence = self.wal.append(entry).map_err(EngineError::WalWriteFailure)?;
        core.metrics.record_wal_append();
        self.track(entity_id, &mutation);

        match self.mode {
            WalMode::Standard => {
                if let Err(err) = apply(core, sequence, entity_id, &mutation) {
                    core.mark_corrupt(&err);
                    return Err(err);
                }
            }
            WalMode::WalOnly => {
                let sender = self
                    .applier
                    .as_ref()
                    .ok_or_else(|| EngineError::NotReady(core.state()))?;
                let job = ApplyJob {
                    sequence,
                    entity_id: entity_id.to_string(),
                    mutation,
                };
                sender
                    .send(job)
                    .await
                    .map_err(|_| EngineError::NotReady(core.state()))?;
            }
        }

        self.last_acknowledged = sequence;
        Ok(sequence)
    }

    fn track(&mut self, entity_id: &str, mutation: &Mutation) {
        match mutation {
            Mutation::Create { events, .. } => {
                let last_timestamp = events.last().map(|e| e.timestamp).unwrap_or_default();
                self.catalog.insert(
                    entity_id.to_string(),
                    CatalogEntry {
                        last_timestamp,
                        deleted: false,
                    },
                );
            }
            Mutation::Update { events, .. } => {
                if let (Some(entry), Some(event)) = (self.catalog.get_mut(entity_id), events.last()) {
                    entry.last_timestamp = entry.last_timestamp.max(event.timestamp);
                }
            }
            Mutation::Delete { timestamp } => {
                if let Some(entry) = self.catalog.get_mut(entity_id) {
                    entry.last_timestamp = entry.last_timestamp.max(*timestamp);
                    entry.deleted = true;
                }
            }
        }
    }
}
