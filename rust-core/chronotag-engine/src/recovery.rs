// SPDX-License-Identifier: PMPL-1.0-or-later
//! Recovery and repair
//!
//! Startup walks `Starting → ReplayingWal → RebuildingIndexes → Ready`.
//! The store is the source of truth for entity state, the WAL fills in what
//! the store had not yet absorbed and the indexes are a disposable
//! projection of the store, loaded from `index.snap` when it can be trusted
//! and rebuilt otherwise. Mid-file store corruption parks the engine in
//! `Corrupt` until [`repair`] runs.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chronotag_index::{IndexSnapshot, Indexes};
use chronotag_store::{CompactReport, ContentChunker, EntityStore};
use chronotag_wal::{WalReader, WalWriter};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::apply::write_revision;
use crate::config::EngineConfig;
use crate::engine::Core;
use crate::entity::Mutation;
use crate::error::{EngineError, EngineResult};
use crate::lock::DataDirLock;

/// Lifecycle state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Starting,
    ReplayingWal,
    RebuildingIndexes,
    Ready,
    /// Durable state failed validation. Only repair, stats and shutdown
    /// are served.
    Corrupt,
    /// `shutdown` has completed.
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Starting => "starting",
            EngineState::ReplayingWal => "replaying_wal",
            EngineState::RebuildingIndexes => "rebuilding_indexes",
            EngineState::Ready => "ready",
            EngineState::Corrupt => "corrupt",
            EngineState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Where the in-memory indexes came from at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum IndexSource {
    /// Loaded from `index.snap`, then caught up from the store.
    Snapshot { watermark: u64, caught_up: usize },
    /// Rebuilt from every entity in the store.
    Rebuilt { reason: String },
    /// Not built because the store needs repair first.
    NotBuilt,
}

/// What startup recovery did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub wal_truncated_bytes: u64,
    pub wal_removed_segments: usize,
    pub store_truncated_bytes: u64,
    pub store_corrupt_records: usize,
    /// WAL entries applied to the store.
    pub replayed: u64,
    /// WAL entries that could not be applied.
    pub skipped: u64,
    pub index_source: IndexSource,
    /// Store watermark once recovery finished.
    pub watermark: u64,
}

/// What `repair_index` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    pub corrupt_records: usize,
    pub torn_bytes: u64,
    /// Present when the data file was rewritten to drop damaged bytes.
    pub compacted: Option<CompactReport>,
    pub replayed: u64,
    pub skipped: u64,
    pub entities: usize,
    pub watermark: u64,
}

/// Outcome of `verify_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IndexCheck {
    Consistent { entities: usize },
    /// The indexes had diverged from the store and were repaired.
    Repaired { reason: String, report: RepairReport },
}

/// Lock the data directory, open the store and WAL under `config`, replay
/// and build the indexes.
///
/// The returned core holds the directory lock and is `Ready`, or `Corrupt` when the store holds damaged
/// records before its tail.
pub(crate) fn recover(config: EngineConfig) -> EngineResult<(Arc<Core>, WalWriter, RecoveryReport)> {
    config.validate()?;
    info!(data_dir = %config.data_dir.display(), mode = %config.wal_mode, "Recovering engine");

    let dir_lock = DataDirLock::acquire(config.data_dir())?;
    let store = Arc::new(EntityStore::open(config.store_dir())?);
    let chunker = ContentChunker::new(Arc::clone(&store), config.chunk_config())?;
    let mut wal = WalWriter::open_with_max_size(config.wal_dir(), config.wal_sync, config.wal_segment_size)?;
    let open = store.open_report().clone();
    let tail = wal.tail_repair();

    let core = Arc::new(Core::new(config, store, chunker, dir_lock));
    let mut report = RecoveryReport {
        wal_truncated_bytes: tail.truncated_bytes,
        wal_removed_segments: tail.removed_segments,
        store_truncated_bytes: open.truncated_bytes,
        store_corrupt_records: open.corrupt.len(),
        replayed: 0,
        skipped: 0,
        index_source: IndexSource::NotBuilt,
        watermark: core.store.watermark(),
    };

    if !open.corrupt.is_empty() {
        for span in &open.corrupt {
            warn!(offset = span.offset, length = span.length, reason = %span.reason, "Corrupt store record");
        }
        core.metrics.record_skipped(open.corrupt.len() as u64);
        wal.advance_to(core.store.watermark() + 1)?;
        core.publish_applied(core.store.watermark());
        core.set_state(EngineState::Corrupt);
        return Ok((core, wal, report));
    }

    core.set_state(EngineState::ReplayingWal);
    let from = core.store.watermark() + 1;
    let (replayed, skipped) = replay_wal(&core.store, &core.chunker, wal.wal_dir(), from)?;
    report.replayed = replayed;
    report.skipped = skipped;
    core.metrics.record_replayed(replayed);
    core.metrics.record_skipped(skipped);
    wal.advance_to(core.store.watermark() + 1)?;

    core.set_state(EngineState::RebuildingIndexes);
    let (indexes, source) = load_indexes(&core.config.snapshot_path(), &core.store)?;
    report.index_source = source;
    *core.write_indexes()? = indexes;

    report.watermark = core.store.watermark();
    core.publish_applied(wal.last_sequence().max(report.watermark));
    core.set_state(EngineState::Ready);
    info!(
        replayed = report.replayed,
        skipped = report.skipped,
        watermark = report.watermark,
        "Recovery complete"
    );
    Ok((core, wal, report))
}

/// Apply every mutation entry with sequence `>= from` to the store.
///
/// Entries that cannot be applied (damaged payloads, revisions whose
/// predecessor is unreadable) are logged and counted, never fatal.
/// Returns `(replayed, skipped)`.
pub(crate) fn replay_wal(
    store: &EntityStore,
    chunker: &ContentChunker,
    wal_dir: &Path,
    from: u64,
) -> EngineResult<(u64, u64)> {
    let reader = WalReader::open(wal_dir)?;
    let mut replayed = 0u64;
    let mut skipped = 0u64;

    for entry in reader.replay_from(from)? {
        let entry = entry?;
        if !entry.operation.is_mutation() {
            continue;
        }
        let outcome = Mutation::decode(entry.operation, &entry.payload).and_then(|mutation| {
            write_revision(store, chunker, entry.sequence, &entry.entity_id, &mutation)
        });
        match outcome {
            Ok(Some(_)) => replayed += 1,
            Ok(None) => {}
            Err(
                err @ (EngineError::NotFound(_)
                | EngineError::DuplicateId(_)
                | EngineError::InvalidMutation(_)
                | EngineError::Encoding(_)
                | EngineError::CorruptRecord { .. }
                | EngineError::CorruptContent { .. }),
            ) => {
                warn!(
                    sequence = entry.sequence,
                    entity_id = %entry.entity_id,
                    error = %err,
                    "Skipping WAL entry"
                );
                skipped += 1;
            }
            Err(err) => return Err(err),
        }
    }

    if replayed > 0 || skipped > 0 {
        info!(from, replayed, skipped, "Replayed WAL");
    }
    Ok((replayed, skipped))
}

/// Load the index snapshot if it can be trusted, else rebuild.
fn load_indexes(snapshot_path: &Path, store: &EntityStore) -> EngineResult<(Indexes, IndexSource)> {
    let watermark = store.watermark();
    let reason = match IndexSnapshot::load(snapshot_path) {
        Ok(Some(snapshot)) if snapshot.watermark <= watermark => {
            let snapshot_watermark = snapshot.watermark;
            let mut indexes = Indexes::from_snapshot(snapshot);
            let mut caught_up = 0;
            for (entity_id, locator) in store.locators()? {
                if locator.sequence <= snapshot_watermark {
                    continue;
                }
                match store.get(&entity_id) {
                    Ok(entity) => {
                        indexes.index_entity(&entity_id, &entity.history);
                        caught_up += 1;
                    }
                    Err(err) if err.is_corruption() => {
                        warn!(entity_id = %entity_id, error = %err, "Skipping unreadable entity");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            indexes.advance_watermark(watermark);
            info!(snapshot_watermark, caught_up, watermark, "Loaded index snapshot");
            return Ok((
                indexes,
                IndexSource::Snapshot {
                    watermark: snapshot_watermark,
                    caught_up,
                },
            ));
        }
        Ok(Some(snapshot)) => format!(
            "snapshot watermark {} is ahead of store watermark {watermark}",
            snapshot.watermark
        ),
        Ok(None) => "no snapshot".to_string(),
        Err(err) => err.to_string(),
    };

    warn!(error = %EngineError::IndexStale(reason.clone()), "Rebuilding indexes from store");
    let (indexes, _) = rebuild_from_store(store)?;
    Ok((indexes, IndexSource::Rebuilt { reason }))
}

/// Build both indexes from the latest revision of every entity.
/// Returns the indexes and the number of unreadable entities skipped.
pub(crate) fn rebuild_from_store(store: &EntityStore) -> EngineResult<(Indexes, u64)> {
    let mut indexes = Indexes::new();
    let mut skipped = 0u64;
    for (entity_id, _) in store.locators()? {
        match store.get(&entity_id) {
            Ok(entity) => indexes.index_entity(&entity_id, &entity.history),
            Err(err) if err.is_corruption() => {
                warn!(entity_id = %entity_id, error = %err, "Skipping unreadable entity");
                skipped += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
    indexes.advance_watermark(store.watermark());
    Ok((indexes, skipped))
}

/// Rebuild store locators and both indexes from a validating scan.
///
/// Damaged records are dropped (and the file compacted so they stay
/// dropped), the whole readable WAL is replayed over the surviving
/// revisions, the indexes are rebuilt from the result and a fresh snapshot
/// is persisted. The caller holds the writer lane and has drained the
/// applier. `wal_last` is the last sequence in the log.
pub(crate) fn repair(core: &Core, wal_dir: &Path, wal_last: u64) -> EngineResult<RepairReport> {
    info!("Repairing store and indexes");
    let scan = core.store.scan()?;
    for span in &scan.corrupt {
        warn!(offset = span.offset, length = span.length, reason = %span.reason, "Discarding corrupt record");
    }
    core.store.adopt_scan(&scan)?;

    let compacted = if !scan.corrupt.is_empty() || scan.torn_tail > 0 {
        Some(core.store.compact()?)
    } else {
        None
    };

    let (replayed, skipped) = replay_wal(&core.store, &core.chunker, wal_dir, 0)?;
    let (indexes, unreadable) = rebuild_from_store(&core.store)?;
    core.store.sync()?;
    indexes.to_snapshot().persist(&core.config.snapshot_path())?;

    let report = RepairReport {
        corrupt_records: scan.corrupt.len(),
        torn_bytes: scan.torn_tail,
        compacted,
        replayed,
        skipped: skipped + unreadable,
        entities: indexes.temporal.entity_count(),
        watermark: indexes.watermark(),
    };
    *core.write_indexes()? = indexes;

    core.metrics.record_replayed(replayed);
    core.metrics.record_skipped(scan.corrupt.len() as u64 + report.skipped);
    core.metrics.record_repair();
    core.publish_applied(wal_last.max(report.watermark));
    core.set_state(EngineState::Ready);
    info!(
        corrupt = report.corrupt_records,
        replayed = report.replayed,
        entities = report.entities,
        "Repair complete"
    );
    Ok(report)
}

/// Compare the live indexes with a rebuild from the store. Returns a
/// description of the divergence, or `None` when they agree.
pub(crate) fn verify(core: &Core) -> EngineResult<Option<String>> {
    let (expected, unreadable) = rebuild_from_store(&core.store)?;
    let live = core.read_indexes()?;
    if unreadable == 0 && live.same_content(&expected) {
        return Ok(None);
    }

    let mut missing = 0usize;
    let mut differing = 0usize;
    for (entity_id, history) in expected.temporal.histories() {
        match live.temporal.entity_history(entity_id) {
            None => missing += 1,
            Some(found) if found != history => differing += 1,
            Some(_) => {}
        }
    }
    let extra = live
        .temporal
        .histories()
        .filter(|(id, _)| !expected.temporal.contains(id))
        .count();
    let tag_mismatch = live.tags != expected.tags;

    Ok(Some(format!(
        "{missing} missing, {differing} differing, {extra} unknown entities, \
         {unreadable} unreadable in store, tag index {}",
        if tag_mismatch { "differs" } else { "matches" }
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronotag_index::{Tag, TagEvent, Timestamp};
    use chronotag_store::{ChunkConfig, StoredEntity};
    use chronotag_wal::{SyncMode, WalEntry};
    use tempfile::TempDir;

    fn create(ts: i64, tag: &str) -> Mutation {
        Mutation::Create {
            timestamp: Timestamp(ts),
            events: vec![TagEvent::assert(Timestamp(ts), Tag::parse(tag).unwrap())],
            content: None,
        }
    }

    #[test]
    fn test_replay_skips_entries_already_in_store() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(EntityStore::open(dir.path().join("store")).unwrap());
        let chunker = ContentChunker::new(Arc::clone(&store), ChunkConfig::default()).unwrap();
        let wal_dir = dir.path().join("wal");
        let mut wal = WalWriter::open(&wal_dir, SyncMode::Fsync).unwrap();

        for (id, ts) in [("a", 1), ("b", 2)] {
            let mutation = create(ts, "type:doc");
            let entry = WalEntry::mutation(mutation.operation(), id, mutation.encode().unwrap());
            let seq = wal.append(entry).unwrap();
            if id == "a" {
                write_revision(&store, &chunker, seq, id, &mutation).unwrap();
            }
        }

        let (replayed, skipped) = replay_wal(&store, &chunker, &wal_dir, 0).unwrap();
        assert_eq!((replayed, skipped), (1, 0));
        assert_eq!(store.watermark(), 2);
    }

    #[test]
    fn test_replay_skips_undecodable_payload() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(EntityStore::open(dir.path().join("store")).unwrap());
        let chunker = ContentChunker::new(Arc::clone(&store), ChunkConfig::default()).unwrap();
        let wal_dir = dir.path().join("wal");
        let mut wal = WalWriter::open(&wal_dir, SyncMode::Fsync).unwrap();
        wal.append(WalEntry::mutation(
            chronotag_wal::WalOperation::Create,
            "x",
            vec![0xff, 0xff, 0xff],
        ))
        .unwrap();

        let (replayed, skipped) = replay_wal(&store, &chunker, &wal_dir, 1).unwrap();
        assert_eq!((replayed, skipped), (0, 1));
    }

    #[test]
    fn test_snapshot_ahead_of_store_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        let store = EntityStore::open(dir.path().join("store")).unwrap();
        let mut entity = StoredEntity::new("a");
        entity
            .history
            .record(1, Timestamp(1), &[TagEvent::assert(Timestamp(1), Tag::parse("type:doc").unwrap())]);
        store.put(&entity, 1).unwrap();

        let mut ahead = Indexes::new();
        ahead.advance_watermark(9);
        let path = dir.path().join("index.snap");
        ahead.to_snapshot().persist(&path).unwrap();

        let (indexes, source) = load_indexes(&path, &store).unwrap();
        assert!(matches!(source, IndexSource::Rebuilt { .. }));
        assert_eq!(indexes.tags.query_text(&["type:doc"]).unwrap(), vec!["a"]);
        assert_eq!(indexes.watermark(), 1);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(EngineState::ReplayingWal.to_string(), "replaying_wal");
        assert_eq!(EngineState::Corrupt.to_string(), "corrupt");
    }
}
