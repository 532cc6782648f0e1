// SPDX-License-Identifier: PMPL-1.0-or-later
//! Mutation application
//!
//! Every state change reaches the store and indexes through
//! [`write_revision`]: the writer lane calls it in standard mode, the
//! background applier in `wal_only` mode and recovery during replay.

use std::sync::Arc;

use chronotag_index::TagEvent;
use chronotag_store::{ContentChunker, EntityStore, StoredEntity};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::engine::Core;
use crate::entity::Mutation;
use crate::error::{EngineError, EngineResult};

/// An acknowledged mutation waiting for the applier.
#[derive(Debug)]
pub(crate) struct ApplyJob {
    pub sequence: u64,
    pub entity_id: String,
    pub mutation: Mutation,
}

/// Write the store revision produced by `mutation` at WAL `sequence`.
///
/// Returns `None` when the store already holds that sequence or a later
/// one for the entity, which makes replay idempotent.
pub(crate) fn write_revision(
    store: &EntityStore,
    chunker: &ContentChunker,
    sequence: u64,
    entity_id: &str,
    mutation: &Mutation,
) -> EngineResult<Option<StoredEntity>> {
    let existing = store.locator(entity_id)?;
    if existing.is_some_and(|locator| locator.sequence >= sequence) {
        return Ok(None);
    }

    let entity = match mutation {
        Mutation::Create {
            timestamp,
            events,
            content,
        } => {
            if existing.is_some() {
                return Err(EngineError::DuplicateId(entity_id.to_string()));
            }
            let mut entity = StoredEntity::new(entity_id);
            entity.history.record(sequence, *timestamp, events);
            if let Some(bytes) = content {
                entity.content = chunker.store(entity_id, bytes, sequence)?;
            }
            store.put(&entity, sequence)?;
            entity
        }
        Mutation::Update {
            timestamp,
            events,
            content,
        } => {
            let mut entity = store.get(entity_id)?;
            if entity.is_deleted() {
                return Err(EngineError::NotFound(entity_id.to_string()));
            }
            entity.history.record(sequence, *timestamp, events);
            if let Some(bytes) = content {
                entity.content = chunker.store(entity_id, bytes, sequence)?;
            }
            store.put(&entity, sequence)?;
            entity
        }
        Mutation::Delete { timestamp } => {
            if existing.is_none() {
                return Err(EngineError::NotFound(entity_id.to_string()));
            }
            store.delete(entity_id, TagEvent::tombstone(*timestamp), sequence)?
        }
    };
    Ok(Some(entity))
}

/// Apply one acknowledged mutation to the store and both indexes, then
/// publish the applied sequence.
pub(crate) fn apply(core: &Core, sequence: u64, entity_id: &str, mutation: &Mutation) -> EngineResult<()> {
    if let Some(entity) = write_revision(&core.store, &core.chunker, sequence, entity_id, mutation)? {
        core.write_indexes()?.index_entity(entity_id, &entity.history);
    }
    core.publish_applied(sequence);
    debug!(sequence, entity_id, operation = ?mutation.operation(), "Applied mutation");
    Ok(())
}

/// Start the `wal_only` applier. It is the only mutator of store and index
/// state while it runs, applies jobs in sequence order and stops at the
/// first failure, leaving the engine `Corrupt` until repaired.
pub(crate) fn spawn_applier(core: Arc<Core>) -> (mpsc::Sender<ApplyJob>, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::channel::<ApplyJob>(core.config.applier_queue_depth);
    let handle = tokio::spawn(async move {
        while let Some(job) = receiver.recv().await {
            if let Err(err) = apply(&core, job.sequence, &job.entity_id, &job.mutation) {
                error!(
                    sequence = job.sequence,
                    entity_id = %job.entity_id,
                    error = %err,
                    "Applier failed, stopping"
                );
                core.mark_corrupt(&err);
                break;
            }
        }
        debug!(applied = core.applied(), "Applier stopped");
    });
    (sender, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronotag_index::{Tag, Timestamp};
    use chronotag_store::{ChunkConfig, StoredContent};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<EntityStore>, ContentChunker) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(EntityStore::open(dir.path()).unwrap());
        let chunker = ContentChunker::new(
            Arc::clone(&store),
            ChunkConfig {
                threshold: 8,
                chunk_size: 8,
            },
        )
        .unwrap();
        (dir, store, chunker)
    }

    fn create(ts: i64, tag: &str, content: Option<&[u8]>) -> Mutation {
        Mutation::Create {
            timestamp: Timestamp(ts),
            events: vec![TagEvent::assert(Timestamp(ts), Tag::parse(tag).unwrap())],
            content: content.map(<[u8]>::to_vec),
        }
    }

    #[test]
    fn test_replaying_an_applied_sequence_is_a_no_op() {
        let (_dir, store, chunker) = setup();
        let mutation = create(1, "type:doc", None);
        assert!(write_revision(&store, &chunker, 1, "e", &mutation).unwrap().is_some());
        assert!(write_revision(&store, &chunker, 1, "e", &mutation).unwrap().is_none());
        assert_eq!(store.get("e").unwrap().history.writes.len(), 1);
    }

    #[test]
    fn test_create_of_existing_entity_is_duplicate() {
        let (_dir, store, chunker) = setup();
        write_revision(&store, &chunker, 1, "e", &create(1, "type:doc", None)).unwrap();
        assert!(matches!(
            write_revision(&store, &chunker, 2, "e", &create(2, "type:img", None)),
            Err(EngineError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_update_chunks_large_content_at_its_sequence() {
        let (_dir, store, chunker) = setup();
        write_revision(&store, &chunker, 1, "e", &create(1, "type:doc", Some(b"tiny"))).unwrap();
        let update = Mutation::Update {
            timestamp: Timestamp(2),
            events: Vec::new(),
            content: Some(b"a payload well past eight bytes".to_vec()),
        };
        let entity = write_revision(&store, &chunker, 2, "e", &update).unwrap().unwrap();
        match entity.content {
            StoredContent::Chunked(manifest) => assert_eq!(manifest.generation, 2),
            other => panic!("expected chunked content, got {other:?}"),
        }
        assert_eq!(chunker.reconstruct("e").unwrap(), b"a payload well past eight bytes");
    }

    #[test]
    fn test_update_after_delete_is_not_found() {
        let (_dir, store, chunker) = setup();
        write_revision(&store, &chunker, 1, "e", &create(1, "type:doc", None)).unwrap();
        let delete = Mutation::Delete {
            timestamp: Timestamp(2),
        };
        let deleted = write_revision(&store, &chunker, 2, "e", &delete).unwrap().unwrap();
        assert!(deleted.is_deleted());

        let update = Mutation::Update {
            timestamp: Timestamp(3),
            events: Vec::new(),
            content: Some(b"x".to_vec()),
        };
        assert!(matches!(
            write_revision(&store, &chunker, 3, "e", &update),
            Err(EngineError::NotFound(_))
        ));
    }
}
