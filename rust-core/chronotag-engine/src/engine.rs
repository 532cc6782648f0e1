// SPDX-License-Identifier: PMPL-1.0-or-later
//! The engine handle
//!
//! [`Engine`] is a cheap, cloneable handle over shared state. Writes go
//! through the single writer lane; reads go straight to the store and the
//! indexes and never wait on a writer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Instant;

use chronotag_index::{ChangeEvent, Indexes, Revision, TagDiff, TagEvent, Timestamp};
use chronotag_store::{ContentChunker, ContentStream, CompactReport, EntityStore, StoredContent, StoredEntity};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::apply::spawn_applier;
use crate::checkpoint::{spawn_checkpointer, write_checkpoint, CheckpointReport};
use crate::config::{EngineConfig, WalMode};
use crate::entity::{Entity, EntitySnapshot, Mutation, TagQuery, TagWrite};
use crate::error::{EngineError, EngineResult};
use crate::lock::DataDirLock;
use crate::metrics::{EngineStats, Metrics, WriteKind};
use crate::recovery::{self, EngineState, IndexCheck, RecoveryReport, RepairReport};
use crate::writer::{catalog_from_indexes, WriterLane};

/// Longest accepted entity id, in bytes.
pub const MAX_ENTITY_ID_LEN: usize = 512;

// ---------------------------------------------------------------------------
// Core: state shared by the handle, the applier and the checkpointer
// ---------------------------------------------------------------------------

pub(crate) struct Core {
    pub config: EngineConfig,
    pub store: Arc<EntityStore>,
    pub chunker: ContentChunker,
    pub metrics: Metrics,
    indexes: RwLock<Indexes>,
    state: RwLock<EngineState>,
    /// Highest WAL sequence reflected in store and indexes.
    applied: watch::Sender<u64>,
    /// Released by shutdown, or when the last reference goes.
    dir_lock: Mutex<Option<DataDirLock>>,
}

impl Core {
    pub fn new(
        config: EngineConfig,
        store: Arc<EntityStore>,
        chunker: ContentChunker,
        dir_lock: DataDirLock,
    ) -> Self {
        let (applied, _) = watch::channel(0);
        Self {
            config,
            store,
            chunker,
            metrics: Metrics::default(),
            indexes: RwLock::new(Indexes::new()),
            state: RwLock::new(EngineState::Starting),
            applied,
            dir_lock: Mutex::new(Some(dir_lock)),
        }
    }

    /// Let another engine open the data directory.
    fn release_dir_lock(&self) -> EngineResult<()> {
        let lock = self
            .dir_lock
            .lock()
            .map_err(|_| EngineError::LockPoisoned)?
            .take();
        drop(lock);
        Ok(())
    }

    pub fn state(&self) -> EngineState {
        self.state.read().map_or(EngineState::Corrupt, |state| *state)
    }

    pub fn set_state(&self, next: EngineState) {
        if let Ok(mut state) = self.state.write() {
            if *state != next {
                info!(from = %*state, to = %next, "Engine state changed");
                *state = next;
            }
        }
        // Wake `sync` waiters so they observe the new state.
        self.applied.send_modify(|_| {});
    }

    pub fn ensure_ready(&self) -> EngineResult<()> {
        match self.state() {
            EngineState::Ready => Ok(()),
            state => Err(EngineError::NotReady(state)),
        }
    }

    /// Record that acknowledged state could not be applied. The engine
    /// refuses further work until repaired.
    pub fn mark_corrupt(&self, err: &EngineError) {
        error!(error = %err, applied = self.applied(), "Apply failed, engine is corrupt");
        self.set_state(EngineState::Corrupt);
    }

    pub fn applied(&self) -> u64 {
        *self.applied.borrow()
    }

    pub fn publish_applied(&self, sequence: u64) {
        self.applied.send_if_modified(|applied| {
            if sequence > *applied {
                *applied = sequence;
                true
            } else {
                false
            }
        });
        self.metrics.record_applied(sequence);
    }

    pub fn subscribe_applied(&self) -> watch::Receiver<u64> {
        self.applied.subscribe()
    }

    pub fn read_indexes(&self) -> EngineResult<RwLockReadGuard<'_, Indexes>> {
        self.indexes.read().map_err(|_| EngineError::LockPoisoned)
    }

    pub fn write_indexes(&self) -> EngineResult<RwLockWriteGuard<'_, Indexes>> {
        self.indexes.write().map_err(|_| EngineError::LockPoisoned)
    }

    /// Load an entity revision and its content for a caller.
    fn load_entity(&self, stored: StoredEntity) -> EngineResult<(Entity, usize)> {
        let content = match stored.content {
            StoredContent::None => None,
            _ => Some(self.chunker.reconstruct_entity(&stored)?),
        };
        let len = content.as_ref().map_or(0, Vec::len);
        Ok((Entity::from_stored(stored, content), len))
    }

    /// The latest revision of a live entity.
    fn live_entity(&self, entity_id: &str) -> EngineResult<StoredEntity> {
        let stored = self.store.get(entity_id)?;
        if stored.is_deleted() {
            return Err(EngineError::NotFound(entity_id.to_string()));
        }
        Ok(stored)
    }
}

// ---------------------------------------------------------------------------
// Engine handle
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tasks {
    applier: Option<JoinHandle<()>>,
    checkpointer: Option<JoinHandle<()>>,
    stop_checkpointer: Option<watch::Sender<bool>>,
}

struct EngineInner {
    core: Arc<Core>,
    lane: AsyncMutex<WriterLane>,
    tasks: Mutex<Tasks>,
    recovery: RecoveryReport,
}

/// Handle to an open engine. Clones share the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// A handle that does not keep the engine alive.
#[derive(Clone)]
pub struct WeakEngine {
    inner: Weak<EngineInner>,
}

impl WeakEngine {
    pub fn upgrade(&self) -> Option<Engine> {
        self.inner.upgrade().map(|inner| Engine { inner })
    }
}

impl Engine {
    /// Open (or create) an engine under `config.data_dir`, running crash
    /// recovery first.
    ///
    /// The engine comes back `Ready`, or `Corrupt` when the store needs
    /// [`Engine::repair_index`]. Must be called inside a Tokio runtime.
    pub async fn open(config: EngineConfig) -> EngineResult<Self> {
        let (core, wal, recovery) = recovery::recover(config)?;

        let catalog = match core.state() {
            EngineState::Ready => catalog_from_indexes(&*core.read_indexes()?),
            _ => HashMap::new(),
        };
        let mut lane = WriterLane::new(wal, core.config.wal_mode, catalog);

        let mut tasks = Tasks::default();
        if core.config.wal_mode == WalMode::WalOnly {
            let (sender, handle) = spawn_applier(Arc::clone(&core));
            lane.set_applier(sender);
            tasks.applier = Some(handle);
        }

        let checkpoint_interval = core.config.checkpoint_interval;
        let engine = Self {
            inner: Arc::new(EngineInner {
                core,
                lane: AsyncMutex::new(lane),
                tasks: Mutex::new(tasks),
                recovery,
            }),
        };

        if let Some(interval) = checkpoint_interval {
            let (stop, stopped) = watch::channel(false);
            let handle = spawn_checkpointer(engine.downgrade(), interval, stopped);
            let mut tasks = engine.tasks()?;
            tasks.checkpointer = Some(handle);
            tasks.stop_checkpointer = Some(stop);
        }

        info!(
            data_dir = %engine.core().config.data_dir.display(),
            mode = %engine.core().config.wal_mode,
            state = %engine.state(),
            "Engine open"
        );
        Ok(engine)
    }

    pub fn downgrade(&self) -> WeakEngine {
        WeakEngine {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn core(&self) -> &Arc<Core> {
        &self.inner.core
    }

    fn tasks(&self) -> EngineResult<std::sync::MutexGuard<'_, Tasks>> {
        self.inner.tasks.lock().map_err(|_| EngineError::LockPoisoned)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core().config
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Create an entity under a fresh UUID v4 and return the id.
    pub async fn create_entity(&self, tags: Vec<TagWrite>, content: Option<Vec<u8>>) -> EngineResult<String> {
        self.create_entity_with_id(Uuid::new_v4().to_string(), tags, content)
            .await
    }

    /// Create an entity under a caller-chosen id.
    pub async fn create_entity_with_id(
        &self,
        entity_id: impl Into<String>,
        tags: Vec<TagWrite>,
        content: Option<Vec<u8>>,
    ) -> EngineResult<String> {
        let start = Instant::now();
        let entity_id = entity_id.into();
        validate_entity_id(&entity_id)?;
        self.config().check_content_size(content.as_deref())?;
        if tags.is_empty() {
            return Err(EngineError::InvalidTag {
                tag: String::new(),
                reason: "an entity needs at least one tag",
            });
        }

        let core = self.core();
        let mut lane = self.inner.lane.lock().await;
        core.ensure_ready()?;
        if lane.contains(&entity_id) {
            return Err(EngineError::DuplicateId(entity_id));
        }

        let (timestamp, events) = lane.resolve_events(&entity_id, tags, None)?;
        let mutation = Mutation::Create {
            timestamp,
            events,
            content,
        };
        let content_len = mutation.content_len();
        let sequence = lane.submit(core, &entity_id, mutation).await?;
        drop(lane);

        core.metrics.record_write(WriteKind::Create, start.elapsed(), content_len);
        debug!(entity_id = %entity_id, sequence, "Created entity");
        Ok(entity_id)
    }

    /// Append tag-events to an entity and optionally replace its content.
    pub async fn update_entity(
        &self,
        entity_id: &str,
        tags: Vec<TagWrite>,
        content: Option<Vec<u8>>,
    ) -> EngineResult<()> {
        let start = Instant::now();
        if tags.is_empty() && content.is_none() {
            return Err(EngineError::InvalidMutation(
                "update carries neither tag-events nor content".to_string(),
            ));
        }
        self.config().check_content_size(content.as_deref())?;

        let core = self.core();
        let mut lane = self.inner.lane.lock().await;
        core.ensure_ready()?;
        let known = lane.live(entity_id)?;

        let (timestamp, events) = lane.resolve_events(entity_id, tags, Some(known.last_timestamp))?;
        let mutation = Mutation::Update {
            timestamp,
            events,
            content,
        };
        let content_len = mutation.content_len();
        let sequence = lane.submit(core, entity_id, mutation).await?;
        drop(lane);

        core.metrics.record_write(WriteKind::Update, start.elapsed(), content_len);
        debug!(entity_id, sequence, "Updated entity");
        Ok(())
    }

    /// Tombstone an entity. Deletion is final.
    pub async fn delete_entity(&self, entity_id: &str) -> EngineResult<()> {
        let start = Instant::now();
        let core = self.core();
        let mut lane = self.inner.lane.lock().await;
        core.ensure_ready()?;
        let known = lane.live(entity_id)?;

        let timestamp = lane.stamp(Some(known.last_timestamp));
        let sequence = lane
            .submit(core, entity_id, Mutation::Delete { timestamp })
            .await?;
        drop(lane);

        core.metrics.record_write(WriteKind::Delete, start.elapsed(), 0);
        debug!(entity_id, sequence, "Deleted entity");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The latest state of a live entity, content reassembled.
    pub fn get_entity(&self, entity_id: &str) -> EngineResult<Entity> {
        let start = Instant::now();
        let core = self.core();
        core.ensure_ready()?;
        let (entity, content_len) = core.load_entity(core.live_entity(entity_id)?)?;
        core.metrics.record_read(start.elapsed(), content_len);
        Ok(entity)
    }

    /// Entities carrying every tag in the query, sorted by id.
    pub fn query_by_tags(&self, query: &TagQuery) -> EngineResult<Vec<Entity>> {
        let start = Instant::now();
        let core = self.core();
        core.ensure_ready()?;

        let ids: Vec<String> = {
            let indexes = core.read_indexes()?;
            indexes
                .tags
                .query_text(query.tags.as_slice())?
                .into_iter()
                .filter(|id| query.include_deleted || !indexes.is_deleted(id))
                .take(query.limit.unwrap_or(usize::MAX))
                .collect()
        };

        let mut entities = Vec::with_capacity(ids.len());
        for id in ids {
            let stored = core.store.get(&id).map_err(|err| match err {
                chronotag_store::StoreError::NotFound(_) => {
                    EngineError::IndexStale(format!("indexed entity {id} is missing from the store"))
                }
                other => other.into(),
            })?;
            entities.push(core.load_entity(stored)?.0);
        }

        core.metrics.record_query(start.elapsed());
        Ok(entities)
    }

    /// Every tag-event of an entity, oldest first. Tombstoned entities keep
    /// their history.
    pub fn history(&self, entity_id: &str) -> EngineResult<Vec<TagEvent>> {
        self.temporal(|indexes| Ok(indexes.temporal.history(entity_id)?))
    }

    /// Tag-events grouped by write, oldest first.
    pub fn revisions(&self, entity_id: &str) -> EngineResult<Vec<Revision>> {
        self.temporal(|indexes| Ok(indexes.temporal.revisions(entity_id)?))
    }

    pub fn as_of(&self, entity_id: &str, at: Timestamp) -> EngineResult<EntitySnapshot> {
        self.temporal(|indexes| Ok(indexes.temporal.as_of(entity_id, at)?))
    }

    pub fn diff(&self, entity_id: &str, from: Timestamp, to: Timestamp) -> EngineResult<TagDiff> {
        self.temporal(|indexes| Ok(indexes.temporal.diff(entity_id, from, to)?))
    }

    /// Tag-events across all entities with `since <= timestamp <= until`.
    pub fn changes(&self, since: Timestamp, until: Option<Timestamp>) -> EngineResult<Vec<ChangeEvent>> {
        self.temporal(|indexes| Ok(indexes.temporal.changes(since, until)?))
    }

    fn temporal<T>(&self, read: impl FnOnce(&Indexes) -> EngineResult<T>) -> EngineResult<T> {
        let start = Instant::now();
        let core = self.core();
        core.ensure_ready()?;
        let result = read(&*core.read_indexes()?);
        core.metrics.record_query(start.elapsed());
        result
    }

    /// One content chunk. Inline content is chunk 0.
    pub fn get_chunk(&self, entity_id: &str, index: u32) -> EngineResult<Vec<u8>> {
        let start = Instant::now();
        let core = self.core();
        core.ensure_ready()?;
        let chunk = core.chunker.chunk_of(&core.live_entity(entity_id)?, index)?;
        core.metrics.record_read(start.elapsed(), chunk.len());
        Ok(chunk)
    }

    /// Lazily stream an entity's content. Dropping the stream cancels it.
    pub fn stream_content(&self, entity_id: &str) -> EngineResult<ContentStream> {
        let start = Instant::now();
        let core = self.core();
        core.ensure_ready()?;
        let stream = core.chunker.stream_entity(&core.live_entity(entity_id)?)?;
        core.metrics.record_read(start.elapsed(), stream.total_len() as usize);
        Ok(stream)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Fsync the store, persist the index snapshot, log a checkpoint and
    /// prune WAL segments that are fully applied.
    pub async fn checkpoint(&self) -> EngineResult<CheckpointReport> {
        let mut lane = self.inner.lane.lock().await;
        write_checkpoint(self.core(), &mut lane.wal)
    }

    /// Fsync the WAL and wait until every acknowledged write is applied.
    pub async fn sync(&self) -> EngineResult<()> {
        let target = {
            let mut lane = self.inner.lane.lock().await;
            lane.wal.sync()?;
            lane.last_acknowledged()
        };
        self.wait_for_applied(target).await
    }

    async fn wait_for_applied(&self, target: u64) -> EngineResult<()> {
        let core = self.core();
        let mut applied = core.subscribe_applied();
        loop {
            if *applied.borrow_and_update() >= target {
                return Ok(());
            }
            match core.state() {
                state @ (EngineState::Corrupt | EngineState::Stopped) => {
                    return Err(EngineError::NotReady(state))
                }
                _ => {}
            }
            if applied.changed().await.is_err() {
                return Err(EngineError::NotReady(core.state()));
            }
        }
    }

    /// Compare the indexes with the store; repair them if they diverged.
    pub async fn verify_index(&self) -> EngineResult<IndexCheck> {
        let core = self.core();
        let mut lane = self.inner.lane.lock().await;
        core.ensure_ready()?;
        self.wait_for_applied(lane.last_acknowledged()).await?;

        match recovery::verify(core)? {
            None => {
                let entities = core.read_indexes()?.temporal.entity_count();
                info!(entities, "Indexes consistent with store");
                Ok(IndexCheck::Consistent { entities })
            }
            Some(reason) => {
                warn!(error = %EngineError::IndexStale(reason.clone()), "Indexes diverged, repairing");
                let report = self.repair_locked(&mut lane).await?;
                Ok(IndexCheck::Repaired { reason, report })
            }
        }
    }

    /// Rebuild locators and indexes from a validating store scan and return
    /// the engine to `Ready`.
    pub async fn repair_index(&self) -> EngineResult<RepairReport> {
        let mut lane = self.inner.lane.lock().await;
        if self.state() == EngineState::Stopped {
            return Err(EngineError::NotReady(EngineState::Stopped));
        }
        self.repair_locked(&mut lane).await
    }

    async fn repair_locked(&self, lane: &mut WriterLane) -> EngineResult<RepairReport> {
        let core = self.core();
        self.stop_applier(lane).await?;

        let result = recovery::repair(core, lane.wal.wal_dir(), lane.wal.last_sequence()).and_then(|report| {
            lane.wal.advance_to(core.store.watermark() + 1)?;
            lane.reset_catalog(catalog_from_indexes(&*core.read_indexes()?));
            Ok(report)
        });

        if core.config.wal_mode == WalMode::WalOnly {
            let (sender, handle) = spawn_applier(Arc::clone(core));
            lane.set_applier(sender);
            self.tasks()?.applier = Some(handle);
        }
        if let Err(err) = &result {
            core.mark_corrupt(err);
        }
        result
    }

    /// Close the applier channel and wait for it to drain.
    async fn stop_applier(&self, lane: &mut WriterLane) -> EngineResult<()> {
        drop(lane.take_applier());
        let handle = self.tasks()?.applier.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "Applier task ended abnormally");
            }
        }
        Ok(())
    }

    /// Rewrite the store file keeping only live revisions.
    pub async fn compact(&self) -> EngineResult<CompactReport> {
        let core = self.core();
        let lane = self.inner.lane.lock().await;
        core.ensure_ready()?;
        // Chunks are written before their entity record, so the applier
        // must be idle for compaction to keep them.
        self.wait_for_applied(lane.last_acknowledged()).await?;
        let report = core.store.compact()?;
        info!(
            bytes_before = report.bytes_before,
            bytes_after = report.bytes_after,
            "Store compacted"
        );
        Ok(report)
    }

    pub fn state(&self) -> EngineState {
        self.core().state()
    }

    /// Counters plus current gauges.
    pub fn stats(&self) -> EngineResult<EngineStats> {
        let core = self.core();
        let mut stats = core.metrics.snapshot();
        {
            let indexes = core.read_indexes()?;
            stats.entities = indexes.temporal.entity_count();
            stats.distinct_tags = indexes.tags.tag_count();
        }
        stats.store_bytes = core.store.stats()?.file_bytes;
        stats.applied_sequence = core.applied();
        stats.state = Some(core.state());
        Ok(stats)
    }

    /// What startup recovery found and did.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.inner.recovery
    }

    /// Stop background tasks, drain the applier and write a final
    /// checkpoint. Later operations fail with `NotReady(Stopped)`.
    pub async fn shutdown(&self) -> EngineResult<()> {
        let (stop, checkpointer) = {
            let mut tasks = self.tasks()?;
            (tasks.stop_checkpointer.take(), tasks.checkpointer.take())
        };
        if let Some(stop) = stop {
            let _ = stop.send(true);
        }
        if let Some(handle) = checkpointer {
            if let Err(err) = handle.await {
                warn!(error = %err, "Checkpoint task ended abnormally");
            }
        }

        let core = self.core();
        let mut lane = self.inner.lane.lock().await;
        if core.state() == EngineState::Stopped {
            return Ok(());
        }
        self.stop_applier(&mut lane).await?;

        if core.state() == EngineState::Ready {
            write_checkpoint(core, &mut lane.wal)?;
        }
        lane.wal.sync()?;
        core.set_state(EngineState::Stopped);
        core.release_dir_lock()?;
        info!(applied = core.applied(), "Engine shut down");
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.config().data_dir)
            .field("mode", &self.config().wal_mode)
            .field("state", &self.state())
            .finish()
    }
}

fn validate_entity_id(entity_id: &str) -> EngineResult<()> {
    if entity_id.is_empty()
        || entity_id.len() > MAX_ENTITY_ID_LEN
        || entity_id.chars().any(char::is_control)
    {
        return Err(EngineError::InvalidEntityId(entity_id.to_string()));
    }
    Ok(())
}
