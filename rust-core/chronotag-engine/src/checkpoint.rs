// SPDX-License-Identifier: PMPL-1.0-or-later
//! Checkpointing
//!
//! A checkpoint makes everything applied so far durable outside the WAL
//! (store fsync plus index snapshot), records the applied sequence in the
//! log and prunes the segments that are no longer needed for recovery.

use std::time::Duration;

use chrono::{DateTime, Utc};
use chronotag_wal::WalWriter;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::{Core, WeakEngine};
use crate::error::EngineResult;
use crate::recovery::EngineState;

/// What one checkpoint did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointReport {
    /// Every WAL entry up to here is in the store.
    pub applied_through: u64,
    /// Watermark of the persisted index snapshot.
    pub snapshot_watermark: u64,
    /// Sequence of the checkpoint entry itself.
    pub checkpoint_sequence: u64,
    pub pruned_segments: usize,
    pub at: DateTime<Utc>,
}

/// Run one checkpoint. The caller holds the writer lane.
pub(crate) fn write_checkpoint(core: &Core, wal: &mut WalWriter) -> EngineResult<CheckpointReport> {
    core.ensure_ready()?;
    let applied_through = core.applied();

    core.store.sync()?;
    let snapshot = core.read_indexes()?.to_snapshot();
    snapshot.persist(&core.config.snapshot_path())?;

    let checkpoint_sequence = wal.checkpoint(applied_through)?;
    let pruned_segments = wal.prune_through(applied_through)?;

    let at = Utc::now();
    core.metrics.record_checkpoint(at);
    info!(
        applied_through,
        snapshot_watermark = snapshot.watermark,
        checkpoint_sequence,
        pruned_segments,
        "Checkpoint complete"
    );
    Ok(CheckpointReport {
        applied_through,
        snapshot_watermark: snapshot.watermark,
        checkpoint_sequence,
        pruned_segments,
        at,
    })
}

/// Start the periodic checkpoint task.
///
/// The task holds only a weak handle, so dropping every [`crate::Engine`]
/// ends it at the next tick. `stop` ends it immediately.
pub(crate) fn spawn_checkpointer(
    engine: WeakEngine,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(engine) = engine.upgrade() else {
                        break;
                    };
                    if engine.state() != EngineState::Ready {
                        debug!(state = %engine.state(), "Skipping periodic checkpoint");
                        continue;
                    }
                    if let Err(err) = engine.checkpoint().await {
                        warn!(error = %err, "Periodic checkpoint failed");
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Checkpoint task stopped");
    })
}
