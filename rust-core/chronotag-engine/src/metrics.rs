// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-process counters for the engine: operation counts, latency sums,
// content bytes and recovery activity. Counters only grow for the life of
// the engine; gauges (entity count, store size) are filled in when a
// snapshot is taken.

use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::recovery::EngineState;

/// Accumulated engine statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Number of entities created.
    pub create_count: u64,
    /// Number of updates applied.
    pub update_count: u64,
    /// Number of deletes (tombstones) written.
    pub delete_count: u64,
    /// Number of point reads (entity, chunk, stream).
    pub read_count: u64,
    /// Number of tag queries.
    pub query_count: u64,
    /// Cumulative latency of acknowledged writes, in milliseconds.
    pub write_latency_sum_ms: f64,
    /// Cumulative latency of reads and queries, in milliseconds.
    pub read_latency_sum_ms: f64,
    /// Content bytes accepted by writes.
    pub content_bytes_written: u64,
    /// Content bytes returned by reads.
    pub content_bytes_read: u64,
    /// Mutation entries appended to the WAL.
    pub wal_appends: u64,
    /// Highest WAL sequence reflected in the store and indexes.
    pub applied_sequence: u64,
    /// WAL entries replayed during recovery and repair.
    pub replayed_entries: u64,
    /// Checkpoints completed.
    pub checkpoints: u64,
    /// When the last checkpoint completed.
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    /// Index repairs completed.
    pub repairs: u64,
    /// Damaged records skipped by recovery and repair.
    pub skipped_corrupt_records: u64,

    /// Entities known to the indexes, including tombstoned ones.
    pub entities: usize,
    /// Distinct tags in the tag index.
    pub distinct_tags: usize,
    /// Size of the store data file.
    pub store_bytes: u64,
    pub state: Option<EngineState>,
}

/// Which write counter an operation bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteKind {
    Create,
    Update,
    Delete,
}

/// Shared statistics accumulator.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
    stats: RwLock<EngineStats>,
}

impl Metrics {
    pub fn snapshot(&self) -> EngineStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn record_write(&self, kind: WriteKind, elapsed: Duration, content_bytes: usize) {
        self.update(|s| {
            match kind {
                WriteKind::Create => s.create_count += 1,
                WriteKind::Update => s.update_count += 1,
                WriteKind::Delete => s.delete_count += 1,
            }
            s.write_latency_sum_ms += elapsed.as_secs_f64() * 1000.0;
            s.content_bytes_written += content_bytes as u64;
        });
    }

    pub fn record_read(&self, elapsed: Duration, content_bytes: usize) {
        self.update(|s| {
            s.read_count += 1;
            s.read_latency_sum_ms += elapsed.as_secs_f64() * 1000.0;
            s.content_bytes_read += content_bytes as u64;
        });
    }

    pub fn record_query(&self, elapsed: Duration) {
        self.update(|s| {
            s.query_count += 1;
            s.read_latency_sum_ms += elapsed.as_secs_f64() * 1000.0;
        });
    }

    pub fn record_wal_append(&self) {
        self.update(|s| s.wal_appends += 1);
    }

    pub fn record_applied(&self, sequence: u64) {
        self.update(|s| s.applied_sequence = s.applied_sequence.max(sequence));
    }

    pub fn record_replayed(&self, entries: u64) {
        self.update(|s| s.replayed_entries += entries);
    }

    pub fn record_checkpoint(&self, at: DateTime<Utc>) {
        self.update(|s| {
            s.checkpoints += 1;
            s.last_checkpoint_at = Some(at);
        });
    }

    pub fn record_repair(&self) {
        self.update(|s| s.repairs += 1);
    }

    pub fn record_skipped(&self, records: u64) {
        self.update(|s| s.skipped_corrupt_records += records);
    }

    // A poisoned lock only loses statistics, never data.
    fn update(&self, f: impl FnOnce(&mut EngineStats)) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_counters() {
        let metrics = Metrics::default();
        metrics.record_write(WriteKind::Create, Duration::from_millis(2), 10);
        metrics.record_write(WriteKind::Update, Duration::from_millis(1), 5);
        metrics.record_write(WriteKind::Delete, Duration::ZERO, 0);

        let stats = metrics.snapshot();
        assert_eq!(stats.create_count, 1);
        assert_eq!(stats.update_count, 1);
        assert_eq!(stats.delete_count, 1);
        assert_eq!(stats.content_bytes_written, 15);
        assert!(stats.write_latency_sum_ms >= 3.0);
    }

    #[test]
    fn test_applied_sequence_never_moves_back() {
        let metrics = Metrics::default();
        metrics.record_applied(7);
        metrics.record_applied(3);
        assert_eq!(metrics.snapshot().applied_sequence, 7);
    }

    #[test]
    fn test_checkpoint_recorded() {
        let metrics = Metrics::default();
        let now = Utc::now();
        metrics.record_checkpoint(now);
        let stats = metrics.snapshot();
        assert_eq!(stats.checkpoints, 1);
        assert_eq!(stats.last_checkpoint_at, Some(now));
    }
}
