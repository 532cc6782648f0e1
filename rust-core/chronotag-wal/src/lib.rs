// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ChronoTag Write-Ahead Log (WAL) crate
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Every entity mutation is appended here, and fsynced according to the
// writer's `SyncMode`, before the entity store sees it. After a crash the
// engine replays entries above the store's watermark.
//
// The log lives in one directory as numbered segment files (see
// `segment`). Each segment is a run of framed entries (see `entry` for the
// byte layout). Readers trust a segment up to its first bad frame. The
// writer truncates that bad tail on open so later appends stay readable.
//
// ## Usage
//
// ```no_run
// use chronotag_wal::{SyncMode, WalEntry, WalOperation, WalReader, WalWriter};
//
// let mut writer = WalWriter::open("/tmp/chronotag-wal", SyncMode::Fsync).unwrap();
// let seq = writer
//     .append(WalEntry::mutation(WalOperation::Create, "entity-123", b"...".to_vec()))
//     .unwrap();
// writer.checkpoint(seq).unwrap();
//
// let reader = WalReader::open("/tmp/chronotag-wal").unwrap();
// for entry in reader.replay_all().unwrap() {
//     let entry = entry.unwrap();
//     println!("seq={} op={:?} entity={}", entry.sequence, entry.operation, entry.entity_id);
// }
// ```

pub mod entry;
pub mod error;
pub mod reader;
pub mod segment;
pub mod writer;

pub use entry::{WalEntry, WalOperation, MAX_ENTRY_SIZE};
pub use error::{WalError, WalResult};
pub use reader::{
    repair_tail, scan_segment, CheckpointMark, ScanStop, SegmentCursor, SegmentScan, TailRepair,
    WalEntryIterator, WalReader, WalReport,
};
pub use segment::{sync_dir, SegmentInfo, DEFAULT_MAX_SEGMENT_SIZE};
pub use writer::{SyncMode, WalWriter};
