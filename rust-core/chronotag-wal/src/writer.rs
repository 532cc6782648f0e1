// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ChronoTag Write-Ahead Log - Append-only writer
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Single appender for a WAL directory. It owns the sequence counter and
// the newest segment, and cuts a crash-torn tail off that segment on open.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::entry::{WalEntry, MAX_ENTRY_SIZE};
use crate::error::{WalError, WalResult};
use crate::reader::{repair_tail, scan_segment, TailRepair};
use crate::segment::{
    self, list_segments, segment_path, sync_dir, SegmentInfo, DEFAULT_MAX_SEGMENT_SIZE,
};

// ---------------------------------------------------------------------------
// SyncMode
// ---------------------------------------------------------------------------

/// When the writer forces appended bytes to stable storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// `fsync` before `append` returns.
    #[default]
    Fsync,

    /// `fsync` once the interval has passed since the last one. A crash
    /// can lose what was appended in between.
    Periodic(Duration),

    /// Leave flushing to the OS.
    Async,
}

// ---------------------------------------------------------------------------
// WalWriter
// ---------------------------------------------------------------------------

/// Appends framed entries, starting a new segment whenever the next frame
/// would push the current one past `max_segment_size`.
pub struct WalWriter {
    wal_dir: PathBuf,
    current_file: File,
    current_segment: SegmentInfo,
    next_sequence: u64,
    max_segment_size: u64,
    sync_mode: SyncMode,
    last_sync: Instant,
    tail_repair: TailRepair,
}

impl WalWriter {
    /// Open (creating if needed) the log in `wal_dir`.
    ///
    /// A damaged tail is truncated before anything is appended. A fresh
    /// directory gets a first segment starting at sequence 1.
    pub fn open(wal_dir: impl AsRef<Path>, sync_mode: SyncMode) -> WalResult<Self> {
        Self::open_with_max_size(wal_dir, sync_mode, DEFAULT_MAX_SEGMENT_SIZE)
    }

    /// As [`WalWriter::open`] with a non-default rotation size.
    pub fn open_with_max_size(
        wal_dir: impl AsRef<Path>,
        sync_mode: SyncMode,
        max_segment_size: u64,
    ) -> WalResult<Self> {
        let wal_dir = wal_dir.as_ref().to_path_buf();

        if !wal_dir.exists() {
            fs::create_dir_all(&wal_dir)?;
            if let Some(parent) = wal_dir.parent().filter(|p| !p.as_os_str().is_empty()) {
                sync_dir(parent)?;
            }
            info!(dir = %wal_dir.display(), "Created WAL directory");
        }

        let tail_repair = repair_tail(&wal_dir)?;
        let segments = list_segments(&wal_dir)?;

        let (current_segment, current_file, next_sequence) = match segments.last() {
            None => {
                let start_sequence = 1;
                let path = segment_path(&wal_dir, start_sequence);
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                sync_dir(&wal_dir)?;
                info!("Initialized fresh WAL at sequence 1");
                (
                    SegmentInfo {
                        path,
                        start_sequence,
                        file_size: 0,
                    },
                    file,
                    start_sequence,
                )
            }
            Some(last) => {
                let scan = scan_segment(&last.path)?;
                let next_sequence = scan
                    .last_sequence
                    .map_or(last.start_sequence, |sequence| sequence + 1);
                let file = OpenOptions::new().append(true).open(&last.path)?;
                info!(
                    segment = %last.name(),
                    next_sequence,
                    "Resuming WAL"
                );
                (
                    SegmentInfo {
                        file_size: scan.valid_len,
                        ..last.clone()
                    },
                    file,
                    next_sequence,
                )
            }
        };

        Ok(Self {
            wal_dir,
            current_file,
            current_segment,
            next_sequence,
            max_segment_size,
            sync_mode,
            last_sync: Instant::now(),
            tail_repair,
        })
    }

    /// Append a new entry to the WAL.
    ///
    /// The entry's `sequence` field is overwritten with the next sequence
    /// number. If the write or its sync fails, the segment is cut back to
    /// its previous length and the sequence is not consumed.
    pub fn append(&mut self, mut entry: WalEntry) -> WalResult<u64> {
        let sequence = self.next_sequence;
        entry.sequence = sequence;

        let bytes = entry.serialize();
        let entry_length = bytes.len() - 4;
        if entry_length > MAX_ENTRY_SIZE as usize {
            return Err(WalError::EntryTooLarge {
                offset: self.current_segment.file_size,
                length: u32::try_from(entry_length).unwrap_or(u32::MAX),
                max_length: MAX_ENTRY_SIZE,
            });
        }

        if self.current_segment.file_size > 0
            && self.current_segment.file_size + bytes.len() as u64 > self.max_segment_size
        {
            self.rotate()?;
        }

        let previous_len = self.current_segment.file_size;
        if let Err(error) = self.write_bytes(&bytes) {
            warn!(sequence, error = %error, "WAL append failed, rolling back segment");
            if let Err(rollback) = self.current_file.set_len(previous_len) {
                warn!(error = %rollback, "WAL rollback failed");
            }
            return Err(error);
        }

        self.current_segment.file_size += bytes.len() as u64;
        self.next_sequence += 1;

        debug!(
            sequence,
            operation = ?entry.operation,
            entity_id = %entry.entity_id,
            "Appended WAL entry"
        );

        Ok(sequence)
    }

    /// `fsync` the active segment now, whatever the `SyncMode`.
    pub fn sync(&mut self) -> WalResult<()> {
        self.current_file.sync_all()?;
        self.last_sync = Instant::now();
        Ok(())
    }

    /// Write a checkpoint entry recording that every entry with sequence
    /// <= `applied_through` has reached the entity store. Always fsynced.
    ///
    /// Returns the sequence number of the checkpoint entry.
    pub fn checkpoint(&mut self, applied_through: u64) -> WalResult<u64> {
        let sequence = self.append(WalEntry::checkpoint(applied_through))?;
        self.sync()?;
        info!(sequence, applied_through, "WAL checkpoint written");
        Ok(sequence)
    }

    /// Start a new segment named after `next_sequence`.
    ///
    /// A no-op when the current segment is still empty and already starts
    /// there.
    pub fn rotate(&mut self) -> WalResult<()> {
        if self.current_segment.file_size == 0
            && self.current_segment.start_sequence == self.next_sequence
        {
            return Ok(());
        }

        self.sync()?;

        let new_start = self.next_sequence;
        let new_path = segment_path(&self.wal_dir, new_start);
        let new_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&new_path)?;
        sync_dir(&self.wal_dir)?;

        info!(
            old_segment = %self.current_segment.name(),
            start_sequence = new_start,
            "Rotated WAL segment"
        );

        let old_empty = self.current_segment.file_size == 0;
        let old_path = std::mem::replace(&mut self.current_segment.path, new_path);
        self.current_file = new_file;
        self.current_segment.start_sequence = new_start;
        self.current_segment.file_size = 0;

        // An empty segment that was skipped over holds no entries.
        if old_empty {
            fs::remove_file(old_path)?;
            sync_dir(&self.wal_dir)?;
        }

        Ok(())
    }

    /// Make sure the next assigned sequence is at least `min_next`.
    ///
    /// Used when the entity store already reflects sequences the log no
    /// longer holds (for example after the log directory was lost).
    pub fn advance_to(&mut self, min_next: u64) -> WalResult<()> {
        if self.next_sequence >= min_next {
            return Ok(());
        }
        warn!(
            from = self.next_sequence,
            to = min_next,
            "Advancing WAL sequence past store watermark"
        );
        self.next_sequence = min_next;
        self.rotate()
    }

    /// Delete whole segments whose entries are all <= `applied_through`.
    pub fn prune_through(&self, applied_through: u64) -> WalResult<usize> {
        let removed = segment::prune_through(&self.wal_dir, applied_through)?;
        if removed > 0 {
            info!(removed, applied_through, "Pruned WAL segments");
        }
        Ok(removed)
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// The highest sequence assigned so far, or 0 for an empty log.
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence.saturating_sub(1)
    }

    pub fn wal_dir(&self) -> &Path {
        &self.wal_dir
    }

    /// The segment appends currently go to.
    pub fn current_segment(&self) -> &SegmentInfo {
        &self.current_segment
    }

    /// What was cut from the log when this writer was opened.
    pub fn tail_repair(&self) -> TailRepair {
        self.tail_repair
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> WalResult<()> {
        self.current_file.write_all(bytes)?;
        self.maybe_sync()
    }

    fn maybe_sync(&mut self) -> WalResult<()> {
        match self.sync_mode {
            SyncMode::Fsync => self.sync()?,
            SyncMode::Periodic(interval) => {
                if self.last_sync.elapsed() >= interval {
                    self.sync()?;
                }
            }
            SyncMode::Async => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::WalOperation;
    use crate::reader::WalReader;
    use tempfile::TempDir;

    fn tag(id: &str) -> WalEntry {
        WalEntry::mutation(WalOperation::Update, id, b"+status:open".to_vec())
    }

    fn logged_ids(dir: &Path) -> Vec<String> {
        WalReader::open(dir)
            .unwrap()
            .replay_all()
            .unwrap()
            .map(|e| e.unwrap())
            .filter(|e| e.operation.is_mutation())
            .map(|e| e.entity_id)
            .collect()
    }

    #[test]
    fn test_fresh_log_starts_at_one() {
        let dir = TempDir::new().unwrap();
        let mut writer = WalWriter::open(dir.path().join("nested/wal"), SyncMode::Async).unwrap();
        assert!(dir.path().join("nested/wal").is_dir());
        assert_eq!((writer.next_sequence(), writer.last_sequence()), (1, 0));

        let assigned: Vec<u64> = ["x", "y", "z"]
            .into_iter()
            .map(|id| writer.append(tag(id)).unwrap())
            .collect();
        assert_eq!(assigned, vec![1, 2, 3]);
        assert_eq!(writer.last_sequence(), 3);
    }

    #[test]
    fn test_checkpoint_consumes_a_sequence() {
        let dir = TempDir::new().unwrap();
        let mut writer = WalWriter::open(dir.path(), SyncMode::Async).unwrap();
        writer.append(tag("x")).unwrap();
        assert_eq!(writer.checkpoint(1).unwrap(), 2);
        assert_eq!(writer.append(tag("y")).unwrap(), 3);
    }

    #[test]
    fn test_small_segments_rotate_without_gaps() {
        let dir = TempDir::new().unwrap();
        let mut writer = WalWriter::open_with_max_size(dir.path(), SyncMode::Async, 120).unwrap();
        for i in 0..12 {
            writer.append(tag(&format!("r{i}"))).unwrap();
        }

        assert!(list_segments(dir.path()).unwrap().len() > 2);
        let sequences: Vec<u64> = WalReader::open(dir.path())
            .unwrap()
            .replay_all()
            .unwrap()
            .map(|e| e.unwrap().sequence)
            .collect();
        assert_eq!(sequences, (1..=12).collect::<Vec<_>>());
    }

    #[test]
    fn test_entry_past_64_mib_is_accepted() {
        let dir = TempDir::new().unwrap();
        let mut writer = WalWriter::open(dir.path(), SyncMode::Async).unwrap();
        let payload = vec![0x5A; 65 * 1024 * 1024];
        let sequence = writer
            .append(WalEntry::mutation(WalOperation::Create, "big", payload.clone()))
            .unwrap();
        writer.sync().unwrap();

        let entry = WalReader::open(dir.path())
            .unwrap()
            .replay_from(sequence)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(entry.payload.len(), payload.len());
        assert!(entry.payload == payload);
    }

    #[test]
    fn test_reopen_continues_numbering() {
        let dir = TempDir::new().unwrap();
        let mut writer = WalWriter::open(dir.path(), SyncMode::Fsync).unwrap();
        writer.append(tag("x")).unwrap();
        writer.append(tag("y")).unwrap();
        drop(writer);

        let mut writer = WalWriter::open(dir.path(), SyncMode::Fsync).unwrap();
        assert!(writer.tail_repair().is_noop());
        assert_eq!(writer.append(tag("z")).unwrap(), 3);
        assert_eq!(logged_ids(dir.path()), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_torn_tail_is_cut_before_appending() {
        let dir = TempDir::new().unwrap();
        let mut writer = WalWriter::open(dir.path(), SyncMode::Fsync).unwrap();
        writer.append(tag("whole")).unwrap();
        writer.append(tag("torn")).unwrap();
        drop(writer);

        let path = list_segments(dir.path()).unwrap()[0].path.clone();
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 3).unwrap();

        let mut writer = WalWriter::open(dir.path(), SyncMode::Fsync).unwrap();
        assert!(writer.tail_repair().truncated_bytes > 0);
        assert_eq!(writer.append(tag("next")).unwrap(), 2);
        assert_eq!(logged_ids(dir.path()), vec!["whole", "next"]);
    }

    #[test]
    fn test_periodic_mode_appends_and_syncs() {
        let dir = TempDir::new().unwrap();
        let mut writer =
            WalWriter::open(dir.path(), SyncMode::Periodic(Duration::from_millis(5))).unwrap();
        for i in 0..4 {
            writer.append(tag(&format!("p{i}"))).unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }
        writer.sync().unwrap();
        assert_eq!(logged_ids(dir.path()).len(), 4);
    }

    #[test]
    fn test_advance_to_moves_only_forward() {
        let dir = TempDir::new().unwrap();
        let mut writer = WalWriter::open(dir.path(), SyncMode::Async).unwrap();
        writer.advance_to(40).unwrap();
        assert_eq!(writer.append(tag("late")).unwrap(), 40);

        // The skipped-over empty first segment is gone.
        let starts: Vec<u64> = list_segments(dir.path())
            .unwrap()
            .iter()
            .map(|s| s.start_sequence)
            .collect();
        assert_eq!(starts, vec![40]);

        writer.advance_to(5).unwrap();
        assert_eq!(writer.next_sequence(), 41);
    }

    #[test]
    fn test_prune_leaves_checkpoint_readable() {
        let dir = TempDir::new().unwrap();
        let mut writer = WalWriter::open(dir.path(), SyncMode::Async).unwrap();
        writer.append(tag("x")).unwrap();
        writer.append(tag("y")).unwrap();
        writer.rotate().unwrap();
        writer.checkpoint(2).unwrap();

        assert_eq!(writer.prune_through(2).unwrap(), 1);
        let mark = WalReader::open(dir.path())
            .unwrap()
            .find_last_checkpoint()
            .unwrap()
            .unwrap();
        assert_eq!(mark.applied_through, 2);
        assert!(logged_ids(dir.path()).is_empty());
    }
}
