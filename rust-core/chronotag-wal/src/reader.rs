// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ChronoTag Write-Ahead Log - Reader for crash recovery
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Replay reads segments oldest first and yields entries in sequence
// order. The log is only trusted up to its first damaged entry: a torn
// write, CRC mismatch or undecodable entry ends the readable log, and every
// entry after it (including later segments) is discarded.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::entry::{WalEntry, WalOperation, MAX_ENTRY_SIZE, MIN_ENTRY_LENGTH};
use crate::error::{WalError, WalResult};
use crate::segment::{list_segments, sync_dir, SegmentInfo};

/// Buffer size for sequential segment reads.
const READ_BUFFER_SIZE: usize = 256 * 1024;

// ---------------------------------------------------------------------------
// Segment scanning
// ---------------------------------------------------------------------------

/// Why a segment scan stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStop {
    /// Every byte of the segment belonged to a valid entry.
    Clean,
    /// The segment ends in the middle of an entry.
    Truncated {
        /// Offset of the incomplete entry.
        offset: u64,
    },
    /// An entry failed validation.
    Corrupt {
        /// Offset of the damaged entry.
        offset: u64,
        /// Human-readable cause.
        reason: String,
    },
}

impl ScanStop {
    /// Whether the scan consumed the whole segment.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }
}

/// Reads one segment file entry by entry, holding a single frame in memory.
///
/// Reading stops at the first entry that is incomplete, declares an
/// impossible length, fails its CRC or cannot be decoded. Sequence numbers
/// must strictly increase within the segment; a regression is treated as
/// corruption.
pub struct SegmentCursor {
    reader: BufReader<File>,
    offset: u64,
    file_len: u64,
    last_sequence: Option<u64>,
    stop: Option<ScanStop>,
}

impl SegmentCursor {
    pub fn open(path: &Path) -> WalResult<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::with_capacity(READ_BUFFER_SIZE, file),
            offset: 0,
            file_len,
            last_sequence: None,
            stop: None,
        })
    }

    /// The next valid entry, or `None` once the readable prefix is used up.
    pub fn next_entry(&mut self) -> WalResult<Option<WalEntry>> {
        if self.stop.is_some() {
            return Ok(None);
        }

        let offset = self.offset;
        let remaining = self.file_len - offset;
        if remaining == 0 {
            return self.finish(ScanStop::Clean);
        }
        if remaining < 4 {
            return self.finish(ScanStop::Truncated { offset });
        }

        let mut prefix = [0u8; 4];
        if !self.fill(&mut prefix)? {
            return self.finish(ScanStop::Truncated { offset });
        }
        let entry_length = u32::from_le_bytes(prefix);
        if !(MIN_ENTRY_LENGTH..=MAX_ENTRY_SIZE).contains(&entry_length) {
            return self.finish(ScanStop::Corrupt {
                offset,
                reason: format!("implausible entry length {entry_length}"),
            });
        }
        if 4 + u64::from(entry_length) > remaining {
            return self.finish(ScanStop::Truncated { offset });
        }

        let mut frame = vec![0u8; entry_length as usize];
        if !self.fill(&mut frame)? {
            return self.finish(ScanStop::Truncated { offset });
        }

        let entry = match WalEntry::deserialize(&frame, entry_length) {
            Ok(entry) => entry,
            Err(error) => {
                return self.finish(ScanStop::Corrupt {
                    offset,
                    reason: error.to_string(),
                })
            }
        };
        if let Some(previous) = self.last_sequence {
            if entry.sequence <= previous {
                return self.finish(ScanStop::Corrupt {
                    offset,
                    reason: format!("sequence {} does not follow {previous}", entry.sequence),
                });
            }
        }

        self.last_sequence = Some(entry.sequence);
        self.offset = offset + 4 + u64::from(entry_length);
        Ok(Some(entry))
    }

    /// Length of the valid prefix read so far.
    pub fn valid_len(&self) -> u64 {
        self.offset
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Why reading stopped; `None` while entries remain.
    pub fn stop(&self) -> Option<&ScanStop> {
        self.stop.as_ref()
    }

    /// `false` if the file ended early, e.g. it was cut while being read.
    fn fill(&mut self, buf: &mut [u8]) -> WalResult<bool> {
        match self.reader.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    fn finish(&mut self, stop: ScanStop) -> WalResult<Option<WalEntry>> {
        self.stop = Some(stop);
        Ok(None)
    }
}

/// Summary of one segment file's valid prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentScan {
    /// Number of valid entries.
    pub entries: usize,
    pub first_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
    /// Length of the valid prefix of the file in bytes.
    pub valid_len: u64,
    /// Total file length in bytes.
    pub file_len: u64,
    /// Why reading stopped.
    pub stop: ScanStop,
}

/// Read through a single segment file without keeping its entries.
pub fn scan_segment(path: &Path) -> WalResult<SegmentScan> {
    let mut cursor = SegmentCursor::open(path)?;
    let mut entries = 0;
    let mut first_sequence = None;
    let mut last_sequence = None;

    while let Some(entry) = cursor.next_entry()? {
        entries += 1;
        first_sequence.get_or_insert(entry.sequence);
        last_sequence = Some(entry.sequence);
    }

    Ok(SegmentScan {
        entries,
        first_sequence,
        last_sequence,
        valid_len: cursor.valid_len(),
        file_len: cursor.file_len(),
        stop: cursor.stop().cloned().unwrap_or(ScanStop::Clean),
    })
}

// ---------------------------------------------------------------------------
// WalReader
// ---------------------------------------------------------------------------

/// A checkpoint found in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointMark {
    /// Sequence number of the checkpoint entry itself.
    pub sequence: u64,
    /// Every entry with sequence <= this value had reached the store.
    pub applied_through: u64,
}

/// Summary of the on-disk log, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalReport {
    /// Number of segment files.
    pub segments: usize,
    /// Valid entries readable by replay.
    pub entries: usize,
    /// Highest readable sequence number.
    pub last_sequence: Option<u64>,
    /// The most recent readable checkpoint.
    pub last_checkpoint: Option<CheckpointMark>,
    /// Segment name and offset where the readable log ends early.
    pub damage: Option<(String, u64)>,
    /// Total bytes on disk across all segments.
    pub total_bytes: u64,
}

/// Read-only view of a WAL directory. Every call rescans the segments.
pub struct WalReader {
    wal_dir: PathBuf,
}

impl WalReader {
    /// Fails if `wal_dir` is not a directory. Nothing is read yet.
    pub fn open(wal_dir: impl AsRef<Path>) -> WalResult<Self> {
        let wal_dir = wal_dir.as_ref().to_path_buf();
        if !wal_dir.is_dir() {
            return Err(WalError::DirectoryNotFound(wal_dir.display().to_string()));
        }
        Ok(Self { wal_dir })
    }

    /// Stream every readable entry with sequence >= `from_sequence`, in
    /// sequence order. Segments are opened one at a time as the iterator
    /// reaches them.
    pub fn replay_from(&self, from_sequence: u64) -> WalResult<WalEntryIterator> {
        let segments = list_segments(&self.wal_dir)?;
        debug!(segments = segments.len(), from_sequence, "Replaying WAL");
        Ok(WalEntryIterator {
            segments: segments.into(),
            cursor: None,
            from_sequence,
            last_sequence: None,
            damage: None,
            done: false,
        })
    }

    pub fn replay_all(&self) -> WalResult<WalEntryIterator> {
        self.replay_from(0)
    }

    /// Find the most recent readable checkpoint entry.
    ///
    /// Returns `None` if no checkpoint entries exist.
    pub fn find_last_checkpoint(&self) -> WalResult<Option<CheckpointMark>> {
        let mut last = None;
        for entry in self.replay_all()? {
            let entry = entry?;
            if let Some(applied_through) = entry.applied_through()? {
                last = Some(CheckpointMark {
                    sequence: entry.sequence,
                    applied_through,
                });
            }
        }
        Ok(last)
    }

    /// Count the total number of readable entries.
    pub fn entry_count(&self) -> WalResult<usize> {
        let mut count = 0;
        for entry in self.replay_all()? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Summarise the log without modifying it.
    pub fn inspect(&self) -> WalResult<WalReport> {
        let mut entries = self.replay_all()?;
        let mut report = WalReport {
            segments: entries.segments.len(),
            total_bytes: entries.segments.iter().map(|s| s.file_size).sum(),
            ..WalReport::default()
        };

        for entry in entries.by_ref() {
            let entry = entry?;
            report.entries += 1;
            report.last_sequence = Some(entry.sequence);
            if entry.operation == WalOperation::Checkpoint {
                if let Ok(Some(applied_through)) = entry.applied_through() {
                    report.last_checkpoint = Some(CheckpointMark {
                        sequence: entry.sequence,
                        applied_through,
                    });
                }
            }
        }
        report.damage = entries.damage().cloned();

        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// WalEntryIterator
// ---------------------------------------------------------------------------

/// Entries produced by a replay, lowest sequence first.
///
/// The iteration ends after the first damaged entry, or at a segment whose
/// first sequence does not follow the previous segment's last. An I/O error
/// is yielded once and also ends it.
pub struct WalEntryIterator {
    segments: VecDeque<SegmentInfo>,
    cursor: Option<(SegmentInfo, SegmentCursor)>,
    from_sequence: u64,
    last_sequence: Option<u64>,
    damage: Option<(String, u64)>,
    done: bool,
}

impl WalEntryIterator {
    /// Segment name and offset where the readable log ended early, once the
    /// iteration has reached it.
    pub fn damage(&self) -> Option<&(String, u64)> {
        self.damage.as_ref()
    }

    fn advance(&mut self) -> WalResult<Option<WalEntry>> {
        loop {
            if self.cursor.is_none() {
                let Some(segment) = self.segments.pop_front() else {
                    return Ok(None);
                };
                let cursor = SegmentCursor::open(&segment.path)?;
                self.cursor = Some((segment, cursor));
            }
            let Some((segment, cursor)) = self.cursor.as_mut() else {
                continue;
            };

            let Some(entry) = cursor.next_entry()? else {
                if let Some(ScanStop::Corrupt { offset, reason }) = cursor.stop() {
                    warn!(
                        segment = %segment.name(),
                        offset,
                        reason = %reason,
                        "WAL damaged, discarding every later entry"
                    );
                }
                if cursor.stop().is_some_and(|stop| !stop.is_clean()) {
                    self.damage = Some((segment.name(), cursor.valid_len()));
                    return Ok(None);
                }
                self.cursor = None;
                continue;
            };

            if let Some(previous) = self.last_sequence {
                if entry.sequence <= previous {
                    warn!(
                        segment = %segment.name(),
                        previous,
                        first = entry.sequence,
                        "WAL segment sequence regression, ignoring segment"
                    );
                    return Ok(None);
                }
            }
            self.last_sequence = Some(entry.sequence);

            if entry.sequence >= self.from_sequence {
                return Ok(Some(entry));
            }
        }
    }
}

impl Iterator for WalEntryIterator {
    type Item = WalResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(error) => {
                self.done = true;
                Some(Err(error))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tail repair
// ---------------------------------------------------------------------------

/// What `repair_tail` removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TailRepair {
    /// Bytes cut from the first damaged segment.
    pub truncated_bytes: u64,
    /// Whole segments deleted after the damaged one.
    pub removed_segments: usize,
}

impl TailRepair {
    /// Whether anything was changed on disk.
    pub fn is_noop(&self) -> bool {
        self.truncated_bytes == 0 && self.removed_segments == 0
    }
}

/// Physically cut the log back to its readable prefix.
///
/// The first damaged segment is truncated to its valid length and every
/// later segment is deleted, so new appends never follow unreadable bytes.
pub fn repair_tail(wal_dir: &Path) -> WalResult<TailRepair> {
    let segments = list_segments(wal_dir)?;
    let mut repair = TailRepair::default();
    let mut damaged_at: Option<usize> = None;

    for (index, segment) in segments.iter().enumerate() {
        let scan = scan_segment(&segment.path)?;
        if scan.stop.is_clean() {
            continue;
        }

        warn!(
            segment = %segment.name(),
            valid_len = scan.valid_len,
            file_len = scan.file_len,
            stop = ?scan.stop,
            "Truncating damaged WAL tail"
        );
        let file = OpenOptions::new().write(true).open(&segment.path)?;
        file.set_len(scan.valid_len)?;
        file.sync_all()?;
        repair.truncated_bytes = scan.file_len - scan.valid_len;
        damaged_at = Some(index);
        break;
    }

    if let Some(index) = damaged_at {
        for segment in &segments[index + 1..] {
            fs::remove_file(&segment.path)?;
            repair.removed_segments += 1;
        }
        if repair.removed_segments > 0 {
            sync_dir(wal_dir)?;
        }
    }

    if !repair.is_noop() {
        info!(
            truncated_bytes = repair.truncated_bytes,
            removed_segments = repair.removed_segments,
            "WAL tail repaired"
        );
    }

    Ok(repair)
}
