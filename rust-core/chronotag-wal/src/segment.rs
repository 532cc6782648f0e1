// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ChronoTag Write-Ahead Log - Segment files
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A segment is named after the first sequence it may hold:
// `wal-{first_sequence:016}.log`. Only the newest segment is ever appended
// to. Older ones are deleted once a checkpoint shows the store holds every
// entry in them.

use std::cmp::Ordering;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{WalError, WalResult};

/// Size at which the writer starts a new segment (64 MiB).
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

const NAME_PREFIX: &str = "wal-";
const NAME_SUFFIX: &str = ".log";

/// A segment file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub path: PathBuf,
    /// Lower bound on the sequences stored in this segment.
    pub start_sequence: u64,
    pub file_size: u64,
}

impl SegmentInfo {
    /// Bare file name, for log fields and reports.
    pub fn name(&self) -> String {
        match self.path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => self.path.display().to_string(),
        }
    }
}

impl PartialOrd for SegmentInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SegmentInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start_sequence
            .cmp(&other.start_sequence)
            .then_with(|| self.path.cmp(&other.path))
    }
}

/// Path of the segment whose first sequence is `start_sequence`.
pub fn segment_path(wal_dir: &Path, start_sequence: u64) -> PathBuf {
    wal_dir.join(format!("{NAME_PREFIX}{start_sequence:016}{NAME_SUFFIX}"))
}

fn start_sequence_of(file_name: &str) -> Option<u64> {
    let digits = file_name
        .strip_prefix(NAME_PREFIX)?
        .strip_suffix(NAME_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Every segment in `wal_dir`, oldest first. Other files are ignored.
pub fn list_segments(wal_dir: &Path) -> WalResult<Vec<SegmentInfo>> {
    if !wal_dir.is_dir() {
        return Err(WalError::DirectoryNotFound(wal_dir.display().to_string()));
    }

    let mut found = Vec::new();
    for item in fs::read_dir(wal_dir)? {
        let item = item?;
        let Some(start_sequence) = item.file_name().to_str().and_then(start_sequence_of) else {
            continue;
        };
        found.push(SegmentInfo {
            path: item.path(),
            start_sequence,
            file_size: item.metadata()?.len(),
        });
    }
    found.sort();

    debug!(dir = %wal_dir.display(), segments = found.len(), "Listed WAL segments");
    Ok(found)
}

/// `fsync` a directory so entries created, renamed or removed in it survive
/// a crash. Directories cannot be opened for syncing on Windows.
pub fn sync_dir(dir: &Path) -> WalResult<()> {
    if cfg!(unix) {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

/// Delete the segments holding only sequences `<= applied_through`.
///
/// A segment ends where its successor starts, so it may go once the
/// successor's first sequence is at most `applied_through + 1`. The last
/// segment is the writer's and always stays. Returns how many were deleted.
pub fn prune_through(wal_dir: &Path, applied_through: u64) -> WalResult<usize> {
    let segments = list_segments(wal_dir)?;
    let boundary = applied_through.saturating_add(1);

    let doomed: Vec<&SegmentInfo> = segments
        .iter()
        .zip(segments.iter().skip(1))
        .take_while(|(_, successor)| successor.start_sequence <= boundary)
        .map(|(segment, _)| segment)
        .collect();

    for segment in &doomed {
        debug!(segment = %segment.name(), applied_through, "Removing applied WAL segment");
        fs::remove_file(&segment.path)?;
    }
    if !doomed.is_empty() {
        sync_dir(wal_dir)?;
    }
    Ok(doomed.len())
}
