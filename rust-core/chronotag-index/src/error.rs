// SPDX-License-Identifier: PMPL-1.0-or-later
//! Index error types

use thiserror::Error;

use crate::tag::Timestamp;

/// Errors raised by the tag and temporal indexes.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Invalid tag {tag:?}: {reason}")]
    InvalidTag { tag: String, reason: &'static str },

    #[error("Invalid time range: {from} is after {to}")]
    InvalidTimeRange { from: Timestamp, to: Timestamp },

    #[error("Index snapshot is corrupt: {0}")]
    SnapshotCorrupt(String),

    #[error("Unsupported index snapshot version {0}")]
    SnapshotVersion(u32),

    #[error("Index snapshot encoding failed: {0}")]
    Encoding(#[from] postcard::Error),

    #[error("Index snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for index operations.
pub type IndexResult<T> = Result<T, IndexError>;
