// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Error types for the binary entity store and content chunker.

use thiserror::Error;

/// Errors that can occur when reading or writing the entity store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred in the data file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No live record exists for the entity or chunk.
    #[error("not found: {0}")]
    NotFound(String),

    /// A record failed its checksum or could not be decoded.
    #[error("corrupt record at offset {offset}: {reason}")]
    CorruptRecord {
        /// Byte offset of the record in the data file.
        offset: u64,
        /// What failed.
        reason: String,
    },

    /// Chunked content could not be reassembled exactly.
    #[error("corrupt content for {entity_id}: {reason}")]
    CorruptContent {
        /// The entity whose content failed verification.
        entity_id: String,
        /// What failed.
        reason: String,
    },

    /// The data file does not start with a valid store header.
    #[error("invalid data file header: {0}")]
    BadHeader(String),

    /// A record would exceed the maximum encodable size.
    #[error("record too large: {size} bytes (max: {max})")]
    RecordTooLarge {
        /// Encoded record size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Failed to serialize or deserialize a record body.
    #[error("serialization error: {0}")]
    Encoding(#[from] postcard::Error),

    /// Chunking parameters are unusable.
    #[error("invalid chunk configuration: {0}")]
    InvalidConfig(String),

    /// A lock was poisoned by a panicking thread.
    #[error("lock poisoned: internal concurrency error")]
    LockPoisoned,
}

impl StoreError {
    /// Whether the error reports damaged data rather than a missing key or
    /// an environmental failure.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::CorruptRecord { .. }
                | StoreError::CorruptContent { .. }
                | StoreError::BadHeader(_)
        )
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
