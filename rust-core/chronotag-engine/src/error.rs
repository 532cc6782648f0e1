// SPDX-License-Identifier: PMPL-1.0-or-later
//! Engine error taxonomy

use std::path::PathBuf;

use chronotag_index::{IndexError, Timestamp};
use chronotag_store::StoreError;
use chronotag_wal::WalError;
use thiserror::Error;

use crate::recovery::EngineState;

/// Errors returned by [`crate::Engine`] operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Entity already exists: {0}")]
    DuplicateId(String),

    #[error("Invalid entity id {0:?}")]
    InvalidEntityId(String),

    #[error("Corrupt record at offset {offset}: {reason}")]
    CorruptRecord { offset: u64, reason: String },

    #[error("Corrupt content for {entity_id}: {reason}")]
    CorruptContent { entity_id: String, reason: String },

    /// The write was not made durable and was not acknowledged.
    #[error("WAL write failed: {0}")]
    WalWriteFailure(#[source] WalError),

    #[error("Index is stale: {0}")]
    IndexStale(String),

    #[error("Invalid tag {tag:?}: {reason}")]
    InvalidTag { tag: String, reason: &'static str },

    #[error("Timestamp {timestamp} for {entity_id} is older than its last event at {last}")]
    InvalidTimestamp {
        entity_id: String,
        timestamp: Timestamp,
        last: Timestamp,
    },

    #[error("Invalid time range: {from} is after {to}")]
    InvalidTimeRange { from: Timestamp, to: Timestamp },

    /// A request or WAL payload that describes no valid state change.
    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("Content of {size} bytes exceeds the {max} byte limit")]
    ContentTooLarge { size: u64, max: u64 },

    /// Another engine holds the data directory.
    #[error("Data directory {} is locked by another engine", .0.display())]
    DirectoryLocked(PathBuf),

    #[error("Engine is not ready (state: {0})")]
    NotReady(EngineState),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Index error: {0}")]
    Index(IndexError),

    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("Mutation encoding failed: {0}")]
    Encoding(#[from] postcard::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lock poisoned: internal concurrency error")]
    LockPoisoned,
}

impl EngineError {
    /// Whether the error reports damaged or diverged durable state. An API
    /// layer must surface these as server failures, never as partial data.
    pub fn is_corruption(&self) -> bool {
        match self {
            EngineError::CorruptRecord { .. }
            | EngineError::CorruptContent { .. }
            | EngineError::WalWriteFailure(_)
            | EngineError::IndexStale(_) => true,
            EngineError::Store(error) => error.is_corruption(),
            _ => false,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::CorruptRecord { offset, reason } => {
                EngineError::CorruptRecord { offset, reason }
            }
            StoreError::CorruptContent { entity_id, reason } => {
                EngineError::CorruptContent { entity_id, reason }
            }
            StoreError::InvalidConfig(message) => EngineError::Config(message),
            StoreError::LockPoisoned => EngineError::LockPoisoned,
            other => EngineError::Store(other),
        }
    }
}

impl From<IndexError> for EngineError {
    fn from(error: IndexError) -> Self {
        match error {
            IndexError::NotFound(id) => EngineError::NotFound(id),
            IndexError::InvalidTag { tag, reason } => EngineError::InvalidTag { tag, reason },
            IndexError::InvalidTimeRange { from, to } => EngineError::InvalidTimeRange { from, to },
            other => EngineError::Index(other),
        }
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_maps_to_not_found() {
        let err: EngineError = StoreError::NotFound("e1".to_string()).into();
        assert!(matches!(err, EngineError::NotFound(ref id) if id == "e1"));
        assert!(!err.is_corruption());
    }

    #[test]
    fn test_corruption_classification() {
        let err: EngineError = StoreError::CorruptContent {
            entity_id: "e1".to_string(),
            reason: "SHA-256 mismatch".to_string(),
        }
        .into();
        assert!(err.is_corruption());
        assert!(EngineError::IndexStale("diverged".to_string()).is_corruption());
        assert!(!EngineError::DuplicateId("e1".to_string()).is_corruption());
        assert!(!EngineError::NotReady(EngineState::Starting).is_corruption());
    }

    #[test]
    fn test_index_time_range_maps_through() {
        let err: EngineError = IndexError::InvalidTimeRange {
            from: Timestamp(2),
            to: Timestamp(1),
        }
        .into();
        assert!(matches!(err, EngineError::InvalidTimeRange { .. }));
    }

    #[test]
    fn test_rejections_are_not_corruption() {
        let locked = EngineError::DirectoryLocked(PathBuf::from("/data"));
        assert!(!locked.is_corruption());
        assert!(locked.to_string().contains("/data"));

        let large = EngineError::ContentTooLarge { size: 11, max: 10 };
        assert!(!large.is_corruption());
        assert_eq!(large.to_string(), "Content of 11 bytes exceeds the 10 byte limit");
    }
}
