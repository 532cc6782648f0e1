// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ChronoTag Write-Ahead Log - Errors
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored and computed checksums differ: a torn write or bit rot.
    #[error("CRC mismatch at sequence {sequence}: stored {expected:#010x}, computed {actual:#010x}")]
    CrcMismatch {
        /// Read from the unverified body, so only a hint.
        sequence: u64,
        expected: u32,
        actual: u32,
    },

    #[error("entry of {length} bytes at offset {offset} exceeds the {max_length}-byte limit")]
    EntryTooLarge { offset: u64, length: u32, max_length: u32 },

    #[error("unknown operation byte {0}")]
    InvalidOperation(u8),

    #[error("timestamp {0} ms is out of range")]
    InvalidTimestamp(i64),

    /// Checkpoint payload is not an eight-byte sequence.
    #[error("malformed checkpoint payload at sequence {0}")]
    InvalidCheckpoint(u64),

    #[error("entity id is not UTF-8: {0}")]
    InvalidEntityId(#[from] std::string::FromUtf8Error),

    #[error("entry body has {0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("WAL directory not found: {0}")]
    DirectoryNotFound(String),

    /// A field runs past the end of the entry body.
    #[error("entry body ends early at offset {0}")]
    UnexpectedEof(u64),
}

pub type WalResult<T> = Result<T, WalError>;
