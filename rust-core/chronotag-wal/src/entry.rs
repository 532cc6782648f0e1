// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ChronoTag Write-Ahead Log - Entries and their frame codec
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Frame layout, little-endian throughout:
//
//   entry_length  u32   bytes that follow this field
//   crc32         u32   IEEE CRC of everything after this field
//   sequence      u64
//   timestamp     i64   Unix milliseconds, UTC
//   operation     u8    0 create, 1 update, 2 delete, 3 checkpoint
//   id_len        u32
//   entity_id     [u8; id_len]     UTF-8
//   payload_len   u32
//   payload       [u8; payload_len]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{WalError, WalResult};

/// Largest `entry_length` accepted on append or replay (1 GiB). Entries
/// carry whole entity content, so this bounds the engine's content limit.
pub const MAX_ENTRY_SIZE: u32 = 1024 * 1024 * 1024;

/// `entry_length` of an entry with an empty id and payload.
pub const MIN_ENTRY_LENGTH: u32 = 4 + 8 + 8 + 1 + 4 + 4;

/// What an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WalOperation {
    Create = 0,
    /// Tag-events and/or new content for an existing entity.
    Update = 1,
    /// Logical delete (tombstone).
    Delete = 2,
    /// Applied-through marker; carries no entity.
    Checkpoint = 3,
}

impl WalOperation {
    pub fn from_byte(byte: u8) -> WalResult<Self> {
        Ok(match byte {
            0 => Self::Create,
            1 => Self::Update,
            2 => Self::Delete,
            3 => Self::Checkpoint,
            other => return Err(WalError::InvalidOperation(other)),
        })
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn is_mutation(self) -> bool {
        self != Self::Checkpoint
    }
}

/// One logged record.
///
/// For mutations `payload` is whatever the engine encoded. A checkpoint
/// has an empty id and an eight-byte applied-through sequence as payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Assigned by [`crate::WalWriter::append`]; strictly increasing.
    pub sequence: u64,
    /// Wall-clock time of logging, kept to the millisecond on disk.
    pub timestamp: DateTime<Utc>,
    pub operation: WalOperation,
    pub entity_id: String,
    pub payload: Vec<u8>,
}

impl WalEntry {
    pub fn mutation(operation: WalOperation, entity_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            operation,
            entity_id: entity_id.into(),
            payload,
        }
    }

    /// Marker stating that every sequence `<= applied_through` is in the
    /// entity store.
    pub fn checkpoint(applied_through: u64) -> Self {
        Self::mutation(
            WalOperation::Checkpoint,
            String::new(),
            applied_through.to_le_bytes().to_vec(),
        )
    }

    /// The sequence a checkpoint vouches for; `None` for mutations.
    pub fn applied_through(&self) -> WalResult<Option<u64>> {
        if self.operation != WalOperation::Checkpoint {
            return Ok(None);
        }
        match <[u8; 8]>::try_from(self.payload.as_slice()) {
            Ok(bytes) => Ok(Some(u64::from_le_bytes(bytes))),
            Err(_) => Err(WalError::InvalidCheckpoint(self.sequence)),
        }
    }

    /// Encode the full frame, length prefix included.
    pub fn serialize(&self) -> Vec<u8> {
        let id = self.entity_id.as_bytes();
        let body_len = MIN_ENTRY_LENGTH as usize - 4 + id.len() + self.payload.len();

        let mut body = Vec::with_capacity(body_len);
        body.extend_from_slice(&self.sequence.to_le_bytes());
        body.extend_from_slice(&self.timestamp.timestamp_millis().to_le_bytes());
        body.push(self.operation.to_byte());
        for section in [id, self.payload.as_slice()] {
            body.extend_from_slice(&(section.len() as u32).to_le_bytes());
            body.extend_from_slice(section);
        }

        let mut frame = Vec::with_capacity(8 + body.len());
        frame.extend_from_slice(&((body.len() + 4) as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    /// Decode a frame whose length prefix was already read.
    ///
    /// `data` starts at the CRC and must hold at least `entry_length` bytes;
    /// anything past that is ignored.
    pub fn deserialize(data: &[u8], entry_length: u32) -> WalResult<Self> {
        let framed = data
            .get(..entry_length as usize)
            .filter(|framed| framed.len() >= 4)
            .ok_or(WalError::UnexpectedEof(data.len() as u64))?;
        let (crc, body) = framed.split_at(4);

        let stored = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(WalError::CrcMismatch {
                sequence: FieldReader::new(body).u64().unwrap_or(0),
                expected: stored,
                actual: computed,
            });
        }

        let mut fields = FieldReader::new(body);
        let sequence = fields.u64()?;
        let millis = fields.u64()? as i64;
        let timestamp =
            DateTime::<Utc>::from_timestamp_millis(millis).ok_or(WalError::InvalidTimestamp(millis))?;
        let operation = WalOperation::from_byte(fields.u8()?)?;
        let entity_id = String::from_utf8(fields.section()?.to_vec())?;
        let payload = fields.section()?.to_vec();
        fields.finish()?;

        Ok(Self {
            sequence,
            timestamp,
            operation,
            entity_id,
            payload,
        })
    }
}

/// Little-endian field reader over a CRC-checked body.
struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> WalResult<&'a [u8]> {
        let slice = self
            .pos
            .checked_add(len)
            .and_then(|end| self.data.get(self.pos..end))
            .ok_or(WalError::UnexpectedEof(self.pos as u64))?;
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> WalResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> WalResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> WalResult<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    /// A `u32` length followed by that many bytes.
    fn section(&mut self) -> WalResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }

    fn finish(&self) -> WalResult<()> {
        match self.data.len() - self.pos {
            0 => Ok(()),
            extra => Err(WalError::TrailingBytes(extra)),
        }
    }
}

/// Read a little-endian `u32` at `offset` of a frame.
#[cfg(test)]
pub(crate) fn read_u32(data: &[u8], offset: usize) -> WalResult<u32> {
    let mut reader = FieldReader::new(data);
    reader.pos = offset;
    reader.u32()
}
