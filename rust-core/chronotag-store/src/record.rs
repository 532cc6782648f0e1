// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Self-describing record codec for the entity data file.
//
// Data file layout:
//
//   [16 bytes: file header]  "CTSF" + u32 version + 8 reserved bytes
//   [record]*
//
// Record layout (all integers little-endian):
//
//   [4 bytes: magic (u32)]        -- RECORD_MAGIC, used to resynchronise
//   [4 bytes: length (u32)]       -- length of everything after this field
//   [4 bytes: crc32]              -- CRC32 of everything after this field
//   [1 byte:  kind]               -- 1=Entity, 2=Chunk; high bit set when compressed
//   [8 bytes: sequence (u64)]     -- WAL sequence that produced the record
//   [4 bytes: id_len (u32)]
//   [N bytes: id]                 -- entity id (chunk parent id for chunks)
//   [4 bytes: body_len (u32)]
//   [M bytes: body]               -- postcard-encoded payload
//
// A compressed body is a u32 uncompressed length followed by one zstd
// frame. Bodies are compressed only from COMPRESSION_THRESHOLD bytes up and
// only when that makes them smaller.

use std::borrow::Cow;

use tracing::trace;

use crate::error::{StoreError, StoreResult};

/// Marks the start of every record ("CTRE" read little-endian).
pub const RECORD_MAGIC: u32 = u32::from_le_bytes(*b"CTRE");

/// Data file magic.
pub const FILE_MAGIC: &[u8; 4] = b"CTSF";

/// Data file format version.
pub const FILE_VERSION: u32 = 1;

/// Size of the data file header.
pub const FILE_HEADER_LEN: usize = 16;

/// Bytes before the CRC-protected section (magic + length).
pub const RECORD_PREFIX_LEN: usize = 8;

/// Smallest legal `length` field: crc, kind, sequence and two empty
/// length-prefixed sections.
pub const MIN_RECORD_LENGTH: u32 = 4 + 1 + 8 + 4 + 4;

/// Largest accepted `length` field (256 MiB).
pub const MAX_RECORD_LENGTH: u32 = 256 * 1024 * 1024;

/// Bodies shorter than this are never compressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Kind-byte flag marking a compressed body.
const COMPRESSED_FLAG: u8 = 0x80;

const COMPRESSION_LEVEL: i32 = 3;

/// What a record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// A full entity revision.
    Entity = 1,
    /// One content chunk.
    Chunk = 2,
}

impl RecordKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Entity),
            2 => Some(Self::Chunk),
            _ => None,
        }
    }
}

/// A validated record borrowed from a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRecord<'a> {
    pub kind: RecordKind,
    pub sequence: u64,
    pub id: &'a str,
    /// Body as stored; see [`RawRecord::payload`].
    pub body: &'a [u8],
    pub compressed: bool,
    /// Total encoded length including magic and length fields.
    pub encoded_len: usize,
}

impl<'a> RawRecord<'a> {
    /// The body as it was written, decompressed if needed.
    pub fn payload(&self) -> Result<Cow<'a, [u8]>, String> {
        if !self.compressed {
            return Ok(Cow::Borrowed(self.body));
        }
        let raw_len = u32_at(self.body, 0).ok_or("compressed body has no length")? as usize;
        if raw_len > MAX_RECORD_LENGTH as usize {
            return Err(format!("implausible uncompressed length {raw_len}"));
        }
        let payload = zstd::bulk::decompress(&self.body[4..], raw_len)
            .map_err(|e| format!("decompression failed: {e}"))?;
        if payload.len() != raw_len {
            return Err(format!(
                "decompressed {} bytes, expected {raw_len}",
                payload.len()
            ));
        }
        Ok(Cow::Owned(payload))
    }
}

/// Result of decoding at an offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<'a> {
    /// A complete, checksum-valid record.
    Record(RawRecord<'a>),
    /// The buffer ends before the record does.
    Incomplete,
    /// The bytes at the offset are not a valid record.
    Corrupt(String),
}

/// The 16-byte data file header.
pub fn file_header() -> [u8; FILE_HEADER_LEN] {
    let mut header = [0u8; FILE_HEADER_LEN];
    header[0..4].copy_from_slice(FILE_MAGIC);
    header[4..8].copy_from_slice(&FILE_VERSION.to_le_bytes());
    header
}

/// Validate a data file header.
pub fn check_file_header(data: &[u8]) -> StoreResult<()> {
    if data.len() < FILE_HEADER_LEN {
        return Err(StoreError::BadHeader("file shorter than header".to_string()));
    }
    if &data[0..4] != FILE_MAGIC {
        return Err(StoreError::BadHeader("bad magic".to_string()));
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != FILE_VERSION {
        return Err(StoreError::BadHeader(format!("unsupported version {version}")));
    }
    Ok(())
}

/// Encode one record, compressing the body when that pays off.
pub fn encode_record(
    kind: RecordKind,
    sequence: u64,
    id: &str,
    body: &[u8],
) -> StoreResult<Vec<u8>> {
    let fixed_len = 4 + 1 + 8 + 4 + id.len() + 4;
    if fixed_len + body.len() > MAX_RECORD_LENGTH as usize {
        return Err(StoreError::RecordTooLarge {
            size: fixed_len + body.len(),
            max: MAX_RECORD_LENGTH as usize,
        });
    }

    let (kind_byte, body) = match compress_body(body)? {
        Some(compressed) => (kind as u8 | COMPRESSED_FLAG, Cow::Owned(compressed)),
        None => (kind as u8, Cow::Borrowed(body)),
    };
    let length = fixed_len + body.len();
    let inner_len = length - 4;

    let mut inner = Vec::with_capacity(inner_len);
    inner.push(kind_byte);
    inner.extend_from_slice(&sequence.to_le_bytes());
    inner.extend_from_slice(&(id.len() as u32).to_le_bytes());
    inner.extend_from_slice(id.as_bytes());
    inner.extend_from_slice(&(body.len() as u32).to_le_bytes());
    inner.extend_from_slice(&body);

    let mut buffer = Vec::with_capacity(RECORD_PREFIX_LEN + length);
    buffer.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
    buffer.extend_from_slice(&(length as u32).to_le_bytes());
    buffer.extend_from_slice(&crc32fast::hash(&inner).to_le_bytes());
    buffer.extend_from_slice(&inner);
    Ok(buffer)
}

/// Decode the record starting at `offset`.
pub fn decode_at(data: &[u8], offset: usize) -> Decoded<'_> {
    let Some(rest) = data.get(offset..) else {
        return Decoded::Incomplete;
    };
    if rest.len() < RECORD_PREFIX_LEN {
        return Decoded::Incomplete;
    }

    let magic = u32_at(rest, 0).unwrap_or_default();
    if magic != RECORD_MAGIC {
        return Decoded::Corrupt(format!("bad record magic {magic:#010x}"));
    }
    let length = u32_at(rest, 4).unwrap_or_default();
    if !(MIN_RECORD_LENGTH..=MAX_RECORD_LENGTH).contains(&length) {
        return Decoded::Corrupt(format!("implausible record length {length}"));
    }
    let end = RECORD_PREFIX_LEN + length as usize;
    let Some(framed) = rest.get(RECORD_PREFIX_LEN..end) else {
        return Decoded::Incomplete;
    };

    let stored_crc = u32_at(framed, 0).unwrap_or_default();
    let inner = &framed[4..];
    let actual_crc = crc32fast::hash(inner);
    if stored_crc != actual_crc {
        return Decoded::Corrupt(format!(
            "checksum mismatch: stored {stored_crc:#010x}, computed {actual_crc:#010x}"
        ));
    }

    match parse_inner(inner) {
        Some((kind_byte, sequence, id, body)) => {
            let compressed = kind_byte & COMPRESSED_FLAG != 0;
            match RecordKind::from_byte(kind_byte & !COMPRESSED_FLAG) {
                Some(kind) if !compressed || body.len() >= 4 => Decoded::Record(RawRecord {
                    kind,
                    sequence,
                    id,
                    body,
                    compressed,
                    encoded_len: end,
                }),
                _ => Decoded::Corrupt(format!("bad record kind {kind_byte:#04x}")),
            }
        }
        None => Decoded::Corrupt("malformed record fields".to_string()),
    }
}

/// `Some` holds `[raw_len][zstd frame]` when it is smaller than `body`.
fn compress_body(body: &[u8]) -> StoreResult<Option<Vec<u8>>> {
    if body.len() < COMPRESSION_THRESHOLD {
        return Ok(None);
    }
    let frame = zstd::bulk::compress(body, COMPRESSION_LEVEL)?;
    if frame.len() + 4 >= body.len() {
        trace!(size = body.len(), compressed = frame.len(), "Compression not beneficial");
        return Ok(None);
    }

    let mut stored = Vec::with_capacity(4 + frame.len());
    stored.extend_from_slice(&(body.len() as u32).to_le_bytes());
    stored.extend_from_slice(&frame);
    trace!(size = body.len(), compressed = stored.len(), "Compressed record body");
    Ok(Some(stored))
}

fn parse_inner(inner: &[u8]) -> Option<(u8, u64, &str, &[u8])> {
    let kind = *inner.first()?;
    let sequence = u64::from_le_bytes(inner.get(1..9)?.try_into().ok()?);
    let id_len = u32_at(inner, 9)? as usize;
    let id_end = 13usize.checked_add(id_len)?;
    let id = std::str::from_utf8(inner.get(13..id_end)?).ok()?;
    let body_len = u32_at(inner, id_end)? as usize;
    let body_start = id_end + 4;
    let body_end = body_start.checked_add(body_len)?;
    if body_end != inner.len() {
        return None;
    }
    Some((kind, sequence, id, &inner[body_start..body_end]))
}

fn u32_at(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}
