// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Streaming validation scan of the entity data file.
//
// The file is read through a sliding window, so memory stays bounded by the
// largest record rather than the file. A record that fails validation is
// skipped when a valid record follows it somewhere later in the file;
// otherwise everything from it onwards is a torn tail.

use std::collections::HashMap;
use std::io::{self, Read};

use crate::chunker::ChunkKey;
use crate::error::StoreResult;
use crate::record::{decode_at, Decoded, RawRecord, RecordKind, FILE_HEADER_LEN, RECORD_MAGIC};
use crate::store::{CorruptSpan, Locator, StoredEntity};

/// Bytes pulled from the reader per refill.
const READ_CHUNK: usize = 1024 * 1024;

/// Outcome of a full validating scan.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StoreScan {
    /// Locator of the latest readable revision of every entity.
    pub entities: HashMap<String, Locator>,
    /// Locators of every readable chunk.
    pub chunks: HashMap<ChunkKey, Locator>,
    /// Records skipped because they failed validation.
    pub corrupt: Vec<CorruptSpan>,
    /// Bytes at the end of the file that are not a complete record.
    pub torn_tail: u64,
    /// Highest entity record sequence.
    pub watermark: u64,
}

/// Buffered view over the unread part of the file.
struct Window<R> {
    reader: R,
    buf: Vec<u8>,
    start: usize,
    /// File offset of `buf[start]`.
    offset: u64,
    eof: bool,
}

impl<R: Read> Window<R> {
    fn bytes(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    fn consume(&mut self, n: usize) {
        self.start += n;
        self.offset += n as u64;
    }

    /// Append up to `READ_CHUNK` more bytes; sets `eof` when none come.
    fn fill(&mut self) -> io::Result<()> {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        let filled = self.buf.len();
        self.buf.resize(filled + READ_CHUNK, 0);
        let read = loop {
            match self.reader.read(&mut self.buf[filled..]) {
                Ok(n) => break n,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    self.buf.truncate(filled);
                    return Err(error);
                }
            }
        };
        self.buf.truncate(filled + read);
        if read == 0 {
            self.eof = true;
        }
        Ok(())
    }
}

enum Step {
    Advance(usize),
    Fill,
    Damaged(String),
}

/// Scan the records `reader` yields. `start` is the file offset of the
/// reader's first byte, just past the header.
pub fn scan_records(reader: impl Read, start: u64) -> StoreResult<StoreScan> {
    let mut scan = StoreScan::default();
    let mut window = Window {
        reader,
        buf: Vec::new(),
        start: 0,
        offset: start,
        eof: false,
    };

    loop {
        if window.bytes().is_empty() {
            if window.eof {
                break;
            }
            window.fill()?;
            continue;
        }

        let step = match decode_at(window.bytes(), 0) {
            Decoded::Record(raw) => {
                let locator = Locator {
                    offset: window.offset,
                    length: raw.encoded_len as u32,
                    sequence: raw.sequence,
                };
                if let Err(reason) = collect_record(&mut scan, raw, locator) {
                    scan.corrupt.push(CorruptSpan {
                        offset: window.offset,
                        length: raw.encoded_len as u64,
                        reason,
                    });
                }
                Step::Advance(raw.encoded_len)
            }
            Decoded::Incomplete if !window.eof => Step::Fill,
            Decoded::Incomplete => Step::Damaged("incomplete record".to_string()),
            Decoded::Corrupt(reason) => Step::Damaged(reason),
        };

        match step {
            Step::Advance(len) => window.consume(len),
            Step::Fill => window.fill()?,
            Step::Damaged(reason) => {
                let damaged_at = window.offset;
                window.consume(1);
                if resync(&mut window)? {
                    scan.corrupt.push(CorruptSpan {
                        offset: damaged_at,
                        length: window.offset - damaged_at,
                        reason,
                    });
                } else {
                    scan.torn_tail = window.offset + window.bytes().len() as u64 - damaged_at;
                    break;
                }
            }
        }
    }

    Ok(scan)
}

/// Advance the window to the next valid record. `false` means none is left
/// before end of file.
fn resync<R: Read>(window: &mut Window<R>) -> io::Result<bool> {
    let magic = RECORD_MAGIC.to_le_bytes();
    loop {
        let found = window.bytes().windows(4).position(|w| w == magic);
        let Some(position) = found else {
            if window.eof {
                return Ok(false);
            }
            // Keep a partial magic that may straddle the refill.
            let keep = window.bytes().len().min(magic.len() - 1);
            window.consume(window.bytes().len() - keep);
            window.fill()?;
            continue;
        };

        window.consume(position);
        match decode_at(window.bytes(), 0) {
            Decoded::Record(_) => return Ok(true),
            Decoded::Incomplete if !window.eof => window.fill()?,
            _ => window.consume(1),
        }
    }
}

/// Scan a whole data file image, header included.
pub fn scan_bytes(data: &[u8]) -> StoreResult<StoreScan> {
    scan_records(data.get(FILE_HEADER_LEN..).unwrap_or_default(), FILE_HEADER_LEN as u64)
}

fn collect_record(scan: &mut StoreScan, raw: RawRecord<'_>, locator: Locator) -> Result<(), String> {
    let body = raw.payload()?;
    match raw.kind {
        RecordKind::Entity => {
            let entity: StoredEntity = postcard::from_bytes(&body).map_err(|e| e.to_string())?;
            if entity.id != raw.id {
                return Err("entity id does not match record header".to_string());
            }
            let newer = scan
                .entities
                .get(raw.id)
                .map_or(true, |existing| existing.sequence <= raw.sequence);
            if newer {
                scan.entities.insert(raw.id.to_string(), locator);
            }
            scan.watermark = scan.watermark.max(raw.sequence);
        }
        RecordKind::Chunk => {
            let (key, _): (ChunkKey, _) =
                postcard::take_from_bytes(&body).map_err(|e| e.to_string())?;
            if key.parent_id != raw.id || key.generation != raw.sequence {
                return Err("chunk key does not match record header".to_string());
            }
            scan.chunks.insert(key, locator);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{encode_record, file_header};
    use chronotag_index::{Tag, TagEvent, Timestamp};

    fn entity_record(id: &str, seq: u64) -> Vec<u8> {
        let mut entity = StoredEntity::new(id);
        let event = TagEvent::assert(Timestamp(seq as i64), Tag::parse("type:doc").unwrap());
        entity.history.record(seq, Timestamp(seq as i64), &[event]);
        encode_record(RecordKind::Entity, seq, id, &postcard::to_allocvec(&entity).unwrap()).unwrap()
    }

    /// Hands out at most `step` bytes per read, to exercise window refills.
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    fn image(records: &[Vec<u8>]) -> Vec<u8> {
        let mut data = file_header().to_vec();
        for record in records {
            data.extend_from_slice(record);
        }
        data
    }

    #[test]
    fn test_records_split_across_reads_are_found() {
        let data = image(&[entity_record("a", 1), entity_record("b", 2), entity_record("a", 3)]);
        let scan = scan_records(
            Trickle {
                data: &data[FILE_HEADER_LEN..],
                step: 7,
            },
            FILE_HEADER_LEN as u64,
        )
        .unwrap();

        assert_eq!(scan.entities.len(), 2);
        assert_eq!(scan.entities["a"].sequence, 3);
        assert_eq!(scan.watermark, 3);
        assert!(scan.corrupt.is_empty());
        assert_eq!(scan, scan_bytes(&data).unwrap());
    }

    #[test]
    fn test_garbage_between_records_is_one_span() {
        let first = entity_record("a", 1);
        let mut data = image(&[first.clone()]);
        let garbage_at = data.len() as u64;
        data.extend_from_slice(&[0xEE; 37]);
        // A lone magic inside the garbage must not end the span early.
        data.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        data.extend_from_slice(&[0xEE; 5]);
        let second_at = data.len() as u64;
        data.extend_from_slice(&entity_record("b", 2));

        let scan = scan_records(
            Trickle {
                data: &data[FILE_HEADER_LEN..],
                step: 3,
            },
            FILE_HEADER_LEN as u64,
        )
        .unwrap();
        assert_eq!(scan.corrupt.len(), 1);
        assert_eq!(scan.corrupt[0].offset, garbage_at);
        assert_eq!(scan.corrupt[0].length, second_at - garbage_at);
        assert_eq!(scan.entities["b"].offset, second_at);
        assert_eq!(scan.torn_tail, 0);
    }

    #[test]
    fn test_unfinished_record_is_a_torn_tail() {
        let second = entity_record("b", 2);
        let mut data = image(&[entity_record("a", 1)]);
        data.extend_from_slice(&second[..second.len() - 4]);

        let scan = scan_bytes(&data).unwrap();
        assert_eq!(scan.torn_tail, (second.len() - 4) as u64);
        assert!(scan.corrupt.is_empty());
        assert_eq!(scan.entities.len(), 1);
    }

    #[test]
    fn test_image_shorter_than_header_scans_empty() {
        let scan = scan_bytes(b"CTSF").unwrap();
        assert!(scan.entities.is_empty());
        assert_eq!(scan.torn_tail, 0);
    }
}
