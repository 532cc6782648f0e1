// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Append-only binary entity store.
//
// Every put appends a full entity revision to `entities.dat`; nothing is
// edited in place. The in-memory locator tables are swapped only after the
// append completes, so a reader sees either the previous or the new
// revision, never a torn one. Opening the store scans the file end to end,
// truncates a torn tail and reports damaged records found before it.
//
// Reads use positioned I/O on a shared handle, so they run concurrently
// with each other and with appends. Compaction swaps that handle.
//
// Lock order: writer, then reader, then locator tables.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use chronotag_index::{EntityHistory, TagEvent};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chunker::{ChunkKey, ChunkManifest, ChunkRecord};
use crate::error::{StoreError, StoreResult};
use crate::record::{
    check_file_header, decode_at, encode_record, file_header, Decoded, RecordKind,
    FILE_HEADER_LEN,
};
use crate::scan::{scan_records, StoreScan};

/// File name of the data file inside the store directory.
pub const DATA_FILE: &str = "entities.dat";

// ---------------------------------------------------------------------------
// Stored types
// ---------------------------------------------------------------------------

/// An entity's payload as persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredContent {
    #[default]
    None,
    /// Small payloads live in the entity record itself.
    Inline(Vec<u8>),
    /// Large payloads are split into chunk records.
    Chunked(ChunkManifest),
}

impl StoredContent {
    pub fn is_none(&self) -> bool {
        matches!(self, StoredContent::None)
    }

    /// Payload length in bytes.
    pub fn len(&self) -> u64 {
        match self {
            StoredContent::None => 0,
            StoredContent::Inline(bytes) => bytes.len() as u64,
            StoredContent::Chunked(manifest) => manifest.total_len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One entity revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntity {
    pub id: String,
    pub history: EntityHistory,
    pub content: StoredContent,
}

impl StoredEntity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            history: EntityHistory::default(),
            content: StoredContent::None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.history.is_deleted()
    }
}

/// Where the latest revision of a record lives in the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub offset: u64,
    pub length: u32,
    pub sequence: u64,
}

/// A damaged byte range skipped while scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptSpan {
    pub offset: u64,
    pub length: u64,
    pub reason: String,
}

/// What opening the store found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenReport {
    pub records: usize,
    pub truncated_bytes: u64,
    pub corrupt: Vec<CorruptSpan>,
}

/// Counters describing the data file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub entities: usize,
    pub chunks: usize,
    pub file_bytes: u64,
    pub watermark: u64,
}

/// Result of `compact`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactReport {
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub entities: usize,
    pub chunks: usize,
    /// Chunks referenced by a manifest but absent from the file.
    pub missing_chunks: usize,
}

// ---------------------------------------------------------------------------
// EntityStore
// ---------------------------------------------------------------------------

struct Appender {
    file: File,
    len: u64,
}

/// The binary entity store.
pub struct EntityStore {
    path: PathBuf,
    writer: Mutex<Appender>,
    reader: RwLock<File>,
    entities: RwLock<HashMap<String, Locator>>,
    chunks: RwLock<HashMap<ChunkKey, Locator>>,
    watermark: AtomicU64,
    open_report: OpenReport,
}

impl EntityStore {
    /// Open or create the store in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(DATA_FILE);

        let mut file_len = match fs::metadata(&path) {
            Ok(metadata) => metadata.len(),
            Err(error) if error.kind() == io::ErrorKind::NotFound => 0,
            Err(error) => return Err(error.into()),
        };

        // A file shorter than its header was torn while being created.
        if file_len < FILE_HEADER_LEN as u64 {
            let existing = if file_len > 0 { fs::read(&path)? } else { Vec::new() };
            if file_header().starts_with(&existing) {
                let mut file = File::create(&path)?;
                file.write_all(&file_header())?;
                file.sync_all()?;
                sync_dir(dir)?;
                file_len = FILE_HEADER_LEN as u64;
                info!(path = %path.display(), "Initialized entity store");
            }
        }

        let mut source = File::open(&path)?;
        let mut header = Vec::with_capacity(FILE_HEADER_LEN);
        (&mut source).take(FILE_HEADER_LEN as u64).read_to_end(&mut header)?;
        check_file_header(&header)?;

        let body_len = file_len.saturating_sub(FILE_HEADER_LEN as u64);
        let scan = scan_records(source.take(body_len), FILE_HEADER_LEN as u64)?;
        let valid_end = file_len - scan.torn_tail;

        let file = OpenOptions::new().read(true).append(true).open(&path)?;
        if scan.torn_tail > 0 {
            warn!(
                path = %path.display(),
                torn_bytes = scan.torn_tail,
                "Truncating torn tail of entity store"
            );
            file.set_len(valid_end)?;
            file.sync_all()?;
        }
        for span in &scan.corrupt {
            warn!(
                offset = span.offset,
                length = span.length,
                reason = %span.reason,
                "Corrupt record in entity store"
            );
        }

        let open_report = OpenReport {
            records: scan.entities.len() + scan.chunks.len(),
            truncated_bytes: scan.torn_tail,
            corrupt: scan.corrupt,
        };

        info!(
            path = %path.display(),
            entities = scan.entities.len(),
            chunks = scan.chunks.len(),
            watermark = scan.watermark,
            "Opened entity store"
        );

        Ok(Self {
            reader: RwLock::new(File::open(&path)?),
            writer: Mutex::new(Appender {
                file,
                len: valid_end,
            }),
            entities: RwLock::new(scan.entities),
            chunks: RwLock::new(scan.chunks),
            watermark: AtomicU64::new(scan.watermark),
            path,
            open_report,
        })
    }

    /// What was found when the store was opened.
    pub fn open_report(&self) -> &OpenReport {
        &self.open_report
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a new revision of an entity produced by WAL `sequence`.
    pub fn put(&self, entity: &StoredEntity, sequence: u64) -> StoreResult<Locator> {
        let body = postcard::to_allocvec(entity)?;
        let locator = self.append(RecordKind::Entity, sequence, &entity.id, &body)?;

        self.entities
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .insert(entity.id.clone(), locator);
        self.watermark.fetch_max(sequence, Ordering::AcqRel);

        debug!(entity_id = %entity.id, sequence, offset = locator.offset, "Stored entity revision");
        Ok(locator)
    }

    /// Latest revision of an entity, tombstoned or not.
    pub fn get(&self, id: &str) -> StoreResult<StoredEntity> {
        // The reader guard keeps compaction from moving the record between
        // the locator lookup and the read.
        let reader = self.reader.read().map_err(|_| StoreError::LockPoisoned)?;
        let locator = self
            .locator(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let body = read_body(&reader, locator, RecordKind::Entity, id)?;
        drop(reader);

        let entity: StoredEntity = postcard::from_bytes(&body).map_err(|e| StoreError::CorruptRecord {
            offset: locator.offset,
            reason: e.to_string(),
        })?;
        Ok(entity)
    }

    /// Append a tombstoned revision and return it. The payload is dropped
    /// so compaction can reclaim it.
    pub fn delete(&self, id: &str, tombstone: TagEvent, sequence: u64) -> StoreResult<StoredEntity> {
        let mut entity = self.get(id)?;
        entity
            .history
            .record(sequence, tombstone.timestamp, std::slice::from_ref(&tombstone));
        entity.content = StoredContent::None;
        self.put(&entity, sequence)?;
        Ok(entity)
    }

    pub fn contains(&self, id: &str) -> StoreResult<bool> {
        Ok(self
            .entities
            .read()
            .map_err(|_| StoreError::LockPoisoned)?
            .contains_key(id))
    }

    pub fn locator(&self, id: &str) -> StoreResult<Option<Locator>> {
        Ok(self
            .entities
            .read()
            .map_err(|_| StoreError::LockPoisoned)?
            .get(id)
            .copied())
    }

    /// Every stored entity id with its locator, sorted by id.
    pub fn locators(&self) -> StoreResult<Vec<(String, Locator)>> {
        let mut locators: Vec<(String, Locator)> = self
            .entities
            .read()
            .map_err(|_| StoreError::LockPoisoned)?
            .iter()
            .map(|(id, locator)| (id.clone(), *locator))
            .collect();
        locators.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(locators)
    }

    /// Append one content chunk. Its generation is the record sequence.
    pub fn put_chunk(&self, chunk: &ChunkRecord) -> StoreResult<Locator> {
        let body = postcard::to_allocvec(chunk)?;
        let locator = self.append(RecordKind::Chunk, chunk.generation, &chunk.parent_id, &body)?;
        self.chunks
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .insert(chunk.key(), locator);
        Ok(locator)
    }

    /// Read one chunk record.
    pub fn get_chunk(&self, key: &ChunkKey) -> StoreResult<ChunkRecord> {
        let reader = self.reader.read().map_err(|_| StoreError::LockPoisoned)?;
        let located = self
            .chunks
            .read()
            .map_err(|_| StoreError::LockPoisoned)?
            .get(key)
            .copied();
        let locator = located.ok_or_else(|| {
            StoreError::NotFound(format!(
                "chunk {} of {} (generation {})",
                key.index, key.parent_id, key.generation
            ))
        })?;
        let body = read_body(&reader, locator, RecordKind::Chunk, &key.parent_id)?;
        drop(reader);

        postcard::from_bytes(&body).map_err(|e| StoreError::CorruptRecord {
            offset: locator.offset,
            reason: e.to_string(),
        })
    }

    /// Highest WAL sequence reflected by an entity record.
    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::Acquire)
    }

    /// Flush the data file to stable storage.
    pub fn sync(&self) -> StoreResult<()> {
        self.writer
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .file
            .sync_all()?;
        Ok(())
    }

    pub fn stats(&self) -> StoreResult<StoreStats> {
        let file_bytes = self.writer.lock().map_err(|_| StoreError::LockPoisoned)?.len;
        Ok(StoreStats {
            entities: self.entities.read().map_err(|_| StoreError::LockPoisoned)?.len(),
            chunks: self.chunks.read().map_err(|_| StoreError::LockPoisoned)?.len(),
            file_bytes,
            watermark: self.watermark(),
        })
    }

    /// Validate every record on disk without changing anything.
    pub fn scan(&self) -> StoreResult<StoreScan> {
        // Hold the writer so the file does not grow mid-read.
        let writer = self.writer.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut source = File::open(&self.path)?;
        let mut header = Vec::with_capacity(FILE_HEADER_LEN);
        (&mut source).take(FILE_HEADER_LEN as u64).read_to_end(&mut header)?;
        check_file_header(&header)?;

        let body_len = writer.len.saturating_sub(FILE_HEADER_LEN as u64);
        scan_records(source.take(body_len), FILE_HEADER_LEN as u64)
    }

    /// Replace the locator tables with the result of a scan.
    pub fn adopt_scan(&self, scan: &StoreScan) -> StoreResult<()> {
        let _reader = self.reader.read().map_err(|_| StoreError::LockPoisoned)?;
        *self.entities.write().map_err(|_| StoreError::LockPoisoned)? = scan.entities.clone();
        *self.chunks.write().map_err(|_| StoreError::LockPoisoned)? = scan.chunks.clone();
        self.watermark.store(scan.watermark, Ordering::Release);
        Ok(())
    }

    /// Rewrite the data file keeping only the latest revision of every
    /// entity and the chunks its manifest references. The new file is
    /// renamed over the old one.
    ///
    /// Chunks that are already missing stay missing: the entity is kept and
    /// its content keeps failing reconstruction.
    pub fn compact(&self) -> StoreResult<CompactReport> {
        let mut writer = self.writer.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut reader = self.reader.write().map_err(|_| StoreError::LockPoisoned)?;
        let mut entities = self.entities.write().map_err(|_| StoreError::LockPoisoned)?;
        let mut chunks = self.chunks.write().map_err(|_| StoreError::LockPoisoned)?;

        let tmp_path = self.path.with_extension("dat.compact");
        let mut out = File::create(&tmp_path)?;
        out.write_all(&file_header())?;
        let mut offset = FILE_HEADER_LEN as u64;

        let mut new_entities = HashMap::with_capacity(entities.len());
        let mut new_chunks = HashMap::new();
        let mut missing_chunks = 0usize;

        let mut ids: Vec<&String> = entities.keys().collect();
        ids.sort();
        for id in ids {
            let locator = entities[id];
            let bytes = read_record_bytes(&reader, locator)?;
            let payload = match decode_at(&bytes, 0) {
                Decoded::Record(raw) => raw.payload(),
                _ => Err("entity record unreadable during compaction".to_string()),
            };
            let body = payload.map_err(|reason| StoreError::CorruptRecord {
                offset: locator.offset,
                reason,
            })?;
            let entity: StoredEntity = postcard::from_bytes(&body)?;

            if let StoredContent::Chunked(manifest) = &entity.content {
                for index in 0..manifest.chunk_count {
                    let key = ChunkKey {
                        parent_id: id.clone(),
                        generation: manifest.generation,
                        index,
                    };
                    let Some(&chunk_locator) = chunks.get(&key) else {
                        warn!(entity_id = %id, index, "Chunk missing during compaction");
                        missing_chunks += 1;
                        continue;
                    };
                    let chunk_bytes = read_record_bytes(&reader, chunk_locator)?;
                    out.write_all(&chunk_bytes)?;
                    new_chunks.insert(
                        key,
                        Locator {
                            offset,
                            ..chunk_locator
                        },
                    );
                    offset += chunk_bytes.len() as u64;
                }
            }

            out.write_all(&bytes)?;
            new_entities.insert(id.clone(), Locator { offset, ..locator });
            offset += bytes.len() as u64;
        }
        out.sync_all()?;
        drop(out);

        let report = CompactReport {
            bytes_before: writer.len,
            bytes_after: offset,
            entities: new_entities.len(),
            chunks: new_chunks.len(),
            missing_chunks,
        };

        fs::rename(&tmp_path, &self.path)?;
        // From here the handles and tables must follow the renamed file,
        // whether or not the directory sync below succeeds.
        *reader = File::open(&self.path)?;
        *writer = Appender {
            file: OpenOptions::new().read(true).append(true).open(&self.path)?,
            len: offset,
        };
        *entities = new_entities;
        *chunks = new_chunks;
        if let Some(dir) = self.path.parent() {
            sync_dir(dir)?;
        }

        info!(
            before = report.bytes_before,
            after = report.bytes_after,
            entities = report.entities,
            chunks = report.chunks,
            "Compacted entity store"
        );
        Ok(report)
    }

    fn append(&self, kind: RecordKind, sequence: u64, id: &str, body: &[u8]) -> StoreResult<Locator> {
        let bytes = encode_record(kind, sequence, id, body)?;
        let mut writer = self.writer.lock().map_err(|_| StoreError::LockPoisoned)?;
        let offset = writer.len;

        if let Err(error) = writer.file.write_all(&bytes) {
            warn!(error = %error, offset, "Store append failed, rolling back");
            if let Err(rollback) = writer.file.set_len(offset) {
                warn!(error = %rollback, "Store rollback failed");
            }
            return Err(error.into());
        }
        writer.len += bytes.len() as u64;

        Ok(Locator {
            offset,
            length: bytes.len() as u32,
            sequence,
        })
    }
}

/// Decoded, decompressed body of the record at `locator`.
fn read_body(reader: &File, locator: Locator, kind: RecordKind, id: &str) -> StoreResult<Vec<u8>> {
    let bytes = read_record_bytes(reader, locator)?;
    let corrupt = |reason: String| StoreError::CorruptRecord {
        offset: locator.offset,
        reason,
    };
    match decode_at(&bytes, 0) {
        Decoded::Record(raw) if raw.kind == kind && raw.id == id => {
            raw.payload().map(|body| body.into_owned()).map_err(corrupt)
        }
        Decoded::Record(_) => Err(corrupt("record does not match its locator".to_string())),
        Decoded::Incomplete => Err(corrupt("record truncated".to_string())),
        Decoded::Corrupt(reason) => Err(corrupt(reason)),
    }
}

fn read_record_bytes(reader: &File, locator: Locator) -> StoreResult<Vec<u8>> {
    let mut bytes = vec![0u8; locator.length as usize];
    read_exact_at(reader, &mut bytes, locator.offset)?;
    Ok(bytes)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
    Ok(())
}

/// `fsync` a directory so a file created or renamed in it survives a crash.
fn sync_dir(dir: &Path) -> io::Result<()> {
    if cfg!(unix) {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}
