// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Content chunker.
//
// Payloads larger than the threshold are split into fixed-size chunk
// records tagged with the generation (WAL sequence) of the write that
// produced them. Reassembly checks index, generation, byte range, total
// length and a SHA-256 of the whole payload, and fails rather than return
// partial data.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::{EntityStore, StoredContent, StoredEntity};

/// Default size above which content is chunked (4 KiB).
pub const DEFAULT_CHUNK_THRESHOLD: usize = 4 * 1024;

/// Default chunk size (4 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024;

/// Largest accepted chunk size (64 MiB).
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Content strictly longer than this is chunked.
    pub threshold: usize,
    /// Payload bytes per chunk.
    pub chunk_size: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CHUNK_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> StoreResult<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(StoreError::InvalidConfig(format!(
                "chunk_size must be between 1 and {MAX_CHUNK_SIZE}, got {}",
                self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Describes a chunked payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub total_len: u64,
    pub chunk_size: u32,
    pub chunk_count: u32,
    pub generation: u64,
    pub sha256: [u8; 32],
}

/// Identifies one chunk record. Field order matches the head of
/// `ChunkRecord` so the key can be decoded without the payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkKey {
    pub parent_id: String,
    pub generation: u64,
    pub index: u32,
}

/// One persisted chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub parent_id: String,
    pub generation: u64,
    pub index: u32,
    pub byte_start: u64,
    pub payload: Vec<u8>,
}

impl ChunkRecord {
    pub fn key(&self) -> ChunkKey {
        ChunkKey {
            parent_id: self.parent_id.clone(),
            generation: self.generation,
            index: self.index,
        }
    }
}

/// Splits content into chunk records and reassembles it.
#[derive(Clone)]
pub struct ContentChunker {
    store: Arc<EntityStore>,
    config: ChunkConfig,
}

impl ContentChunker {
    pub fn new(store: Arc<EntityStore>, config: ChunkConfig) -> StoreResult<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    pub fn config(&self) -> ChunkConfig {
        self.config
    }

    /// Persist content for `entity_id`, chunking it when it exceeds the
    /// threshold. The returned value goes into the entity record.
    pub fn store(&self, entity_id: &str, bytes: &[u8], generation: u64) -> StoreResult<StoredContent> {
        if bytes.len() <= self.config.threshold {
            return Ok(StoredContent::Inline(bytes.to_vec()));
        }

        let mut byte_start = 0u64;
        let mut chunk_count = 0u32;
        for (index, payload) in bytes.chunks(self.config.chunk_size).enumerate() {
            self.store.put_chunk(&ChunkRecord {
                parent_id: entity_id.to_string(),
                generation,
                index: index as u32,
                byte_start,
                payload: payload.to_vec(),
            })?;
            byte_start += payload.len() as u64;
            chunk_count += 1;
        }

        let manifest = ChunkManifest {
            total_len: bytes.len() as u64,
            chunk_size: self.config.chunk_size as u32,
            chunk_count,
            generation,
            sha256: Sha256::digest(bytes).into(),
        };
        debug!(
            entity_id,
            generation,
            chunk_count,
            total_len = manifest.total_len,
            "Chunked content"
        );
        Ok(StoredContent::Chunked(manifest))
    }

    /// Reassemble the latest content of an entity.
    pub fn reconstruct(&self, entity_id: &str) -> StoreResult<Vec<u8>> {
        let entity = self.store.get(entity_id)?;
        self.reconstruct_entity(&entity)
    }

    /// Reassemble the content of an already loaded revision.
    pub fn reconstruct_entity(&self, entity: &StoredEntity) -> StoreResult<Vec<u8>> {
        let mut bytes = Vec::with_capacity(entity.content.len() as usize);
        for piece in self.stream_entity(entity)? {
            bytes.extend_from_slice(&piece?);
        }
        Ok(bytes)
    }

    /// Lazily stream the latest content of an entity.
    pub fn stream_reconstruct(&self, entity_id: &str) -> StoreResult<ContentStream> {
        let entity = self.store.get(entity_id)?;
        self.stream_entity(&entity)
    }

    /// Lazily stream the content of an already loaded revision.
    pub fn stream_entity(&self, entity: &StoredEntity) -> StoreResult<ContentStream> {
        let source = match &entity.content {
            StoredContent::None => {
                return Err(StoreError::NotFound(format!("content of {}", entity.id)))
            }
            StoredContent::Inline(bytes) => Source::Inline(Some(bytes.clone())),
            StoredContent::Chunked(manifest) => Source::Chunked {
                manifest: manifest.clone(),
                next: 0,
                seen: 0,
                hasher: Sha256::new(),
            },
        };
        Ok(ContentStream {
            store: Arc::clone(&self.store),
            entity_id: entity.id.clone(),
            source,
            done: false,
        })
    }

    /// One chunk of an entity's latest content. Inline content is chunk 0.
    pub fn get_chunk(&self, entity_id: &str, index: u32) -> StoreResult<Vec<u8>> {
        let entity = self.store.get(entity_id)?;
        self.chunk_of(&entity, index)
    }

    pub fn chunk_of(&self, entity: &StoredEntity, index: u32) -> StoreResult<Vec<u8>> {
        let missing = || StoreError::NotFound(format!("chunk {index} of {}", entity.id));
        match &entity.content {
            StoredContent::None => Err(missing()),
            StoredContent::Inline(bytes) if index == 0 => Ok(bytes.clone()),
            StoredContent::Inline(_) => Err(missing()),
            StoredContent::Chunked(manifest) if index < manifest.chunk_count => {
                let chunk = fetch_chunk(&self.store, &entity.id, manifest, index)?;
                Ok(chunk.payload)
            }
            StoredContent::Chunked(_) => Err(missing()),
        }
    }
}

fn fetch_chunk(
    store: &EntityStore,
    entity_id: &str,
    manifest: &ChunkManifest,
    index: u32,
) -> StoreResult<ChunkRecord> {
    let corrupt = |reason: String| StoreError::CorruptContent {
        entity_id: entity_id.to_string(),
        reason,
    };
    let key = ChunkKey {
        parent_id: entity_id.to_string(),
        generation: manifest.generation,
        index,
    };
    let chunk = store.get_chunk(&key).map_err(|error| match error {
        StoreError::NotFound(_) => corrupt(format!("chunk {index} missing")),
        StoreError::CorruptRecord { offset, reason } => {
            corrupt(format!("chunk {index} at offset {offset}: {reason}"))
        }
        other => other,
    })?;

    let expected_start = u64::from(index) * u64::from(manifest.chunk_size);
    if chunk.parent_id != entity_id || chunk.generation != manifest.generation || chunk.index != index {
        return Err(corrupt(format!("chunk {index} belongs to another write")));
    }
    if chunk.byte_start != expected_start {
        return Err(corrupt(format!(
            "chunk {index} starts at {}, expected {expected_start}",
            chunk.byte_start
        )));
    }
    let expected_len = (manifest.total_len - expected_start.min(manifest.total_len))
        .min(u64::from(manifest.chunk_size));
    if chunk.payload.len() as u64 != expected_len {
        return Err(corrupt(format!(
            "chunk {index} holds {} bytes, expected {expected_len}",
            chunk.payload.len()
        )));
    }
    Ok(chunk)
}

enum Source {
    Inline(Option<Vec<u8>>),
    Chunked {
        manifest: ChunkManifest,
        next: u32,
        seen: u64,
        hasher: Sha256,
    },
}

/// A lazy, finite, single-pass stream of content pieces.
///
/// Each item is one chunk payload (or the whole inline payload). The final
/// chunk is followed by a length and checksum check; a failure is yielded
/// as an error item and ends the stream. Dropping the stream early stops
/// reading and has no other effect.
pub struct ContentStream {
    store: Arc<EntityStore>,
    entity_id: String,
    source: Source,
    done: bool,
}

impl ContentStream {
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Total payload length in bytes.
    pub fn total_len(&self) -> u64 {
        match &self.source {
            Source::Inline(Some(bytes)) => bytes.len() as u64,
            Source::Inline(None) => 0,
            Source::Chunked { manifest, .. } => manifest.total_len,
        }
    }

    fn fail(&mut self, error: StoreError) -> Option<StoreResult<Vec<u8>>> {
        self.done = true;
        Some(Err(error))
    }
}

impl Iterator for ContentStream {
    type Item = StoreResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let Source::Chunked {
            manifest,
            next,
            seen,
            hasher,
        } = &mut self.source
        else {
            self.done = true;
            return match &mut self.source {
                Source::Inline(bytes) => bytes.take().map(Ok),
                Source::Chunked { .. } => None,
            };
        };

        if *next < manifest.chunk_count {
            match fetch_chunk(&self.store, &self.entity_id, manifest, *next) {
                Ok(chunk) => {
                    hasher.update(&chunk.payload);
                    *seen += chunk.payload.len() as u64;
                    *next += 1;
                    Some(Ok(chunk.payload))
                }
                Err(error) => self.fail(error),
            }
        } else {
            let total_len = manifest.total_len;
            let expected = manifest.sha256;
            let seen = *seen;
            let digest: [u8; 32] = std::mem::take(hasher).finalize().into();
            self.done = true;
            if seen != total_len {
                return self.fail(StoreError::CorruptContent {
                    entity_id: self.entity_id.clone(),
                    reason: format!("reassembled {seen} bytes, expected {total_len}"),
                });
            }
            if digest != expected {
                return self.fail(StoreError::CorruptContent {
                    entity_id: self.entity_id.clone(),
                    reason: "SHA-256 mismatch".to_string(),
                });
            }
            None
        }
    }
}

impl std::iter::FusedIterator for ContentStream {}
