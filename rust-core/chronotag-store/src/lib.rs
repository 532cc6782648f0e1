// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ChronoTag binary entity store
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Durable home of entity revisions. Every revision is appended to a single
// data file as a self-describing, checksummed record; large payloads are
// split into chunk records by the content chunker. The file is never
// edited in place, so the newest valid record for an id is its current
// state and a crash can at worst leave a torn tail behind.
//
// ## Usage
//
// ```no_run
// use std::sync::Arc;
// use chronotag_store::{ChunkConfig, ContentChunker, EntityStore, StoredEntity};
//
// let store = Arc::new(EntityStore::open("/tmp/chronotag-store").unwrap());
// let chunker = ContentChunker::new(Arc::clone(&store), ChunkConfig::default()).unwrap();
//
// let mut entity = StoredEntity::new("entity-1");
// entity.content = chunker.store("entity-1", &[0u8; 10_000], 1).unwrap();
// store.put(&entity, 1).unwrap();
//
// assert_eq!(chunker.reconstruct("entity-1").unwrap().len(), 10_000);
// ```

pub mod chunker;
pub mod error;
pub mod record;
pub mod scan;
pub mod store;

pub use chunker::{
    ChunkConfig, ChunkKey, ChunkManifest, ChunkRecord, ContentChunker, ContentStream,
    DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_THRESHOLD, MAX_CHUNK_SIZE,
};
pub use error::{StoreError, StoreResult};
pub use record::{RecordKind, COMPRESSION_THRESHOLD, FILE_HEADER_LEN};
pub use scan::{scan_bytes, scan_records, StoreScan};
pub use store::{
    CompactReport, CorruptSpan, EntityStore, Locator, OpenReport, StoreStats, StoredContent,
    StoredEntity, DATA_FILE,
};
