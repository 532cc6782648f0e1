// SPDX-License-Identifier: PMPL-1.0-or-later
//! Performance benchmarks for the ChronoTag write and read paths

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Runtime;

use chronotag_engine::{parse_tags, Engine, EngineConfig, SyncMode, TagQuery, TagWrite, Timestamp, WalMode};
use chronotag_index::{EntityHistory, Indexes, Tag, TagEvent};
use chronotag_store::{ChunkConfig, ContentChunker, EntityStore};

/// Store sizes the write path is measured at.
const STORE_SIZES: [usize; 3] = [0, 1_000, 10_000];

fn temp_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("chronotag-bench-{label}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn config(dir: &PathBuf, mode: WalMode) -> EngineConfig {
    let mut config = EngineConfig::new(dir).with_wal_mode(mode);
    config.checkpoint_interval = None;
    config
}

async fn populate(engine: &Engine, count: usize) {
    for i in 0..count {
        engine
            .create_entity_with_id(
                format!("seed-{i:06}"),
                parse_tags(&[format!("group:g{}", i % 16), "type:doc".to_string()]).unwrap(),
                Some(vec![(i % 251) as u8; 256]),
            )
            .await
            .unwrap();
    }
    engine.sync().await.unwrap();
}

// ============================================================================
// Write path: standard vs wal_only as the store grows
// ============================================================================

fn bench_create_by_mode(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("create_entity");
    group.sample_size(20);

    for mode in [WalMode::Standard, WalMode::WalOnly] {
        for size in STORE_SIZES {
            let dir = temp_dir("create");
            let engine = rt.block_on(async {
                let engine = Engine::open(config(&dir, mode)).await.unwrap();
                populate(&engine, size).await;
                engine
            });

            group.bench_with_input(BenchmarkId::new(mode.to_string(), size), &size, |b, _| {
                b.to_async(&rt).iter(|| async {
                    let tags = parse_tags(&["type:doc", "status:draft"]).unwrap();
                    black_box(engine.create_entity(tags, Some(vec![7u8; 512])).await.unwrap())
                });
            });

            rt.block_on(engine.shutdown()).unwrap();
            std::fs::remove_dir_all(&dir).ok();
        }
    }

    group.finish();
}

fn bench_wal_sync_modes(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("wal_sync");
    group.sample_size(20);

    for (label, sync) in [
        ("fsync", SyncMode::Fsync),
        ("async", SyncMode::Async),
        ("periodic_100ms", SyncMode::Periodic(std::time::Duration::from_millis(100))),
    ] {
        let dir = temp_dir("sync");
        let mut config = config(&dir, WalMode::Standard);
        config.wal_sync = sync;
        let engine = rt.block_on(Engine::open(config)).unwrap();

        group.bench_function(label, |b| {
            b.to_async(&rt).iter(|| async {
                let tags = vec![TagWrite::parse("type:doc").unwrap()];
                black_box(engine.create_entity(tags, None).await.unwrap())
            });
        });

        rt.block_on(engine.shutdown()).unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    group.finish();
}

// ============================================================================
// Read path
// ============================================================================

fn bench_reads(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = temp_dir("reads");
    let engine = rt.block_on(async {
        let engine = Engine::open(config(&dir, WalMode::Standard)).await.unwrap();
        populate(&engine, 5_000).await;
        for i in 0..200 {
            engine
                .update_entity(
                    &format!("seed-{i:06}"),
                    vec![TagWrite::parse("status:reviewed").unwrap()],
                    None,
                )
                .await
                .unwrap();
        }
        engine
    });

    let mut group = c.benchmark_group("reads");

    group.bench_function("get_entity", |b| {
        b.iter(|| black_box(engine.get_entity("seed-001234").unwrap()))
    });

    group.throughput(Throughput::Elements(5_000 / 16));
    group.bench_function("query_two_tags", |b| {
        let query = TagQuery::new(["type:doc", "group:g3"]);
        b.iter(|| black_box(engine.query_by_tags(&query).unwrap()))
    });

    group.bench_function("query_wildcard_limited", |b| {
        let query = TagQuery::new(["group:*"]).limit(100);
        b.iter(|| black_box(engine.query_by_tags(&query).unwrap()))
    });

    group.bench_function("as_of", |b| {
        b.iter(|| black_box(engine.as_of("seed-000100", Timestamp::MAX).unwrap()))
    });

    group.finish();
    rt.block_on(engine.shutdown()).unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

// ============================================================================
// Chunking and index rebuild
// ============================================================================

fn bench_chunk_reconstruct(c: &mut Criterion) {
    let dir = temp_dir("chunks");
    let store = Arc::new(EntityStore::open(&dir).unwrap());
    let chunker = ContentChunker::new(Arc::clone(&store), ChunkConfig::default()).unwrap();

    let mut group = c.benchmark_group("chunker");
    for size in [4 * 1024, 256 * 1024, 4 * 1024 * 1024] {
        let id = format!("blob-{size}");
        let mut entity = chronotag_store::StoredEntity::new(id.as_str());
        entity.content = chunker.store(&id, &vec![42u8; size], size as u64).unwrap();
        store.put(&entity, size as u64).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("reconstruct", size), &id, |b, id| {
            b.iter(|| black_box(chunker.reconstruct(id).unwrap()))
        });
    }
    group.finish();
    std::fs::remove_dir_all(&dir).ok();
}

fn bench_index_rebuild(c: &mut Criterion) {
    let histories: Vec<(String, EntityHistory)> = (0..10_000)
        .map(|i| {
            let ts = Timestamp(i as i64);
            let mut history = EntityHistory::default();
            history.record(
                i as u64 + 1,
                ts,
                &[
                    TagEvent::assert(ts, Tag::parse(&format!("group:g{}", i % 64)).unwrap()),
                    TagEvent::assert(ts, Tag::parse("type:doc").unwrap()),
                ],
            );
            (format!("e{i:05}"), history)
        })
        .collect();

    let mut group = c.benchmark_group("indexes");
    group.throughput(Throughput::Elements(histories.len() as u64));
    group.bench_function("rebuild_10k", |b| {
        b.iter(|| {
            let mut indexes = Indexes::new();
            for (id, history) in &histories {
                indexes.index_entity(id, history);
            }
            black_box(indexes)
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_create_by_mode,
    bench_wal_sync_modes,
    bench_reads,
    bench_chunk_reconstruct,
    bench_index_rebuild,
);
criterion_main!(benches);
