// SPDX-License-Identifier: PMPL-1.0-or-later
//! Operation-level tests for the engine

use std::collections::BTreeSet;

use chronotag_engine::{
    parse_tags, Engine, EngineConfig, EngineError, EngineState, SyncMode, Tag, TagAction, TagQuery,
    TagWrite, Timestamp, WalMode,
};
use tempfile::TempDir;

fn config(dir: &TempDir, mode: WalMode) -> EngineConfig {
    let mut config = EngineConfig::new(dir.path()).with_wal_mode(mode);
    config.checkpoint_interval = None;
    config.wal_sync = SyncMode::Async;
    config.chunk_threshold = 16;
    config.chunk_size = 16;
    config
}

async fn open(dir: &TempDir) -> Engine {
    Engine::open(config(dir, WalMode::Standard)).await.unwrap()
}

fn tag(text: &str) -> Tag {
    Tag::parse(text).unwrap()
}

fn tags(texts: &[&str]) -> BTreeSet<Tag> {
    texts.iter().map(|t| tag(t)).collect()
}

fn at(text: &str, ts: i64) -> TagWrite {
    TagWrite::parse(text).unwrap().at(Timestamp(ts))
}

#[tokio::test]
async fn test_document_lifecycle_scenario() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir).await;
    let (t1, t2, t3) = (1_000, 2_000, 3_000);

    let a = engine
        .create_entity(vec![at("type:doc", t1), at("status:draft", t1)], None)
        .await
        .unwrap();
    engine.update_entity(&a, vec![at("status:review", t2)], None).await.unwrap();
    engine.update_entity(&a, vec![at("status:done", t3)], None).await.unwrap();

    let revisions = engine.revisions(&a).unwrap();
    assert_eq!(revisions.len(), 3);
    assert_eq!(
        revisions.iter().map(|r| r.timestamp).collect::<Vec<_>>(),
        vec![Timestamp(t1), Timestamp(t2), Timestamp(t3)]
    );
    assert_eq!(engine.history(&a).unwrap().len(), 4);

    let snapshot = engine.as_of(&a, Timestamp(t2)).unwrap();
    assert_eq!(snapshot.tags, tags(&["type:doc", "status:draft", "status:review"]));
    assert!(!snapshot.deleted);

    let diff = engine.diff(&a, Timestamp(t1), Timestamp(t3)).unwrap();
    assert_eq!(diff.added, tags(&["status:review", "status:done"]));
    assert!(diff.removed.is_empty());

    let entity = engine.get_entity(&a).unwrap();
    assert_eq!(entity.created_at, Timestamp(t1));
    assert_eq!(entity.updated_at, Timestamp(t3));
}

#[tokio::test]
async fn test_get_returns_what_create_wrote() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir).await;
    let content: Vec<u8> = (0..200u8).collect();

    let id = engine
        .create_entity(parse_tags(&["type:image", "owner:ana"]).unwrap(), Some(content.clone()))
        .await
        .unwrap();
    let entity = engine.get_entity(&id).unwrap();

    assert_eq!(entity.id, id);
    assert_eq!(entity.content, Some(content.clone()));
    assert_eq!(entity.current_tags(), tags(&["type:image", "owner:ana"]));
    assert!(!entity.deleted);

    // 200 bytes at 16 per chunk.
    assert_eq!(engine.get_chunk(&id, 0).unwrap(), content[..16].to_vec());
    assert_eq!(engine.get_chunk(&id, 12).unwrap(), content[192..].to_vec());
    assert!(matches!(engine.get_chunk(&id, 13), Err(EngineError::NotFound(_))));

    let streamed: Vec<u8> = engine
        .stream_content(&id)
        .unwrap()
        .flat_map(|piece| piece.unwrap())
        .collect();
    assert_eq!(streamed, content);
}

#[tokio::test]
async fn test_content_update_replaces_content_without_touching_tags() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir).await;
    let id = engine
        .create_entity(vec![at("type:doc", 10)], Some(vec![7; 100]))
        .await
        .unwrap();
    engine.update_entity(&id, Vec::new(), Some(b"short".to_vec())).await.unwrap();

    let entity = engine.get_entity(&id).unwrap();
    assert_eq!(entity.content.as_deref(), Some(&b"short"[..]));
    assert_eq!(entity.updated_at, Timestamp(10));
    assert_eq!(engine.revisions(&id).unwrap().len(), 2);
    assert_eq!(engine.history(&id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_query_intersects_and_expands_wildcards() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir).await;
    for (id, tag_set) in [
        ("a", &["type:doc", "priority:high"][..]),
        ("b", &["type:doc", "priority:low"][..]),
        ("c", &["type:image", "priority:high"][..]),
        ("d", &["type:doc"][..]),
    ] {
        engine
            .create_entity_with_id(id, parse_tags(tag_set).unwrap(), None)
            .await
            .unwrap();
    }

    let ids = |query: TagQuery| -> Vec<String> {
        engine
            .query_by_tags(&query)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect()
    };

    assert_eq!(ids(TagQuery::new(["type:doc", "priority:high"])), vec!["a"]);
    assert_eq!(ids(TagQuery::new(["type:doc", "priority:*"])), vec!["a", "b"]);
    assert_eq!(ids(TagQuery::new(["priority:*"]).limit(2)), vec!["a", "b"]);
    assert!(ids(TagQuery::new(Vec::<String>::new())).is_empty());
}

#[tokio::test]
async fn test_deleted_entities_leave_reads_but_keep_history() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir).await;
    engine
        .create_entity_with_id("gone", vec![at("type:doc", 5)], Some(b"x".to_vec()))
        .await
        .unwrap();
    engine
        .create_entity_with_id("kept", vec![at("type:doc", 5)], None)
        .await
        .unwrap();
    engine.delete_entity("gone").await.unwrap();

    assert!(matches!(engine.get_entity("gone"), Err(EngineError::NotFound(_))));
    assert!(matches!(engine.stream_content("gone"), Err(EngineError::NotFound(_))));

    let live: Vec<String> = engine
        .query_by_tags(&TagQuery::new(["type:doc"]))
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(live, vec!["kept"]);

    let all = engine
        .query_by_tags(&TagQuery::new(["type:doc"]).include_deleted())
        .unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().any(|e| e.id == "gone" && e.deleted));

    let history = engine.history("gone").unwrap();
    assert_eq!(history.last().unwrap().action, TagAction::Tombstone);
    assert!(engine.as_of("gone", Timestamp(5)).is_ok());

    assert!(matches!(
        engine.update_entity("gone", vec![at("status:back", 99)], None).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(engine.delete_entity("gone").await, Err(EngineError::NotFound(_))));
    assert!(matches!(
        engine.create_entity_with_id("gone", vec![at("type:doc", 99)], None).await,
        Err(EngineError::DuplicateId(_))
    ));
}

#[tokio::test]
async fn test_invalid_writes_are_rejected_before_the_wal() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir).await;
    engine
        .create_entity_with_id("e", vec![at("type:doc", 100)], None)
        .await
        .unwrap();

    assert!(matches!(
        engine.create_entity_with_id("e", vec![at("type:doc", 100)], None).await,
        Err(EngineError::DuplicateId(_))
    ));
    assert!(matches!(
        engine.update_entity("missing", vec![at("type:doc", 100)], None).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.update_entity("e", vec![at("status:old", 50)], None).await,
        Err(EngineError::InvalidTimestamp { .. })
    ));
    assert!(matches!(
        engine
            .update_entity("e", vec![TagWrite::assert(Tag::tombstone())], None)
            .await,
        Err(EngineError::InvalidTag { .. })
    ));
    assert!(matches!(
        engine.create_entity(Vec::new(), None).await,
        Err(EngineError::InvalidTag { .. })
    ));
    assert!(matches!(
        engine.create_entity_with_id("", vec![at("type:doc", 1)], None).await,
        Err(EngineError::InvalidEntityId(_))
    ));
    assert!(matches!(TagWrite::parse("no-colon"), Err(EngineError::InvalidTag { .. })));

    // None of the rejected writes left a trace.
    assert_eq!(engine.revisions("e").unwrap().len(), 1);
    assert_eq!(engine.stats().unwrap().wal_appends, 1);
}

#[tokio::test]
async fn test_content_limit_is_checked_before_the_wal() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, WalMode::Standard);
    config.max_content_size = 64;
    let engine = Engine::open(config).await.unwrap();

    engine
        .create_entity_with_id("edge", vec![at("type:doc", 1)], Some(vec![7; 64]))
        .await
        .unwrap();
    assert!(matches!(
        engine
            .create_entity_with_id("over", vec![at("type:doc", 1)], Some(vec![7; 65]))
            .await,
        Err(EngineError::ContentTooLarge { size: 65, max: 64 })
    ));
    assert!(matches!(
        engine.update_entity("edge", Vec::new(), Some(vec![0; 65])).await,
        Err(EngineError::ContentTooLarge { size: 65, max: 64 })
    ));

    assert_eq!(engine.get_entity("edge").unwrap().content, Some(vec![7; 64]));
    assert!(matches!(engine.get_entity("over"), Err(EngineError::NotFound(_))));
    assert_eq!(engine.stats().unwrap().wal_appends, 1);
}

#[tokio::test]
async fn test_content_past_64_mib_round_trips() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, WalMode::Standard);
    config.chunk_threshold = 4096;
    config.chunk_size = 1024 * 1024;
    let engine = Engine::open(config.clone()).await.unwrap();

    let content: Vec<u8> = (0..65 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    engine
        .create_entity_with_id("large", vec![at("type:blob", 1)], Some(content.clone()))
        .await
        .unwrap();
    engine.shutdown().await.unwrap();
    drop(engine);

    let engine = Engine::open(config).await.unwrap();
    assert!(engine.get_entity("large").unwrap().content == Some(content));
}

#[tokio::test]
async fn test_data_directory_admits_one_engine() {
    let dir = TempDir::new().unwrap();
    let first = open(&dir).await;

    match Engine::open(config(&dir, WalMode::Standard)).await {
        Err(EngineError::DirectoryLocked(path)) => assert_eq!(path, dir.path()),
        other => panic!("expected DirectoryLocked, got {other:?}"),
    }
    // The refused open touched nothing.
    assert_eq!(first.state(), EngineState::Ready);
    first.create_entity_with_id("e", vec![at("type:doc", 1)], None).await.unwrap();

    first.shutdown().await.unwrap();
    let second = open(&dir).await;
    assert_eq!(second.get_entity("e").unwrap().id, "e");

    drop(second);
    drop(first);
    let third = open(&dir).await;
    assert_eq!(third.state(), EngineState::Ready);
}

#[tokio::test]
async fn test_temporal_edge_cases() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir).await;
    engine
        .create_entity_with_id("e", vec![at("status:draft", 100)], None)
        .await
        .unwrap();
    engine
        .update_entity(
            "e",
            vec![at("status:final", 200), TagWrite::retract(tag("status:draft")).at(Timestamp(200))],
            None,
        )
        .await
        .unwrap();

    assert!(matches!(engine.as_of("e", Timestamp(99)), Err(EngineError::NotFound(_))));
    assert!(matches!(
        engine.diff("e", Timestamp(300), Timestamp(100)),
        Err(EngineError::InvalidTimeRange { .. })
    ));
    assert!(matches!(
        engine.diff("e", Timestamp(0), Timestamp(50)),
        Err(EngineError::NotFound(_))
    ));

    let from_nothing = engine.diff("e", Timestamp(0), Timestamp(100)).unwrap();
    assert_eq!(from_nothing.added, tags(&["status:draft"]));

    let diff = engine.diff("e", Timestamp(100), Timestamp(200)).unwrap();
    assert_eq!(diff.added, tags(&["status:final"]));
    assert_eq!(diff.removed, tags(&["status:draft"]));
}

#[tokio::test]
async fn test_changes_are_ordered_by_time_then_entity() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir).await;
    engine.create_entity_with_id("b", vec![at("type:doc", 10)], None).await.unwrap();
    engine.create_entity_with_id("a", vec![at("type:doc", 10)], None).await.unwrap();
    engine.update_entity("b", vec![at("status:x", 20)], None).await.unwrap();
    engine.update_entity("a", vec![at("status:y", 30)], None).await.unwrap();

    let changes = engine.changes(Timestamp(10), Some(Timestamp(20))).unwrap();
    let order: Vec<(&str, i64)> = changes
        .iter()
        .map(|c| (c.entity_id.as_str(), c.event.timestamp.0))
        .collect();
    assert_eq!(order, vec![("a", 10), ("b", 10), ("b", 20)]);

    assert_eq!(engine.changes(Timestamp(25), None).unwrap().len(), 1);
    assert!(matches!(
        engine.changes(Timestamp(30), Some(Timestamp(10))),
        Err(EngineError::InvalidTimeRange { .. })
    ));
}

#[tokio::test]
async fn test_default_timestamps_are_monotonic_per_entity() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir).await;
    let id = engine
        .create_entity(parse_tags(&["type:doc"]).unwrap(), None)
        .await
        .unwrap();
    for value in ["a", "b", "c"] {
        engine
            .update_entity(&id, vec![TagWrite::parse(&format!("step:{value}")).unwrap()], None)
            .await
            .unwrap();
    }

    let history = engine.history(&id).unwrap();
    assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn test_wal_only_writes_become_visible_after_sync() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(config(&dir, WalMode::WalOnly)).await.unwrap();
    for i in 0..20 {
        engine
            .create_entity_with_id(format!("e{i:02}"), vec![at("type:doc", i)], Some(vec![i as u8; 40]))
            .await
            .unwrap();
    }
    engine.sync().await.unwrap();

    let docs = engine.query_by_tags(&TagQuery::new(["type:doc"])).unwrap();
    assert_eq!(docs.len(), 20);
    assert_eq!(docs[3].content, Some(vec![3u8; 40]));
    assert_eq!(engine.stats().unwrap().applied_sequence, 20);
}

#[tokio::test]
async fn test_stats_track_operations() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir).await;
    let id = engine
        .create_entity(vec![at("type:doc", 1)], Some(vec![1; 10]))
        .await
        .unwrap();
    engine.update_entity(&id, vec![at("status:a", 2)], None).await.unwrap();
    engine.get_entity(&id).unwrap();
    engine.query_by_tags(&TagQuery::new(["type:doc"])).unwrap();
    engine.checkpoint().await.unwrap();

    let stats = engine.stats().unwrap();
    assert_eq!(stats.create_count, 1);
    assert_eq!(stats.update_count, 1);
    assert_eq!(stats.read_count, 1);
    assert_eq!(stats.query_count, 1);
    assert_eq!(stats.content_bytes_written, 10);
    assert_eq!(stats.content_bytes_read, 10);
    assert_eq!(stats.checkpoints, 1);
    assert_eq!(stats.entities, 1);
    assert_eq!(stats.distinct_tags, 2);
    assert_eq!(stats.state, Some(EngineState::Ready));
}

#[tokio::test]
async fn test_shutdown_stops_the_engine() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(config(&dir, WalMode::WalOnly)).await.unwrap();
    engine.create_entity_with_id("e", vec![at("type:doc", 1)], None).await.unwrap();
    engine.shutdown().await.unwrap();

    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(matches!(
        engine.get_entity("e"),
        Err(EngineError::NotReady(EngineState::Stopped))
    ));
    // A second shutdown is a no-op.
    engine.shutdown().await.unwrap();

    drop(engine);
    let reopened = Engine::open(config(&dir, WalMode::Standard)).await.unwrap();
    assert_eq!(reopened.get_entity("e").unwrap().id, "e");
}

#[tokio::test]
async fn test_clones_share_one_engine() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir).await;
    let other = engine.clone();
    let writer = tokio::spawn(async move {
        for i in 0..10 {
            other
                .create_entity_with_id(format!("t{i}"), vec![at("type:doc", i)], None)
                .await
                .unwrap();
        }
    });
    writer.await.unwrap();
    assert_eq!(engine.query_by_tags(&TagQuery::new(["type:*"])).unwrap().len(), 10);
}
