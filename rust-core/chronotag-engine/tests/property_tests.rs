// SPDX-License-Identifier: PMPL-1.0-or-later
//! Property tests: both write modes and repair agree on the same history

use chronotag_engine::{
    Engine, EngineConfig, EngineError, IndexCheck, SyncMode, TagAction, TagEvent, TagQuery, TagWrite,
    Timestamp, WalMode,
};
use proptest::prelude::*;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Create { id: u8, tag: String, content: Option<Vec<u8>> },
    Update { id: u8, tag: String, retract: bool, content: Option<Vec<u8>> },
    Delete { id: u8 },
}

fn arb_tag() -> impl Strategy<Value = String> {
    ("(type|status|owner)", "[a-c]").prop_map(|(ns, value)| format!("{ns}:{value}"))
}

fn arb_content() -> impl Strategy<Value = Option<Vec<u8>>> {
    prop::option::of(prop::collection::vec(any::<u8>(), 0..80))
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..6, arb_tag(), arb_content()).prop_map(|(id, tag, content)| Op::Create { id, tag, content }),
        (0u8..6, arb_tag(), any::<bool>(), arb_content())
            .prop_map(|(id, tag, retract, content)| Op::Update { id, tag, retract, content }),
        (0u8..6).prop_map(|id| Op::Delete { id }),
    ]
}

fn config(dir: &TempDir, mode: WalMode) -> EngineConfig {
    let mut config = EngineConfig::new(dir.path()).with_wal_mode(mode);
    config.checkpoint_interval = None;
    config.wal_sync = SyncMode::Async;
    config.chunk_threshold = 24;
    config.chunk_size = 24;
    config
}

/// Apply the ops with explicit, increasing timestamps. Rejected ops are
/// part of the outcome.
async fn run(engine: &Engine, ops: &[Op]) -> Vec<bool> {
    let mut outcomes = Vec::with_capacity(ops.len());
    for (step, op) in ops.iter().enumerate() {
        let ts = Timestamp(step as i64 + 1);
        let result = match op {
            Op::Create { id, tag, content } => engine
                .create_entity_with_id(
                    format!("e{id}"),
                    vec![TagWrite::parse(tag).unwrap().at(ts)],
                    content.clone(),
                )
                .await
                .map(|_| ()),
            Op::Update { id, tag, retract, content } => {
                let mut write = TagWrite::parse(tag).unwrap().at(ts);
                if *retract {
                    write.action = TagAction::Retract;
                }
                engine.update_entity(&format!("e{id}"), vec![write], content.clone()).await
            }
            Op::Delete { id } => engine.delete_entity(&format!("e{id}")).await,
        };
        match result {
            Ok(()) => outcomes.push(true),
            Err(EngineError::NotFound(_) | EngineError::DuplicateId(_)) => outcomes.push(false),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    outcomes
}

/// Observable state with tombstone timestamps (wall-clock stamped)
/// reduced to their presence.
#[derive(Debug, PartialEq)]
struct Observed {
    histories: Vec<Option<Vec<(Timestamp, String, TagAction)>>>,
    contents: Vec<Option<Option<Vec<u8>>>>,
    queries: Vec<Vec<String>>,
}

fn observe(engine: &Engine) -> Observed {
    let strip = |events: Vec<TagEvent>| {
        events
            .into_iter()
            .map(|e| {
                let ts = if e.action == TagAction::Tombstone { Timestamp(0) } else { e.timestamp };
                (ts, e.tag.canonical(), e.action)
            })
            .collect::<Vec<_>>()
    };
    let ids: Vec<String> = (0..6).map(|i| format!("e{i}")).collect();
    Observed {
        histories: ids.iter().map(|id| engine.history(id).ok().map(strip)).collect(),
        contents: ids
            .iter()
            .map(|id| engine.get_entity(id).ok().map(|e| e.content))
            .collect(),
        queries: ["type:*", "status:a", "owner:*"]
            .iter()
            .map(|q| {
                engine
                    .query_by_tags(&TagQuery::new([*q]).include_deleted())
                    .unwrap()
                    .into_iter()
                    .map(|e| e.id)
                    .collect()
            })
            .collect(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_write_modes_are_equivalent(ops in prop::collection::vec(arb_op(), 1..30)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (standard, wal_only) = runtime.block_on(async {
            let dir_a = TempDir::new().unwrap();
            let dir_b = TempDir::new().unwrap();
            let a = Engine::open(config(&dir_a, WalMode::Standard)).await.unwrap();
            let b = Engine::open(config(&dir_b, WalMode::WalOnly)).await.unwrap();

            let outcomes_a = run(&a, &ops).await;
            let outcomes_b = run(&b, &ops).await;
            assert_eq!(outcomes_a, outcomes_b);
            b.sync().await.unwrap();

            let observed = (observe(&a), observe(&b));
            a.shutdown().await.unwrap();
            b.shutdown().await.unwrap();
            observed
        });
        prop_assert_eq!(standard, wal_only);
    }

    #[test]
    fn prop_repair_matches_live_indexes(ops in prop::collection::vec(arb_op(), 1..30)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (live, repaired, check) = runtime.block_on(async {
            let dir = TempDir::new().unwrap();
            let engine = Engine::open(config(&dir, WalMode::Standard)).await.unwrap();
            run(&engine, &ops).await;

            let check = engine.verify_index().await.unwrap();
            let live = observe(&engine);
            engine.repair_index().await.unwrap();
            let repaired = observe(&engine);
            (live, repaired, check)
        });
        prop_assert!(matches!(check, IndexCheck::Consistent { .. }), "{:?}", check);
        prop_assert_eq!(live, repaired);
    }
}
