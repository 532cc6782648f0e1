// SPDX-License-Identifier: PMPL-1.0-or-later
//! ChronoTag engine
//!
//! Ties the WAL, the binary entity store and the tag and temporal indexes
//! into one crash-safe, temporally queryable entity store.
//!
//! A write is appended to the WAL first. In `standard` mode it is then
//! applied to the store and indexes before the call returns; in `wal_only`
//! mode it is acknowledged as soon as it is durable and a background
//! applier catches up. Either way the indexes are a projection of the
//! store and can be rebuilt from it.
//!
//! ```no_run
//! use chronotag_engine::{parse_tags, Engine, EngineConfig, TagQuery, TagWrite};
//!
//! # async fn demo() -> chronotag_engine::EngineResult<()> {
//! let engine = Engine::open(EngineConfig::new("/tmp/chronotag")).await?;
//! let id = engine
//!     .create_entity(parse_tags(&["type:doc", "status:draft"])?, Some(b"hello".to_vec()))
//!     .await?;
//! engine.update_entity(&id, vec![TagWrite::parse("status:review")?], None).await?;
//!
//! let docs = engine.query_by_tags(&TagQuery::new(["type:doc"]))?;
//! assert_eq!(docs.len(), 1);
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod apply;
pub mod checkpoint;
pub mod config;
mod engine;
pub mod entity;
pub mod error;
mod lock;
pub mod metrics;
pub mod recovery;
mod writer;

pub use checkpoint::CheckpointReport;
pub use config::{
    EngineConfig, WalMode, DEFAULT_MAX_CONTENT_SIZE, MAX_CONTENT_SIZE_LIMIT, MIN_WAL_SEGMENT_SIZE,
};
pub use engine::{Engine, WeakEngine, MAX_ENTITY_ID_LEN};
pub use entity::{parse_tags, Entity, EntitySnapshot, Mutation, TagQuery, TagWrite};
pub use error::{EngineError, EngineResult};
pub use lock::LOCK_FILE;
pub use metrics::EngineStats;
pub use recovery::{EngineState, IndexCheck, IndexSource, RecoveryReport, RepairReport};

pub use chronotag_index::{
    ChangeEvent, Revision, Tag, TagAction, TagChange, TagDiff, TagEvent, TagSnapshot, Timestamp,
};
pub use chronotag_store::{CompactReport, ContentStream};
pub use chronotag_wal::SyncMode;
