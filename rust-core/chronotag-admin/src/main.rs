// SPDX-License-Identifier: PMPL-1.0-or-later
//! ChronoTag admin binary
//!
//! Opens a data directory (running recovery), performs one maintenance or
//! inspection command and shuts the engine down cleanly.

mod output;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chronotag_engine::{Engine, EngineConfig, EngineState, Entity, TagQuery, Timestamp, WalMode};
use chronotag_wal::WalReader;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use output::{render, OutputFormat};

/// Longest content preview printed by `get`.
const PREVIEW_BYTES: usize = 64;

/// Maintenance CLI for a ChronoTag data directory.
#[derive(Parser, Debug)]
#[command(name = "chronotag-admin", version, about = "Inspect and maintain a ChronoTag store")]
struct Cli {
    /// Data directory. Defaults to CHRONOTAG_DATA_DIR, then ./chronotag-data.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Output format: text or json.
    #[arg(long, global = true, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Engine counters and gauges.
    Stats,
    /// What the last recovery did, plus the WAL layout on disk.
    Wal,
    /// Check the indexes against the store, repairing them on divergence.
    Verify,
    /// Rebuild store locators and indexes from a full scan.
    Repair,
    /// Persist the index snapshot and prune applied WAL segments.
    Checkpoint,
    /// Rewrite the store file keeping only live revisions.
    Compact,
    /// Show one entity.
    Get { id: String },
    /// Show an entity's tag-events.
    History {
        id: String,
        /// Group events by write.
        #[arg(long)]
        revisions: bool,
    },
    /// Show an entity's tags at an instant (RFC 3339 or nanoseconds).
    AsOf { id: String, at: String },
    /// Find entities carrying every tag. A trailing `*` matches a prefix.
    Query {
        #[arg(required = true)]
        tags: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        include_deleted: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format: OutputFormat = cli
        .format
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let mut config = EngineConfig::from_env().context("reading CHRONOTAG_* configuration")?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    // One-shot process: no background checkpoints, no applier lag.
    config.checkpoint_interval = None;
    config.wal_mode = WalMode::Standard;

    let engine = Engine::open(config)
        .await
        .context("opening data directory")?;
    let allowed_when_corrupt = matches!(cli.command, Command::Repair | Command::Stats | Command::Wal);
    if engine.state() == EngineState::Corrupt && !allowed_when_corrupt {
        tracing::warn!("Store is corrupt; run `chronotag-admin repair` first");
    }

    let result = run(&engine, cli.command).await;
    engine.shutdown().await.context("shutting down engine")?;

    println!("{}", render(&result?, format));
    Ok(())
}

async fn run(engine: &Engine, command: Command) -> Result<Value> {
    let value = match command {
        Command::Stats => serde_json::to_value(engine.stats()?)?,
        Command::Wal => {
            let report = WalReader::open(engine.config().wal_dir())?.inspect()?;
            json!({
                "recovery": engine.recovery_report(),
                "segments": report.segments,
                "entries": report.entries,
                "last_sequence": report.last_sequence,
                "last_checkpoint": report.last_checkpoint.map(|c| json!({
                    "sequence": c.sequence,
                    "applied_through": c.applied_through,
                })),
                "damage": report.damage.map(|(segment, offset)| format!("{segment} at offset {offset}")),
                "total_bytes": report.total_bytes,
            })
        }
        Command::Verify => serde_json::to_value(engine.verify_index().await?)?,
        Command::Repair => serde_json::to_value(engine.repair_index().await?)?,
        Command::Checkpoint => serde_json::to_value(engine.checkpoint().await?)?,
        Command::Compact => serde_json::to_value(engine.compact().await?)?,
        Command::Get { id } => entity_view(&engine.get_entity(&id)?),
        Command::History { id, revisions } => {
            if revisions {
                serde_json::to_value(engine.revisions(&id)?)?
            } else {
                Value::Array(
                    engine
                        .history(&id)?
                        .iter()
                        .map(|e| json!({
                            "at": e.timestamp.to_datetime().to_rfc3339(),
                            "action": format!("{:?}", e.action),
                            "tag": e.tag.canonical(),
                        }))
                        .collect(),
                )
            }
        }
        Command::AsOf { id, at } => {
            let snapshot = engine.as_of(&id, parse_instant(&at)?)?;
            json!({
                "id": snapshot.entity_id,
                "at": snapshot.at.to_datetime().to_rfc3339(),
                "deleted": snapshot.deleted,
                "tags": snapshot.tags.iter().map(|t| t.canonical()).collect::<Vec<_>>(),
            })
        }
        Command::Query {
            tags,
            limit,
            include_deleted,
        } => {
            let mut query = TagQuery::new(tags);
            query.limit = limit;
            query.include_deleted = include_deleted;
            Value::Array(engine.query_by_tags(&query)?.iter().map(entity_view).collect())
        }
    };
    Ok(value)
}

fn entity_view(entity: &Entity) -> Value {
    let preview = entity.content.as_ref().map(|bytes| {
        let end = bytes.len().min(PREVIEW_BYTES);
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    });
    json!({
        "id": entity.id,
        "deleted": entity.deleted,
        "created_at": entity.created_at.to_datetime().to_rfc3339(),
        "updated_at": entity.updated_at.to_datetime().to_rfc3339(),
        "tags": entity.current_tags().iter().map(|t| t.canonical()).collect::<Vec<_>>(),
        "content_len": entity.content.as_ref().map(Vec::len),
        "content_preview": preview,
    })
}

/// Parse an RFC 3339 instant or a raw nanosecond count.
fn parse_instant(text: &str) -> Result<Timestamp> {
    if let Ok(nanos) = text.parse::<i64>() {
        return Ok(Timestamp::from_nanos(nanos));
    }
    match chrono::DateTime::parse_from_rfc3339(text) {
        Ok(at) => Ok(Timestamp::from(at.with_timezone(&chrono::Utc))),
        Err(e) => bail!("invalid instant {text:?}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_instant_accepts_both_forms() {
        assert_eq!(parse_instant("42").unwrap(), Timestamp(42));
        assert_eq!(
            parse_instant("1970-01-01T00:00:01Z").unwrap(),
            Timestamp(1_000_000_000)
        );
        assert!(parse_instant("yesterday").is_err());
    }

    #[test]
    fn test_cli_parses_query() {
        let cli = Cli::try_parse_from([
            "chronotag-admin",
            "--data-dir",
            "/tmp/x",
            "query",
            "type:doc",
            "priority:*",
            "--limit",
            "5",
        ])
        .unwrap();
        match cli.command {
            Command::Query { tags, limit, .. } => {
                assert_eq!(tags, vec!["type:doc", "priority:*"]);
                assert_eq!(limit, Some(5));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_and_stats_against_a_fresh_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = EngineConfig::new(dir.path());
        config.checkpoint_interval = None;
        let engine = Engine::open(config).await.unwrap();
        let id = engine
            .create_entity(chronotag_engine::parse_tags(&["type:doc"]).unwrap(), Some(b"hello".to_vec()))
            .await
            .unwrap();

        let view = run(&engine, Command::Get { id: id.clone() }).await.unwrap();
        assert_eq!(view["content_preview"], "hello");
        assert_eq!(view["tags"], json!(["type:doc"]));

        let stats = run(&engine, Command::Stats).await.unwrap();
        assert_eq!(stats["create_count"], 1);
        engine.shutdown().await.unwrap();
    }
}
