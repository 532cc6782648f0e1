// SPDX-License-Identifier: PMPL-1.0-or-later
//! Engine configuration
//!
//! Defaults suit a single embedded engine. Every field can be overridden
//! from `CHRONOTAG_*` environment variables via [`EngineConfig::from_env`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chronotag_store::{ChunkConfig, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_THRESHOLD, MAX_CHUNK_SIZE};
use chronotag_wal::{SyncMode, DEFAULT_MAX_SEGMENT_SIZE, MAX_ENTRY_SIZE};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Smallest accepted WAL segment size.
pub const MIN_WAL_SEGMENT_SIZE: u64 = 1024;

/// Default cap on one entity's content (256 MiB).
pub const DEFAULT_MAX_CONTENT_SIZE: u64 = 256 * 1024 * 1024;

/// Room kept in a WAL entry for the tags and framing around the content.
const WAL_ENTRY_HEADROOM: u64 = 16 * 1024 * 1024;

/// Largest `max_content_size` a WAL entry can carry.
pub const MAX_CONTENT_SIZE_LIMIT: u64 = MAX_ENTRY_SIZE as u64 - WAL_ENTRY_HEADROOM;

/// Interval used by `CHRONOTAG_WAL_SYNC=periodic` without an explicit value.
const DEFAULT_PERIODIC_SYNC: Duration = Duration::from_millis(100);

/// How a write reaches the store and indexes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalMode {
    /// Append, apply synchronously, then acknowledge.
    #[default]
    Standard,
    /// Append and acknowledge; a background applier catches up.
    WalOnly,
}

impl fmt::Display for WalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalMode::Standard => write!(f, "standard"),
            WalMode::WalOnly => write!(f, "wal_only"),
        }
    }
}

impl FromStr for WalMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(WalMode::Standard),
            "wal_only" | "wal-only" => Ok(WalMode::WalOnly),
            other => Err(EngineError::Config(format!(
                "unknown WAL mode {other:?} (expected standard or wal_only)"
            ))),
        }
    }
}

/// Configuration for [`crate::Engine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory holding `wal/`, `store/` and `index.snap`.
    pub data_dir: PathBuf,
    pub wal_mode: WalMode,
    /// Content strictly longer than this is chunked.
    pub chunk_threshold: usize,
    pub chunk_size: usize,
    /// Period of the background checkpoint task; `None` disables it.
    pub checkpoint_interval: Option<Duration>,
    pub wal_sync: SyncMode,
    pub wal_segment_size: u64,
    /// Bound of the applier channel in `wal_only` mode.
    pub applier_queue_depth: usize,
    /// Largest content accepted by a create or update. Content travels in a
    /// single WAL entry, so this stays below [`MAX_CONTENT_SIZE_LIMIT`].
    pub max_content_size: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("chronotag-data"),
            wal_mode: WalMode::Standard,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            checkpoint_interval: Some(Duration::from_secs(60)),
            wal_sync: SyncMode::Fsync,
            wal_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            applier_queue_depth: 1024,
            max_content_size: DEFAULT_MAX_CONTENT_SIZE,
        }
    }
}

impl EngineConfig {
    /// Defaults rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_wal_mode(mut self, mode: WalMode) -> Self {
        self.wal_mode = mode;
        self
    }

    /// Defaults overridden by `CHRONOTAG_*` environment variables.
    pub fn from_env() -> EngineResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `CHRONOTAG_*` variable name.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EngineResult<Self> {
        let mut config = Self::default();

        if let Some(dir) = lookup("CHRONOTAG_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(mode) = lookup("CHRONOTAG_WAL_MODE") {
            config.wal_mode = mode.parse()?;
        }
        if let Some(value) = parse_var(&lookup, "CHRONOTAG_CHUNK_THRESHOLD")? {
            config.chunk_threshold = value;
        }
        if let Some(value) = parse_var(&lookup, "CHRONOTAG_CHUNK_SIZE")? {
            config.chunk_size = value;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CHRONOTAG_CHECKPOINT_INTERVAL_SECS")? {
            config.checkpoint_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(sync) = lookup("CHRONOTAG_WAL_SYNC") {
            config.wal_sync = parse_sync_mode(&sync)?;
        }
        if let Some(value) = parse_var(&lookup, "CHRONOTAG_WAL_SEGMENT_SIZE")? {
            config.wal_segment_size = value;
        }
        if let Some(value) = parse_var(&lookup, "CHRONOTAG_APPLIER_QUEUE_DEPTH")? {
            config.applier_queue_depth = value;
        }
        if let Some(value) = parse_var(&lookup, "CHRONOTAG_MAX_CONTENT_SIZE")? {
            config.max_content_size = value;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(EngineError::Config("data_dir must not be empty".to_string()));
        }
        self.chunk_config().validate()?;
        // Unchunked content lives inside one store record.
        if self.chunk_threshold > MAX_CHUNK_SIZE {
            return Err(EngineError::Config(format!(
                "chunk_threshold must be at most {MAX_CHUNK_SIZE} bytes, got {}",
                self.chunk_threshold
            )));
        }
        if self.max_content_size == 0 || self.max_content_size > MAX_CONTENT_SIZE_LIMIT {
            return Err(EngineError::Config(format!(
                "max_content_size must be between 1 and {MAX_CONTENT_SIZE_LIMIT} bytes, got {}",
                self.max_content_size
            )));
        }
        if self.wal_segment_size < MIN_WAL_SEGMENT_SIZE {
            return Err(EngineError::Config(format!(
                "wal_segment_size must be at least {MIN_WAL_SEGMENT_SIZE} bytes, got {}",
                self.wal_segment_size
            )));
        }
        if self.applier_queue_depth == 0 {
            return Err(EngineError::Config(
                "applier_queue_depth must be at least 1".to_string(),
            ));
        }
        if self.checkpoint_interval.is_some_and(|i| i.is_zero()) {
            return Err(EngineError::Config(
                "checkpoint_interval must be positive; use None to disable".to_string(),
            ));
        }
        Ok(())
    }

    /// `ContentTooLarge` when `content` is over `max_content_size`.
    pub fn check_content_size(&self, content: Option<&[u8]>) -> EngineResult<()> {
        let size = content.map_or(0, |bytes| bytes.len() as u64);
        if size > self.max_content_size {
            return Err(EngineError::ContentTooLarge {
                size,
                max: self.max_content_size,
            });
        }
        Ok(())
    }

    pub fn chunk_config(&self) -> ChunkConfig {
        ChunkConfig {
            threshold: self.chunk_threshold,
            chunk_size: self.chunk_size,
        }
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("index.snap")
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> EngineResult<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| EngineError::Config(format!("{name}: cannot parse {raw:?}"))),
    }
}

/// `fsync`, `async`, `periodic` or `periodic:<millis>`.
fn parse_sync_mode(raw: &str) -> EngineResult<SyncMode> {
    let raw = raw.trim().to_ascii_lowercase();
    match raw.split_once(':') {
        None if raw == "fsync" => Ok(SyncMode::Fsync),
        None if raw == "async" => Ok(SyncMode::Async),
        None if raw == "periodic" => Ok(SyncMode::Periodic(DEFAULT_PERIODIC_SYNC)),
        Some(("periodic", millis)) => millis
            .parse()
            .map(|ms| SyncMode::Periodic(Duration::from_millis(ms)))
            .map_err(|_| EngineError::Config(format!("CHRONOTAG_WAL_SYNC: bad interval {millis:?}"))),
        _ => Err(EngineError::Config(format!(
            "CHRONOTAG_WAL_SYNC: unknown mode {raw:?} (expected fsync, async or periodic[:ms])"
        ))),
    }
}
