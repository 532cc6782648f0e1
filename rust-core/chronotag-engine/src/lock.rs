// SPDX-License-Identifier: PMPL-1.0-or-later
//! Exclusive data directory lock
//!
//! One engine owns a data directory at a time. The lock is an OS file lock
//! on `data_dir/.lock`, so it also goes away if the process dies.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};

/// Name of the lock file inside the data directory.
pub const LOCK_FILE: &str = ".lock";

/// Held for as long as an engine owns its directory.
#[derive(Debug)]
pub(crate) struct DataDirLock {
    file: File,
    path: PathBuf,
}

impl DataDirLock {
    /// Take the lock without waiting; `DirectoryLocked` if someone holds it.
    pub fn acquire(data_dir: &Path) -> EngineResult<Self> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "Acquired data directory lock");
                Ok(Self { file, path })
            }
            Err(error) if is_contended(&error) => {
                warn!(data_dir = %data_dir.display(), "Data directory is locked by another engine");
                Err(EngineError::DirectoryLocked(data_dir.to_path_buf()))
            }
            Err(error) => Err(error.into()),
        }
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        match FileExt::unlock(&self.file) {
            Ok(()) => info!(path = %self.path.display(), "Released data directory lock"),
            Err(error) => warn!(path = %self.path.display(), error = %error, "Failed to release data directory lock"),
        }
    }
}

fn is_contended(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
