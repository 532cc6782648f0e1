// SPDX-License-Identifier: PMPL-1.0-or-later
//! Persisted index snapshot
//!
//! The snapshot is a disposable cache of every entity's tag history at a
//! known watermark. The tag index is derived from the histories on load, so
//! only the histories are written.
//!
//! File layout (little-endian):
//!
//! ```text
//! [4 bytes: magic "CTIX"][u32 version][u64 watermark][u32 crc32 of body]
//! [u64 body_len][body: postcard-encoded histories]
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{IndexError, IndexResult};
use crate::tag::EntityHistory;

pub const SNAPSHOT_MAGIC: &[u8; 4] = b"CTIX";
pub const SNAPSHOT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 8 + 4 + 8;

/// Entity histories captured at a watermark.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub watermark: u64,
    pub histories: BTreeMap<String, EntityHistory>,
}

impl IndexSnapshot {
    pub fn encode(&self) -> IndexResult<Vec<u8>> {
        let body = postcard::to_allocvec(&self.histories)?;
        let mut buffer = Vec::with_capacity(HEADER_LEN + body.len());
        buffer.extend_from_slice(SNAPSHOT_MAGIC);
        buffer.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        buffer.extend_from_slice(&self.watermark.to_le_bytes());
        buffer.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        buffer.extend_from_slice(&(body.len() as u64).to_le_bytes());
        buffer.extend_from_slice(&body);
        Ok(buffer)
    }

    pub fn decode(data: &[u8]) -> IndexResult<Self> {
        let corrupt = |reason: &str| IndexError::SnapshotCorrupt(reason.to_string());

        if data.len() < HEADER_LEN {
            return Err(corrupt("shorter than header"));
        }
        if &data[0..4] != SNAPSHOT_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let version = u32::from_le_bytes(field(data, 4)?);
        if version != SNAPSHOT_VERSION {
            return Err(IndexError::SnapshotVersion(version));
        }
        let watermark = u64::from_le_bytes(field(data, 8)?);
        let crc = u32::from_le_bytes(field(data, 16)?);
        let body_len = u64::from_le_bytes(field(data, 20)?);

        let body = usize::try_from(body_len)
            .ok()
            .and_then(|len| data.get(HEADER_LEN..HEADER_LEN.checked_add(len)?))
            .ok_or_else(|| corrupt("body truncated"))?;
        if crc32fast::hash(body) != crc {
            return Err(corrupt("checksum mismatch"));
        }

        let histories = postcard::from_bytes(body)?;
        Ok(Self {
            watermark,
            histories,
        })
    }

    /// Write atomically: temp file, fsync, rename.
    pub fn persist(&self, path: &Path) -> IndexResult<()> {
        let encoded = self.encode()?;
        let tmp = path.with_extension("snap.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        // The rename is only durable once the directory entry is.
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            if cfg!(unix) {
                File::open(dir)?.sync_all()?;
            }
        }
        info!(
            path = %path.display(),
            watermark = self.watermark,
            entities = self.histories.len(),
            bytes = encoded.len(),
            "Index snapshot persisted"
        );
        Ok(())
    }

    /// Load a snapshot. A missing file is `Ok(None)`; a damaged one is an
    /// error the caller treats as a stale index.
    pub fn load(path: &Path) -> IndexResult<Option<Self>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No index snapshot");
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        };
        Self::decode(&data).map(Some)
    }
}

fn field<const N: usize>(data: &[u8], offset: usize) -> IndexResult<[u8; N]> {
    data.get(offset..offset + N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| IndexError::SnapshotCorrupt("header truncated".to_string()))
}
