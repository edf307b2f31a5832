//! Versioned on-disk snapshot of the store and the outbox.
//!
//! A snapshot is written to a sibling temporary file and renamed into place,
//! so a crash mid-write leaves the previous snapshot intact.

use crate::error::{Result, StoreError};
use crate::outbox::OutboxItem;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tandem_core::EntityRecord;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub saved_at: u64,
    pub entities: Vec<EntityRecord>,
    pub outbox: Vec<OutboxItem>,
}

impl StoreSnapshot {
    pub fn new(entities: Vec<EntityRecord>, outbox: Vec<OutboxItem>, saved_at: u64) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at,
            entities,
            outbox,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let snapshot: StoreSnapshot = serde_json::from_slice(bytes)
            .map_err(|e| StoreError::Corrupted(format!("unreadable snapshot: {}", e)))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::Corrupted(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }

    /// Atomically replace the snapshot at `path`.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.to_bytes()?)?;
        tracing::trace!(
            path = %path.display(),
            entities = self.entities.len(),
            items = self.outbox.len(),
            "snapshot written"
        );
        Ok(())
    }

    /// Read the snapshot at `path`; `None` if there is none yet.
    pub fn read_from(path: &Path) -> Result<Option<Self>> {
        match fs::read(path) {
            Ok(bytes) => Self::from_bytes(&bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// A snapshot serialized under the database lock, to be written after the
/// lock is released.
///
/// Writes to one path are ordered by generation: committing a write older
/// than the one already on disk does nothing.
#[derive(Debug)]
pub struct SnapshotWrite {
    path: PathBuf,
    generation: u64,
    bytes: Vec<u8>,
    written: Arc<Mutex<u64>>,
}

impl SnapshotWrite {
    pub(crate) fn new(path: PathBuf, generation: u64, bytes: Vec<u8>, written: Arc<Mutex<u64>>) -> Self {
        Self {
            path,
            generation,
            bytes,
            written,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Write to disk. Returns `false` if a newer snapshot got there first.
    pub fn commit(self) -> Result<bool> {
        let mut written = self.written.lock();
        if self.generation <= *written {
            tracing::trace!(generation = self.generation, latest = *written, "skipping stale snapshot");
            return Ok(false);
        }
        write_atomic(&self.path, &self.bytes)?;
        *written = self.generation;
        tracing::trace!(path = %self.path.display(), generation = self.generation, "snapshot written");
        Ok(true)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = temp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
