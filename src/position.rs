// SPDX-License-Identifier: Apache-2.0

//! Durable per-file consumption checkpoints.
//!
//! A `Position` records how far into a file a channel has consumed, together
//! with a device+inode fingerprint so truncation and rotation are detected
//! on the next cycle. The store persists one JSON record per tracked file,
//! keyed by its resolved path, replaced atomically (write-new-then-rename)
//! so a crash mid-write never leaves a torn record.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// File identity fingerprint: device + inode. Stable across renames, replaced
/// when a path is recreated, which is exactly the rotation signal we need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }

    #[cfg(unix)]
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        use std::os::unix::fs::MetadataExt;

        let metadata = fs::metadata(path)?;
        Ok(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    pub fn dev(&self) -> u64 {
        self.dev
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }
}

/// Consumption checkpoint for one tracked file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub file_id: FileId,
    pub offset: u64,
}

/// Durable path → `Position` map backed by one JSON file.
pub struct PositionStore {
    path: PathBuf,
    entries: BTreeMap<String, Position>,
}

impl PositionStore {
    /// Open or create a store at `path`. An existing file that cannot be
    /// parsed is surfaced as `StateCorruption` rather than silently reset:
    /// resetting would re-deliver everything ever shipped.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw).map_err(|e| Error::StateCorruption {
                path: path.clone(),
                reason: e.to_string(),
            })?
        } else {
            BTreeMap::new()
        };
        debug!(store = %path.display(), tracked = entries.len(), "opened position store");
        Ok(Self { path, entries })
    }

    /// In-memory store for untracked runs and tests.
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::new(),
            entries: BTreeMap::new(),
        }
    }

    /// Keep the loaded entries but stop persisting. Used for stateless
    /// replay: runs start from the last persisted state without writing.
    pub fn detach(&mut self) {
        self.path = PathBuf::new();
    }

    pub fn load(&self, path: &str) -> Option<&Position> {
        self.entries.get(path)
    }

    pub fn tracked_paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    /// Record a confirmed-delivery offset. The offset may only move forward;
    /// rewinding is reserved for `reset`.
    pub fn save(&mut self, path: &str, file_id: FileId, offset: u64) -> Result<()> {
        if let Some(existing) = self.entries.get(path) {
            if existing.file_id == file_id && offset < existing.offset {
                return Err(Error::StateCorruption {
                    path: PathBuf::from(path),
                    reason: format!(
                        "offset would move backward: {} -> {}",
                        existing.offset, offset
                    ),
                });
            }
        }
        self.entries
            .insert(path.to_string(), Position { file_id, offset });
        self.sync()
    }

    /// Reset a path to offset 0 under a new fingerprint.
    pub fn reset(&mut self, path: &str, file_id: FileId) -> Result<()> {
        info!(path, "resetting position to 0");
        self.entries
            .insert(path.to_string(), Position { file_id, offset: 0 });
        self.sync()
    }

    pub fn remove(&mut self, path: &str) -> Result<()> {
        if self.entries.remove(path).is_some() {
            debug!(path, "removed position");
            self.sync()?;
        }
        Ok(())
    }

    /// Load the position for `path`, applying the rotation/truncation
    /// recovery rule: a fingerprint mismatch, or a recorded offset past the
    /// file's current size, resets the position to 0 with the current
    /// fingerprint. Returns the offset to resume from.
    pub fn reconcile(&mut self, path: &str) -> Result<u64> {
        let file_id = FileId::from_path(Path::new(path))?;
        let size = fs::metadata(path)?.len();
        match self.entries.get(path) {
            None => Ok(0),
            Some(pos) if pos.file_id != file_id => {
                info!(path, "fingerprint changed, treating as rotated");
                self.reset(path, file_id)?;
                Ok(0)
            }
            Some(pos) if pos.offset > size => {
                info!(path, offset = pos.offset, size, "file truncated below offset");
                self.reset(path, file_id)?;
                Ok(0)
            }
            Some(pos) => Ok(pos.offset),
        }
    }

    /// Create a position without reading content. No-op when already tracked.
    pub fn seed(&mut self, path: &str, offset: u64) -> Result<bool> {
        if self.entries.contains_key(path) {
            debug!(path, "already tracked, seed is a no-op");
            return Ok(false);
        }
        let file_id = FileId::from_path(Path::new(path))?;
        info!(path, offset, "seeding position");
        self.entries
            .insert(path.to_string(), Position { file_id, offset });
        self.sync()?;
        Ok(true)
    }

    /// Write the whole map to disk atomically. In-memory stores skip this.
    fn sync(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp_path = self
            .path
            .with_extension(format!("tmp.{}", std::process::id()));
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &self.entries)?;
        writer.flush()?;
        drop(writer);
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}
