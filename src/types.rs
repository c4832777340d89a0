//! Core data types used throughout brarch
//!
//! This module contains the records persisted in the archive metadata and the
//! report values returned by the archive commands.
//!
//! ## Overview
//!
//! - **Persisted records**: [`FileRecord`], [`Chunk`], [`SourceDirectoryRecord`],
//!   [`ArchiveSettings`]
//! - **Configuration**: [`LinkStrategy`], [`ResetPolicy`]
//! - **Scanner output**: [`ScannedFile`]
//! - **Command reports**: [`AddReport`], [`RescanReport`], [`BurnReport`],
//!   [`RehashReport`], [`ResetReport`], [`RestoreReport`], [`IsoSuggestion`]
//!
//! Every report implements [`CommandReport`], which tells the caller whether the
//! command fully succeeded or only partially (some items skipped or failed).

use crate::allocator::AllocationReport;
use crate::reconcile::ReconcileReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Chunk identifier; dense, starting at 1
pub type ChunkId = u32;

/// One GiB, the unit chunk sizes are given in on the command line
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Default chunk capacity (20 GiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 20 * GIB;

/// A file known to the archive
///
/// Created once by the allocator when the file is first discovered. Only the
/// hash (rehash) and the chunk id (restore) are ever changed afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    /// Absolute source path, unique within the archive
    pub path: PathBuf,
    /// Size in bytes at discovery time
    pub size: u64,
    /// Hex SHA-256 of the content, if computed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Chunk the file is assigned to
    pub chunk_id: ChunkId,
    /// When the file was first seen
    pub discovered_at: DateTime<Utc>,
}

/// A fixed-capacity bucket representing one unit of target media
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk id (1-based, dense)
    pub id: ChunkId,
    /// Capacity in bytes
    pub capacity: u64,
    /// Whether the chunk has been written to media; never reset
    #[serde(default)]
    pub burnt: bool,
    /// Bytes assigned to the chunk, cached from its records
    pub used: u64,
}

impl Chunk {
    /// Create an empty, unburnt chunk
    pub fn new(id: ChunkId, capacity: u64) -> Self {
        Self {
            id,
            capacity,
            burnt: false,
            used: 0,
        }
    }

    /// Free bytes left in the chunk
    pub fn remaining(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }

    /// Whether `size` more bytes can be placed here
    pub fn can_accept(&self, size: u64) -> bool {
        !self.burnt && size <= self.remaining()
    }

    /// Fill ratio between 0.0 and 1.0
    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.used as f64 / self.capacity as f64
    }
}

/// A root directory explicitly added to the archive
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceDirectoryRecord {
    /// Canonical root path
    pub root: PathBuf,
    /// When the root was first added
    pub added_at: DateTime<Utc>,
    /// When the root was last walked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scanned: Option<DateTime<Utc>>,
    /// Ignore globs the root was added with
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    /// Number of archived files under the root
    pub file_count: usize,
    /// Bytes of archived files under the root
    pub total_bytes: u64,
}

impl SourceDirectoryRecord {
    /// Create a record for a freshly added root
    pub fn new(root: PathBuf, ignore_patterns: Vec<String>, now: DateTime<Utc>) -> Self {
        Self {
            root,
            added_at: now,
            last_scanned: None,
            ignore_patterns,
            file_count: 0,
            total_bytes: 0,
        }
    }

    /// Whether `path` lives under this root
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }
}

/// How reference entries are materialised inside chunk directories
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkStrategy {
    /// Native symbolic links
    Symlink,
    /// Link-to-target mapping kept in `links_manifest.json`
    Manifest,
}

impl Default for LinkStrategy {
    #[cfg(unix)]
    fn default() -> Self {
        LinkStrategy::Symlink
    }

    #[cfg(not(unix))]
    fn default() -> Self {
        LinkStrategy::Manifest
    }
}

/// Settings fixed by the first `add` and reused by every later command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveSettings {
    /// Capacity of newly created chunks, in bytes
    pub chunk_size: u64,
    /// Reference entry strategy
    #[serde(default)]
    pub link_strategy: LinkStrategy,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            link_strategy: LinkStrategy::default(),
        }
    }
}

/// What `reset` does with the tracked-directory history
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResetPolicy {
    /// Keep source directory records so a rescan can rebuild the archive
    #[default]
    KeepHistory,
    /// Drop source directory records too
    ClearHistory,
}

/// A file found by a directory walk, not yet known to the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    /// Canonical absolute path
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Content hash, when hashing was requested
    pub hash: Option<String>,
}

impl ScannedFile {
    /// Create a scanned file entry
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            hash: None,
        }
    }

    /// Directory the file is grouped under during allocation
    pub fn group(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }
}

/// A per-item failure that did not abort the command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemFailure {
    /// Path the failure concerns
    pub path: PathBuf,
    /// Human readable cause
    pub reason: String,
}

impl ItemFailure {
    /// Create a failure entry
    pub fn new(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Whether a command fully succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Everything requested was done
    Success,
    /// The command completed but skipped or failed on some items
    Partial,
}

/// Common interface of command reports
pub trait CommandReport {
    /// Success or partial success
    fn outcome(&self) -> Outcome;
}

fn outcome_if(clean: bool) -> Outcome {
    if clean {
        Outcome::Success
    } else {
        Outcome::Partial
    }
}

/// Result of `add`
#[derive(Debug, Clone)]
pub struct AddReport {
    /// Canonical root that was added
    pub root: PathBuf,
    /// Files found by the walk
    pub files_scanned: usize,
    /// Files not previously known
    pub new_files: usize,
    /// Placement decisions
    pub allocation: AllocationReport,
    /// Reference entry sync after allocation
    pub reconcile: ReconcileReport,
    /// Walk errors
    pub scan_failures: Vec<ItemFailure>,
    /// Files whose hash could not be computed
    pub hash_failures: Vec<ItemFailure>,
}

impl CommandReport for AddReport {
    fn outcome(&self) -> Outcome {
        outcome_if(
            self.allocation.skipped.is_empty()
                && self.scan_failures.is_empty()
                && self.hash_failures.is_empty()
                && self.reconcile.failures.is_empty(),
        )
    }
}

/// Result of `rescan`
#[derive(Debug, Clone)]
pub struct RescanReport {
    /// Roots that were walked
    pub roots_scanned: usize,
    /// Tracked roots that no longer exist
    pub missing_roots: Vec<PathBuf>,
    /// Files not previously known, across all roots
    pub new_files: usize,
    /// Placement decisions
    pub allocation: AllocationReport,
    /// Reference entry sync after allocation
    pub reconcile: ReconcileReport,
    /// Walk errors
    pub scan_failures: Vec<ItemFailure>,
    /// Files whose hash could not be computed
    pub hash_failures: Vec<ItemFailure>,
}

impl CommandReport for RescanReport {
    fn outcome(&self) -> Outcome {
        outcome_if(
            self.missing_roots.is_empty()
                && self.allocation.skipped.is_empty()
                && self.scan_failures.is_empty()
                && self.hash_failures.is_empty()
                && self.reconcile.failures.is_empty(),
        )
    }
}

/// Result of `burn`
#[derive(Debug, Clone, Default)]
pub struct BurnReport {
    /// Chunks marked burnt by this call
    pub newly_burnt: Vec<ChunkId>,
    /// Chunks that were burnt already
    pub already_burnt: Vec<ChunkId>,
}

impl CommandReport for BurnReport {
    fn outcome(&self) -> Outcome {
        Outcome::Success
    }
}

/// A content hash that changed since it was last recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashChange {
    /// Source path
    pub path: PathBuf,
    /// Previously recorded hash
    pub old: String,
    /// Freshly computed hash
    pub new: String,
}

/// Result of `rehash`
#[derive(Debug, Clone, Default)]
pub struct RehashReport {
    /// Records whose hash was (re)computed
    pub hashed: usize,
    /// Records left alone
    pub unchanged: usize,
    /// Recomputed hashes that differ from the recorded one
    pub changed: Vec<HashChange>,
    /// Records whose source is gone
    pub missing: Vec<PathBuf>,
    /// Records whose source size no longer matches
    pub resized: Vec<PathBuf>,
    /// Hashing errors
    pub failures: Vec<ItemFailure>,
}

impl CommandReport for RehashReport {
    fn outcome(&self) -> Outcome {
        outcome_if(self.missing.is_empty() && self.failures.is_empty())
    }
}

/// Result of `reset`
#[derive(Debug, Clone)]
pub struct ResetReport {
    /// Snapshot written before clearing
    pub backup: PathBuf,
    /// Chunk directories removed
    pub removed_dirs: Vec<PathBuf>,
    /// Directories that could not be removed
    pub failures: Vec<ItemFailure>,
    /// Whether tracked directories were dropped as well
    pub history_cleared: bool,
}

impl CommandReport for ResetReport {
    fn outcome(&self) -> Outcome {
        outcome_if(self.failures.is_empty())
    }
}

/// A snapshot record left out of a restore because its source is gone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingSource {
    /// Source path recorded in the snapshot
    pub path: PathBuf,
    /// Chunk it was assigned to
    pub chunk_id: ChunkId,
}

/// Result of `restore`
#[derive(Debug, Clone)]
pub struct RestoreReport {
    /// Snapshot the archive was rebuilt from
    pub snapshot: PathBuf,
    /// Backup of the metadata that was replaced, if there was any
    pub previous_backup: Option<PathBuf>,
    /// Records re-admitted with their original chunk
    pub restored: usize,
    /// Records excluded because the source no longer exists
    pub missing: Vec<MissingSource>,
    /// Re-admitted records whose source size changed since the snapshot
    pub resized: Vec<PathBuf>,
    /// Reference entry rebuild
    pub reconcile: ReconcileReport,
}

impl CommandReport for RestoreReport {
    fn outcome(&self) -> Outcome {
        outcome_if(self.missing.is_empty() && self.reconcile.failures.is_empty())
    }
}

/// Suggested command for writing a chunk to an ISO image
#[derive(Debug, Clone, PartialEq)]
pub struct IsoSuggestion {
    /// Chunk the command is for
    pub chunk_id: ChunkId,
    /// Shell command line
    pub command: String,
    /// Bytes assigned to the chunk
    pub used: u64,
    /// Chunk capacity
    pub capacity: u64,
    /// Whether the chunk is less than 80 % full
    pub underfilled: bool,
}
