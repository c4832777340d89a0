//! The archive metadata value
//!
//! [`ArchiveMetadata`] is the single unit of persistence: every chunk, every
//! file record and every tracked source directory. Components receive it by
//! value and hand back an updated value; only the store writes it to disk.
//!
//! ## Invariants
//!
//! [`ArchiveMetadata::validate`] enforces the structural rules on every load
//! and every save:
//!
//! - every record references an existing chunk;
//! - a chunk's records never exceed its capacity;
//! - a chunk's cached `used` equals the sum of its records;
//! - record paths are unique and absolute;
//! - chunk ids are dense, starting at 1;
//! - every chunk's capacity is the archive chunk size;
//! - tracked roots are unique.
//!
//! The burnt-chunk rule is a property of transitions, not of a single value,
//! so it is enforced by the allocator instead.

use crate::error::{ArchiveError, Result};
use crate::types::{ArchiveSettings, Chunk, ChunkId, FileRecord, SourceDirectoryRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Current on-disk format version
pub const FORMAT_VERSION: u32 = 1;

/// Everything the archive knows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchiveMetadata {
    /// Format version the document was written with
    pub format_version: u32,
    /// Settings fixed at the first `add`
    pub settings: ArchiveSettings,
    /// Chunks, ordered by id
    #[serde(default)]
    pub chunks: Vec<Chunk>,
    /// File records, ordered by path
    #[serde(default)]
    pub files: Vec<FileRecord>,
    /// Tracked source directories
    #[serde(default)]
    pub sources: Vec<SourceDirectoryRecord>,
}

impl ArchiveMetadata {
    /// Create empty metadata with the given settings
    pub fn new(settings: ArchiveSettings) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            settings,
            chunks: Vec::new(),
            files: Vec::new(),
            sources: Vec::new(),
        }
    }

    /// Check the structural invariants
    ///
    /// `origin` only labels the error. Never repairs anything.
    pub fn validate(&self, origin: &Path) -> Result<()> {
        let corrupt = |reason: String| ArchiveError::corruption(origin, reason);

        if self.format_version > FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported format version {} (newest known is {})",
                self.format_version, FORMAT_VERSION
            )));
        }
        if self.settings.chunk_size == 0 {
            return Err(corrupt("chunk size is zero".to_string()));
        }

        for (index, chunk) in self.chunks.iter().enumerate() {
            let expected = index as ChunkId + 1;
            if chunk.id != expected {
                return Err(corrupt(format!(
                    "chunk ids are not dense: found id {} at position {}",
                    chunk.id, expected
                )));
            }
            if chunk.capacity != self.settings.chunk_size {
                return Err(corrupt(format!(
                    "chunk {} has capacity {} but the archive chunk size is {}",
                    chunk.id, chunk.capacity, self.settings.chunk_size
                )));
            }
        }

        let mut seen = HashSet::with_capacity(self.files.len());
        let mut sums: HashMap<ChunkId, u64> = HashMap::new();
        for record in &self.files {
            if !record.path.is_absolute() {
                return Err(corrupt(format!("record path {:?} is not absolute", record.path)));
            }
            if !seen.insert(record.path.as_path()) {
                return Err(corrupt(format!("duplicate record for {:?}", record.path)));
            }
            if self.chunk(record.chunk_id).is_none() {
                return Err(corrupt(format!(
                    "{:?} is assigned to unknown chunk {}",
                    record.path, record.chunk_id
                )));
            }
            let sum = sums.entry(record.chunk_id).or_default();
            *sum = sum.checked_add(record.size).ok_or_else(|| {
                corrupt(format!("size total of chunk {} overflows", record.chunk_id))
            })?;
        }

        for chunk in &self.chunks {
            let sum = sums.get(&chunk.id).copied().unwrap_or(0);
            if sum > chunk.capacity {
                return Err(corrupt(format!(
                    "chunk {} holds {} bytes but its capacity is {}",
                    chunk.id, sum, chunk.capacity
                )));
            }
            if sum != chunk.used {
                return Err(corrupt(format!(
                    "chunk {} records {} bytes used but its files total {}",
                    chunk.id, chunk.used, sum
                )));
            }
        }

        let mut roots = HashSet::with_capacity(self.sources.len());
        for source in &self.sources {
            if !roots.insert(source.root.as_path()) {
                return Err(corrupt(format!("source {:?} is tracked twice", source.root)));
            }
        }

        Ok(())
    }

    /// Restore the canonical ordering of records
    pub fn normalize(&mut self) {
        self.files.sort_by(|a, b| a.path.cmp(&b.path));
    }

    /// Whether the archive holds no chunks and no records
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty() && self.files.is_empty()
    }

    /// Look up a chunk by id
    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        if id == 0 {
            return None;
        }
        self.chunks.get(id as usize - 1).filter(|c| c.id == id)
    }

    /// Look up a chunk by id, mutably
    pub fn chunk_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
        if id == 0 {
            return None;
        }
        self.chunks.get_mut(id as usize - 1).filter(|c| c.id == id)
    }

    /// Append a new empty chunk and return its id
    pub fn push_chunk(&mut self, capacity: u64) -> ChunkId {
        let id = self.chunks.len() as ChunkId + 1;
        self.chunks.push(Chunk::new(id, capacity));
        id
    }

    /// Ids of burnt chunks
    pub fn burnt_chunks(&self) -> Vec<ChunkId> {
        self.chunks.iter().filter(|c| c.burnt).map(|c| c.id).collect()
    }

    /// First chunk that has not been burnt yet
    pub fn first_unburnt(&self) -> Option<&Chunk> {
        self.chunks.iter().find(|c| !c.burnt)
    }

    /// Look up the record for a source path
    pub fn record(&self, path: &Path) -> Option<&FileRecord> {
        self.files
            .binary_search_by(|r| r.path.as_path().cmp(path))
            .ok()
            .map(|i| &self.files[i])
    }

    /// Look up the record for a source path, mutably
    pub fn record_mut(&mut self, path: &Path) -> Option<&mut FileRecord> {
        self.files
            .binary_search_by(|r| r.path.as_path().cmp(path))
            .ok()
            .map(move |i| &mut self.files[i])
    }

    /// Whether a source path is already known
    pub fn contains_path(&self, path: &Path) -> bool {
        self.record(path).is_some()
    }

    /// Records assigned to a chunk
    pub fn records_in_chunk(&self, id: ChunkId) -> impl Iterator<Item = &FileRecord> {
        self.files.iter().filter(move |r| r.chunk_id == id)
    }

    /// Records whose source lives under `root`
    pub fn records_under<'a>(&'a self, root: &'a Path) -> impl Iterator<Item = &'a FileRecord> {
        self.files.iter().filter(move |r| r.path.starts_with(root))
    }

    /// Add records to their chunks
    ///
    /// Updates each target chunk's `used` total. Callers are responsible for
    /// capacity and burnt checks; a missing chunk is an internal error.
    pub fn admit(&mut self, records: Vec<FileRecord>) -> Result<()> {
        for record in &records {
            let chunk = self.chunk_mut(record.chunk_id).ok_or_else(|| {
                ArchiveError::internal(format!(
                    "record {:?} targets missing chunk {}",
                    record.path, record.chunk_id
                ))
            })?;
            chunk.used += record.size;
        }
        self.files.extend(records);
        self.normalize();
        Ok(())
    }

    /// Tracked source record for an exact root
    pub fn source(&self, root: &Path) -> Option<&SourceDirectoryRecord> {
        self.sources.iter().find(|s| s.root == root)
    }

    /// Tracked source whose root is the longest prefix of `path`
    pub fn source_for_path(&self, path: &Path) -> Option<&SourceDirectoryRecord> {
        self.sources
            .iter()
            .filter(|s| s.contains(path))
            .max_by_key(|s| s.root.components().count())
    }

    /// Recompute file count and byte total of a tracked root
    ///
    /// Sets `last_scanned` when `scanned_at` is given.
    pub fn refresh_source(&mut self, root: &Path, scanned_at: Option<DateTime<Utc>>) {
        let (count, bytes) = self
            .records_under(root)
            .fold((0usize, 0u64), |(n, b), r| (n + 1, b + r.size));

        if let Some(source) = self.sources.iter_mut().find(|s| s.root == root) {
            source.file_count = count;
            source.total_bytes = bytes;
            if scanned_at.is_some() {
                source.last_scanned = scanned_at;
            }
        }
    }

    /// Total bytes across all records
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|r| r.size).sum()
    }
}

impl Default for ArchiveMetadata {
    fn default() -> Self {
        Self::new(ArchiveSettings::default())
    }
}
