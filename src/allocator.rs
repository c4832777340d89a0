//! Best-fit-decreasing chunk allocation
//!
//! The allocator merges a batch of newly discovered files into the existing
//! chunk layout. Prior assignments are never touched; burnt chunks are never
//! considered.
//!
//! ## Algorithm
//!
//! 1. Files already known (or repeated in the batch) are dropped. A file larger
//!    than the configured chunk size is skipped and reported.
//! 2. The remaining files are grouped by their immediate parent directory.
//! 3. Groups are ordered by total size, largest first; equal totals are ordered
//!    by directory path.
//! 4. Each group goes, whole, to the unburnt chunk that would be left with the
//!    least free space (lowest id on ties). If no chunk can take it and it fits
//!    an empty chunk, a new chunk is appended. A group larger than an empty
//!    chunk is placed file by file, largest first, with the same rule.
//!
//! Allocation is a pure transformation of [`ArchiveMetadata`]: it has no
//! filesystem side effects.
//!
//! ```text
//! capacity 20, chunk 1 empty
//! /d: 10 + 8 + 5 = 23  > 20  -> per file
//!   10 -> chunk 1 (10 left)
//!    8 -> chunk 1 ( 2 left)
//!    5 -> chunk 2 (new)
//! ```

use crate::error::{ArchiveError, Result};
use crate::metadata::ArchiveMetadata;
use crate::types::{ChunkId, FileRecord, ScannedFile};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tracing::{debug, info, trace, warn};

/// A file the allocator refused because it cannot fit any chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    /// Source path
    pub path: PathBuf,
    /// File size
    pub size: u64,
    /// Chunk capacity it exceeds
    pub limit: u64,
}

/// Outcome of one allocation run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationReport {
    /// Newly placed files per chunk
    pub placed: BTreeMap<ChunkId, Vec<PathBuf>>,
    /// Chunks appended during this run
    pub new_chunks: Vec<ChunkId>,
    /// Files larger than a chunk
    pub skipped: Vec<SkippedFile>,
    /// Directories that had to be split across chunks
    pub split_groups: Vec<PathBuf>,
    /// Batch entries that were already known
    pub already_known: usize,
    /// Bytes placed in this run
    pub bytes_placed: u64,
}

impl AllocationReport {
    /// Number of files placed
    pub fn files_placed(&self) -> usize {
        self.placed.values().map(Vec::len).sum()
    }

    /// Whether the run changed nothing
    pub fn is_noop(&self) -> bool {
        self.placed.is_empty() && self.new_chunks.is_empty()
    }
}

/// Allocates new files to chunks
#[derive(Debug, Clone)]
pub struct Allocator {
    discovered_at: DateTime<Utc>,
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Files of one directory, placed together when possible
struct Group {
    dir: PathBuf,
    total: u64,
    files: Vec<ScannedFile>,
}

/// Free space per chunk while a run is in progress
struct Workspace {
    chunk_size: u64,
    remaining: Vec<u64>,
    burnt: Vec<bool>,
}

impl Workspace {
    fn new(metadata: &ArchiveMetadata) -> Self {
        Self {
            chunk_size: metadata.settings.chunk_size,
            remaining: metadata.chunks.iter().map(|c| c.remaining()).collect(),
            burnt: metadata.chunks.iter().map(|c| c.burnt).collect(),
        }
    }

    /// Unburnt chunk left with the least free space after taking `size`
    fn best_fit(&self, size: u64) -> Option<ChunkId> {
        let mut best: Option<(usize, u64)> = None;
        for (index, (&remaining, &burnt)) in self.remaining.iter().zip(&self.burnt).enumerate() {
            if burnt || remaining < size {
                continue;
            }
            let left = remaining - size;
            if best.map_or(true, |(_, best_left)| left < best_left) {
                best = Some((index, left));
            }
        }
        best.map(|(index, _)| index as ChunkId + 1)
    }

    fn take(&mut self, id: ChunkId, size: u64) {
        let slot = &mut self.remaining[id as usize - 1];
        *slot = slot.saturating_sub(size);
    }

    fn open_chunk(&mut self, metadata: &mut ArchiveMetadata, report: &mut AllocationReport) -> ChunkId {
        let id = metadata.push_chunk(self.chunk_size);
        self.remaining.push(self.chunk_size);
        self.burnt.push(false);
        report.new_chunks.push(id);
        debug!("Opened chunk {}", id);
        id
    }
}

impl Allocator {
    /// Create an allocator stamping new records with the current time
    pub fn new() -> Self {
        Self {
            discovered_at: Utc::now(),
        }
    }

    /// Stamp new records with `discovered_at` instead
    pub fn with_timestamp(mut self, discovered_at: DateTime<Utc>) -> Self {
        self.discovered_at = discovered_at;
        self
    }

    /// Place `batch` into the chunks of `metadata`
    ///
    /// Returns the updated metadata and what was done. The input metadata is
    /// consumed; on error nothing has been persisted and the caller still
    /// holds the stored copy.
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::BurntChunkViolation`] if a record ended up in a burnt
    ///   chunk
    /// - [`ArchiveError::Internal`] if a chunk ended up over capacity
    pub fn allocate(
        &self,
        mut metadata: ArchiveMetadata,
        batch: Vec<ScannedFile>,
    ) -> Result<(ArchiveMetadata, AllocationReport)> {
        let mut report = AllocationReport::default();
        let chunk_size = metadata.settings.chunk_size;

        let candidates = self.filter_batch(&metadata, batch, &mut report);
        if candidates.is_empty() {
            debug!("Nothing to allocate ({} already known)", report.already_known);
            return Ok((metadata, report));
        }

        let groups = group_by_directory(candidates);
        let mut workspace = Workspace::new(&metadata);
        let mut records = Vec::new();

        for group in groups {
            if let Some(id) = workspace.best_fit(group.total) {
                trace!("Group {:?} ({} bytes) -> chunk {}", group.dir, group.total, id);
                workspace.take(id, group.total);
                self.place_all(group.files, id, &mut records, &mut report);
            } else if group.total <= chunk_size {
                // Every chunk has `chunk_size` capacity, so a fresh one holds the group
                let id = workspace.open_chunk(&mut metadata, &mut report);
                trace!("Group {:?} ({} bytes) -> new chunk {}", group.dir, group.total, id);
                workspace.take(id, group.total);
                self.place_all(group.files, id, &mut records, &mut report);
            } else {
                debug!(
                    "Group {:?} ({} bytes) exceeds a chunk, placing files individually",
                    group.dir, group.total
                );
                report.split_groups.push(group.dir);
                let mut files = group.files;
                files.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));
                for file in files {
                    let id = match workspace.best_fit(file.size) {
                        Some(id) => id,
                        None => workspace.open_chunk(&mut metadata, &mut report),
                    };
                    workspace.take(id, file.size);
                    self.place_all(vec![file], id, &mut records, &mut report);
                }
            }
        }

        verify_placement(&metadata, &records)?;
        metadata.admit(records)?;

        info!(
            "Allocated {} files ({} bytes) into {} chunks, {} new",
            report.files_placed(),
            report.bytes_placed,
            report.placed.len(),
            report.new_chunks.len()
        );
        Ok((metadata, report))
    }

    fn filter_batch(
        &self,
        metadata: &ArchiveMetadata,
        batch: Vec<ScannedFile>,
        report: &mut AllocationReport,
    ) -> Vec<ScannedFile> {
        let chunk_size = metadata.settings.chunk_size;
        let mut seen = HashSet::with_capacity(batch.len());
        let mut kept = Vec::with_capacity(batch.len());

        for file in batch {
            if metadata.contains_path(&file.path) || !seen.insert(file.path.clone()) {
                report.already_known += 1;
                continue;
            }
            if file.size > chunk_size {
                warn!(
                    "Skipping {:?}: {} bytes exceeds the chunk size of {} bytes",
                    file.path, file.size, chunk_size
                );
                report.skipped.push(SkippedFile {
                    path: file.path,
                    size: file.size,
                    limit: chunk_size,
                });
                continue;
            }
            kept.push(file);
        }
        kept
    }

    fn place_all(
        &self,
        files: Vec<ScannedFile>,
        chunk_id: ChunkId,
        records: &mut Vec<FileRecord>,
        report: &mut AllocationReport,
    ) {
        let placed = report.placed.entry(chunk_id).or_default();
        for file in files {
            report.bytes_placed += file.size;
            placed.push(file.path.clone());
            records.push(FileRecord {
                path: file.path,
                size: file.size,
                hash: file.hash,
                chunk_id,
                discovered_at: self.discovered_at,
            });
        }
    }
}

fn group_by_directory(files: Vec<ScannedFile>) -> Vec<Group> {
    let mut by_dir: BTreeMap<PathBuf, Vec<ScannedFile>> = BTreeMap::new();
    for file in files {
        by_dir.entry(file.group()).or_default().push(file);
    }

    let mut groups: Vec<Group> = by_dir
        .into_iter()
        .map(|(dir, files)| Group {
            total: files.iter().map(|f| f.size).sum(),
            dir,
            files,
        })
        .collect();
    groups.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.dir.cmp(&b.dir)));
    groups
}

fn verify_placement(metadata: &ArchiveMetadata, records: &[FileRecord]) -> Result<()> {
    let mut added: BTreeMap<ChunkId, u64> = BTreeMap::new();
    for record in records {
        let chunk = metadata.chunk(record.chunk_id).ok_or_else(|| {
            ArchiveError::internal(format!("placed into unknown chunk {}", record.chunk_id))
        })?;
        if chunk.burnt {
            return Err(ArchiveError::BurntChunkViolation {
                path: record.path.clone(),
                chunk_id: chunk.id,
            });
        }
        *added.entry(record.chunk_id).or_default() += record.size;
    }

    for (id, bytes) in added {
        if let Some(chunk) = metadata.chunk(id) {
            if !chunk.can_accept(bytes) {
                return Err(ArchiveError::internal(format!(
                    "chunk {} would hold {} bytes, over its capacity of {}",
                    id,
                    chunk.used.saturating_add(bytes),
                    chunk.capacity
                )));
            }
        }
    }
    Ok(())
}
