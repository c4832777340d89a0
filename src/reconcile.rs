//! Reconciliation of metadata and reference entries
//!
//! The metadata says which reference entries should exist; the chunk
//! directories say which ones do. The [`Reconciler`] compares both, chunk by
//! chunk, and classifies every difference:
//!
//! | kind | meaning | fix mode |
//! |---|---|---|
//! | Missing | a record has no entry | create it |
//! | Orphan (untracked) | an entry has no record | remove it |
//! | Orphan (wrong target) | an entry points elsewhere | replace it |
//! | Orphan (not a reference) | a plain file sits in the chunk | leave it, report |
//! | Broken | a record's source is gone | remove the entry, keep the record |
//!
//! Check mode only reports. Fix mode applies the smallest set of creates and
//! removes in one pass; running it again applies nothing.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use brarch::layout::Layout;
//! use brarch::links::SymlinkStore;
//! use brarch::reconcile::{ReconcileOptions, Reconciler};
//! use brarch::store::MetadataStore;
//!
//! # fn main() -> brarch::Result<()> {
//! let store = MetadataStore::new(".");
//! let metadata = store.load()?;
//! let layout = Layout::new(".");
//! let mut links = SymlinkStore::new();
//!
//! let report = Reconciler::new(&layout, &mut links, ReconcileOptions::check())
//!     .run(&metadata)?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use crate::layout::Layout;
use crate::links::ReferenceStore;
use crate::metadata::ArchiveMetadata;
use crate::types::{ChunkId, CommandReport, ItemFailure, Outcome};
use crate::utils::{prune_empty_dirs, remove_dir_if_empty};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Why an entry counts as an orphan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum OrphanReason {
    /// No record maps to this entry
    Untracked,
    /// The entry belongs to a record but points elsewhere
    WrongTarget {
        /// Source path the entry should point to
        expected: PathBuf,
    },
    /// Something other than a reference sits at this path
    NotAReference,
}

/// Classification of a difference between metadata and the filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// Expected entry is absent
    Missing,
    /// Entry that should not be there
    Orphan(OrphanReason),
    /// Entry for a record whose source no longer exists
    Broken,
}

/// One difference found during reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discrepancy {
    /// Chunk the entry belongs to
    pub chunk_id: ChunkId,
    /// Path of the entry
    pub link: PathBuf,
    /// Target involved (recorded source, or current target for orphans)
    pub target: Option<PathBuf>,
    /// What is wrong
    pub kind: DiscrepancyKind,
}

/// Reconciliation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Apply repairs instead of only reporting
    pub fix: bool,
    /// Leave burnt chunks alone
    pub skip_burnt: bool,
}

impl ReconcileOptions {
    /// Report only
    pub fn check() -> Self {
        Self::default()
    }

    /// Report and repair
    pub fn fix() -> Self {
        Self {
            fix: true,
            ..Self::default()
        }
    }

    /// Set whether burnt chunks are skipped
    pub fn skip_burnt(mut self, skip: bool) -> Self {
        self.skip_burnt = skip;
        self
    }
}

/// Result of a reconciliation pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Whether repairs were applied
    pub fixed: bool,
    /// Every difference found
    pub discrepancies: Vec<Discrepancy>,
    /// Entries created
    pub created: usize,
    /// Entries removed
    pub removed: usize,
    /// Directories pruned after removals
    pub pruned_dirs: usize,
    /// Differences that remain after this pass
    pub unresolved: usize,
    /// Chunks compared
    pub chunks_checked: usize,
    /// Burnt chunks skipped
    pub skipped_burnt: Vec<ChunkId>,
    /// Per-entry filesystem errors
    pub failures: Vec<ItemFailure>,
    /// Time taken in milliseconds
    pub duration_ms: u64,
}

impl ReconcileReport {
    /// No differences and no errors
    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty() && self.failures.is_empty()
    }

    /// Number of filesystem mutations performed
    pub fn changes_applied(&self) -> usize {
        self.created + self.removed
    }

    fn count(&self, pred: impl Fn(&DiscrepancyKind) -> bool) -> usize {
        self.discrepancies.iter().filter(|d| pred(&d.kind)).count()
    }

    /// Number of missing entries
    pub fn missing(&self) -> usize {
        self.count(|k| matches!(k, DiscrepancyKind::Missing))
    }

    /// Number of orphan entries
    pub fn orphans(&self) -> usize {
        self.count(|k| matches!(k, DiscrepancyKind::Orphan(_)))
    }

    /// Number of broken entries
    pub fn broken(&self) -> usize {
        self.count(|k| matches!(k, DiscrepancyKind::Broken))
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        format!(
            "{} chunks checked: {} missing, {} orphaned, {} broken; {} created, {} removed, {} errors",
            self.chunks_checked,
            self.missing(),
            self.orphans(),
            self.broken(),
            self.created,
            self.removed,
            self.failures.len()
        )
    }

    fn push(&mut self, chunk_id: ChunkId, link: &Path, target: Option<PathBuf>, kind: DiscrepancyKind) {
        self.discrepancies.push(Discrepancy {
            chunk_id,
            link: link.to_path_buf(),
            target,
            kind,
        });
    }
}

impl CommandReport for ReconcileReport {
    fn outcome(&self) -> Outcome {
        if self.unresolved == 0 && self.failures.is_empty() {
            Outcome::Success
        } else {
            Outcome::Partial
        }
    }
}

/// Compares and repairs reference entries against metadata
#[derive(Debug)]
pub struct Reconciler<'a> {
    layout: &'a Layout,
    links: &'a mut dyn ReferenceStore,
    options: ReconcileOptions,
}

impl<'a> Reconciler<'a> {
    /// Create a reconciler over `layout`, using `links` for entry access
    pub fn new(layout: &'a Layout, links: &'a mut dyn ReferenceStore, options: ReconcileOptions) -> Self {
        Self {
            layout,
            links,
            options,
        }
    }

    /// Run one pass over every chunk in `metadata` and on disk
    pub fn run(&mut self, metadata: &ArchiveMetadata) -> Result<ReconcileReport> {
        let start = Instant::now();
        let mut report = ReconcileReport {
            fixed: self.options.fix,
            ..Default::default()
        };

        let expected = self.expected_entries(metadata, &mut report);

        let mut chunk_ids: BTreeSet<ChunkId> = metadata.chunks.iter().map(|c| c.id).collect();
        for (id, _) in self.layout.chunk_dirs_on_disk()? {
            if metadata.chunk(id).is_none() {
                debug!("Chunk directory {} is not in the metadata", id);
            }
            chunk_ids.insert(id);
        }
        chunk_ids.extend(self.links.known_chunks());

        let empty = BTreeMap::new();
        for id in chunk_ids {
            if self.options.skip_burnt && metadata.chunk(id).is_some_and(|c| c.burnt) {
                report.skipped_burnt.push(id);
                continue;
            }
            report.chunks_checked += 1;
            let wanted = expected.get(&id).unwrap_or(&empty);
            self.reconcile_chunk(id, wanted, &mut report)?;
            if self.options.fix && metadata.chunk(id).is_none() {
                self.retire_chunk_dir(id, &mut report);
            }
        }

        if self.options.fix {
            self.links.flush()?;
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        if report.is_clean() {
            info!("Reconciled {} chunks: no discrepancies", report.chunks_checked);
        } else {
            info!("{}", report.summary());
        }
        Ok(report)
    }

    fn expected_entries(
        &self,
        metadata: &ArchiveMetadata,
        report: &mut ReconcileReport,
    ) -> BTreeMap<ChunkId, BTreeMap<PathBuf, PathBuf>> {
        let mut expected: BTreeMap<ChunkId, BTreeMap<PathBuf, PathBuf>> = BTreeMap::new();
        for record in &metadata.files {
            let link = self.layout.link_path(metadata, record);
            let chunk = expected.entry(record.chunk_id).or_default();
            if let Some(other) = chunk.get(&link) {
                warn!("{:?} and {:?} map to the same entry {:?}", other, record.path, link);
                report.failures.push(ItemFailure::new(
                    &record.path,
                    format!("entry {:?} is already used by {:?}", link, other),
                ));
                continue;
            }
            chunk.insert(link, record.path.clone());
        }
        expected
    }

    fn reconcile_chunk(
        &mut self,
        id: ChunkId,
        wanted: &BTreeMap<PathBuf, PathBuf>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let chunk_dir = self.layout.chunk_dir(id);
        let listing = self.links.entries(&chunk_dir)?;
        report.failures.extend(listing.failures);

        let present: HashSet<&Path> = listing.entries.iter().map(PathBuf::as_path).collect();

        for entry in &listing.entries {
            if wanted.contains_key(entry) {
                continue;
            }
            match self.links.resolve(entry) {
                Ok(Some(target)) => {
                    report.push(id, entry, Some(target), DiscrepancyKind::Orphan(OrphanReason::Untracked));
                    if self.options.fix {
                        self.remove_entry(entry, &chunk_dir, report);
                    } else {
                        report.unresolved += 1;
                    }
                }
                Ok(None) => {
                    report.push(id, entry, None, DiscrepancyKind::Orphan(OrphanReason::NotAReference));
                    report.unresolved += 1;
                }
                Err(e) => report.failures.push(ItemFailure::new(entry, e)),
            }
        }

        for (link, target) in wanted {
            let source_exists = fs::metadata(target).is_ok();

            if !present.contains(link.as_path()) && !self.links.exists(link) {
                if source_exists {
                    report.push(id, link, Some(target.clone()), DiscrepancyKind::Missing);
                    if self.options.fix {
                        self.create_entry(target, link, report);
                    } else {
                        report.unresolved += 1;
                    }
                } else {
                    report.push(id, link, Some(target.clone()), DiscrepancyKind::Broken);
                    report.unresolved += 1;
                }
                continue;
            }

            match self.links.resolve(link) {
                Ok(Some(current)) if current == *target => {
                    if !source_exists {
                        report.push(id, link, Some(target.clone()), DiscrepancyKind::Broken);
                        report.unresolved += 1;
                        if self.options.fix {
                            self.remove_entry(link, &chunk_dir, report);
                        }
                    }
                }
                Ok(Some(current)) => {
                    report.push(
                        id,
                        link,
                        Some(current),
                        DiscrepancyKind::Orphan(OrphanReason::WrongTarget {
                            expected: target.clone(),
                        }),
                    );
                    if !self.options.fix {
                        report.unresolved += 1;
                        continue;
                    }
                    if !self.remove_entry(link, &chunk_dir, report) {
                        continue;
                    }
                    if source_exists {
                        self.create_entry(target, link, report);
                    } else {
                        report.push(id, link, Some(target.clone()), DiscrepancyKind::Broken);
                        report.unresolved += 1;
                    }
                }
                Ok(None) => {
                    report.push(id, link, None, DiscrepancyKind::Orphan(OrphanReason::NotAReference));
                    report.unresolved += 1;
                }
                Err(e) => report.failures.push(ItemFailure::new(link, e)),
            }
        }

        Ok(())
    }

    /// Drop the catalogue and, once empty, the directory of a chunk the
    /// metadata no longer has
    fn retire_chunk_dir(&self, id: ChunkId, report: &mut ReconcileReport) {
        let meta_dir = self.layout.meta_dir(id);
        if meta_dir.is_dir() {
            if let Err(e) = fs::remove_dir_all(&meta_dir) {
                warn!("Failed to remove stale catalogue {:?}: {}", meta_dir, e);
                report.failures.push(ItemFailure::new(meta_dir, e));
                return;
            }
        }

        let chunk_dir = self.layout.chunk_dir(id);
        match remove_dir_if_empty(&chunk_dir) {
            Ok(true) => {
                debug!("Removed directory of unknown chunk {}", id);
                report.pruned_dirs += 1;
            }
            Ok(false) => {}
            Err(e) => report.failures.push(ItemFailure::new(chunk_dir, e)),
        }
    }

    fn create_entry(&mut self, target: &Path, link: &Path, report: &mut ReconcileReport) -> bool {
        match self.links.create(target, link) {
            Ok(()) => {
                report.created += 1;
                true
            }
            Err(e) => {
                warn!("Failed to create {:?}: {}", link, e);
                report.failures.push(ItemFailure::new(link, e));
                false
            }
        }
    }

    fn remove_entry(&mut self, link: &Path, chunk_dir: &Path, report: &mut ReconcileReport) -> bool {
        if let Err(e) = self.links.remove(link) {
            warn!("Failed to remove {:?}: {}", link, e);
            report.failures.push(ItemFailure::new(link, e));
            return false;
        }
        report.removed += 1;

        if let Some(parent) = link.parent() {
            match prune_empty_dirs(parent, chunk_dir) {
                Ok(n) => report.pruned_dirs += n,
                Err(e) => report.failures.push(ItemFailure::new(parent, e)),
            }
        }
        true
    }
}
