//! Reset and restore
//!
//! - **Reset** snapshots the current metadata, removes every chunk directory
//!   and persists an archive without chunks or records. Tracked directories
//!   survive unless [`ResetPolicy::ClearHistory`] is requested, so a later
//!   `rescan` can rebuild the archive from scratch.
//! - **Restore** rebuilds the archive from a snapshot. Records whose source
//!   still exists return to their original chunk; nothing is re-packed.
//!   Records whose source is gone are left out and reported. Chunk ids,
//!   capacities and burnt flags are taken over as they were, so ids stay
//!   dense even when a chunk ends up empty.

use crate::error::{ArchiveError, Result};
use crate::layout::Layout;
use crate::links::ReferenceStore;
use crate::metadata::ArchiveMetadata;
use crate::reconcile::{ReconcileOptions, Reconciler};
use crate::store::MetadataStore;
use crate::types::{ItemFailure, MissingSource, ResetPolicy, ResetReport, RestoreReport};
use std::fs;
use std::path::Path;
use tracing::{info, instrument, warn};

/// Performs reset and restore against one archive root
#[derive(Debug)]
pub struct LifecycleManager<'a> {
    store: &'a MetadataStore,
    layout: &'a Layout,
}

impl<'a> LifecycleManager<'a> {
    /// Create a manager for the archive behind `store` and `layout`
    pub fn new(store: &'a MetadataStore, layout: &'a Layout) -> Self {
        Self { store, layout }
    }

    /// Snapshot, clear and persist
    ///
    /// Returns the persisted, emptied metadata.
    #[instrument(skip(self, metadata, links))]
    pub fn reset(
        &self,
        metadata: ArchiveMetadata,
        links: &mut dyn ReferenceStore,
        policy: ResetPolicy,
    ) -> Result<(ArchiveMetadata, ResetReport)> {
        let backup = self.store.backup(&metadata)?;

        let mut removed_dirs = Vec::new();
        let mut failures = Vec::new();
        for (id, dir) in self.layout.chunk_dirs_on_disk()? {
            match fs::remove_dir_all(&dir) {
                Ok(()) => {
                    info!("Removed chunk directory {}", id);
                    removed_dirs.push(dir);
                }
                Err(e) => {
                    warn!("Failed to remove {:?}: {}", dir, e);
                    failures.push(ItemFailure::new(dir, e));
                }
            }
        }
        links.clear()?;

        let mut cleared = ArchiveMetadata::new(metadata.settings.clone());
        let history_cleared = policy == ResetPolicy::ClearHistory;
        if !history_cleared {
            cleared.sources = metadata.sources;
            let roots: Vec<_> = cleared.sources.iter().map(|s| s.root.clone()).collect();
            for root in &roots {
                cleared.refresh_source(root, None);
            }
        }
        self.store.save(&cleared)?;

        info!(
            "Reset complete: {} chunk directories removed, backup at {:?}",
            removed_dirs.len(),
            backup
        );
        Ok((
            cleared,
            ResetReport {
                backup,
                removed_dirs,
                failures,
                history_cleared,
            },
        ))
    }

    /// Rebuild the archive from `snapshot`
    ///
    /// The current metadata, if any, is backed up first. The rebuilt metadata
    /// is persisted and reference entries are then repaired to match it.
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::RestoreFailed`] if the snapshot is missing or empty
    /// - [`ArchiveError::MetadataCorruption`] if it breaks an invariant
    #[instrument(skip(self, links))]
    pub fn restore(
        &self,
        snapshot: &Path,
        links: &mut dyn ReferenceStore,
    ) -> Result<(ArchiveMetadata, RestoreReport)> {
        let source = self.store.load_snapshot(snapshot)?;
        if source.files.is_empty() && source.chunks.is_empty() {
            return Err(ArchiveError::RestoreFailed(format!(
                "snapshot {:?} contains no chunks or files",
                snapshot
            )));
        }

        let previous_backup = if self.store.exists() {
            Some(self.store.backup(&self.store.load()?)?)
        } else {
            None
        };

        let (metadata, missing, resized) = rebuild(source);
        self.store.save(&metadata)?;

        for gone in &missing {
            warn!("Missing: {:?} (was in chunk {})", gone.path, gone.chunk_id);
        }

        let reconcile = Reconciler::new(self.layout, links, ReconcileOptions::fix()).run(&metadata)?;

        info!(
            "Restore complete: {} files restored, {} missing",
            metadata.files.len(),
            missing.len()
        );
        let report = RestoreReport {
            snapshot: snapshot.to_path_buf(),
            previous_backup,
            restored: metadata.files.len(),
            missing,
            resized,
            reconcile,
        };
        Ok((metadata, report))
    }
}

/// Keep the snapshot's records whose source still exists
fn rebuild(
    snapshot: ArchiveMetadata,
) -> (ArchiveMetadata, Vec<MissingSource>, Vec<std::path::PathBuf>) {
    let mut metadata = ArchiveMetadata::new(snapshot.settings);
    metadata.chunks = snapshot.chunks;
    for chunk in &mut metadata.chunks {
        chunk.used = 0;
    }
    metadata.sources = snapshot.sources;

    let mut kept = Vec::with_capacity(snapshot.files.len());
    let mut missing = Vec::new();
    let mut resized = Vec::new();
    for record in snapshot.files {
        match fs::metadata(&record.path) {
            Ok(meta) if meta.is_file() => {
                if meta.len() != record.size {
                    resized.push(record.path.clone());
                }
                kept.push(record);
            }
            _ => missing.push(MissingSource {
                path: record.path,
                chunk_id: record.chunk_id,
            }),
        }
    }

    for record in &kept {
        if let Some(chunk) = metadata.chunk_mut(record.chunk_id) {
            chunk.used += record.size;
        }
    }
    metadata.files = kept;
    metadata.normalize();

    let roots: Vec<_> = metadata.sources.iter().map(|s| s.root.clone()).collect();
    for root in &roots {
        metadata.refresh_source(root, None);
    }
    (metadata, missing, resized)
}
