//! Archive façade
//!
//! [`Archive`] is the entry point for every command. It owns the archive root,
//! resolves the persisted settings, takes the archive lock around mutating
//! commands, and drives the store, scanner, allocator, reconciler and
//! lifecycle manager in the order each command needs.
//!
//! ## Command order
//!
//! - `add` / `rescan`: scan, allocate, save, reconcile (fix), catalogues
//! - `check`: reconcile (check or fix), catalogues after a fix
//! - `reset` / `restore`: see [`crate::lifecycle`]
//!
//! Metadata is always saved before any reference entry is touched, so an
//! interrupted run leaves drift that a later `check --fix` repairs, never
//! a half-written metadata file.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use brarch::{ArchiveBuilder, GIB};
//!
//! # fn main() -> brarch::Result<()> {
//! let archive = ArchiveBuilder::new()
//!     .chunk_size(4 * GIB)
//!     .hash_files(true)
//!     .ignore_patterns(vec!["*.tmp".to_string()])
//!     .open("/mnt/archive")?;
//!
//! let report = archive.add("/data/photos")?;
//! println!("{} new files", report.new_files);
//!
//! archive.burn(&[1])?;
//! # Ok(())
//! # }
//! ```

use crate::catalogue::write_catalogues;
use crate::error::{ArchiveError, Result};
use crate::layout::Layout;
use crate::lifecycle::LifecycleManager;
use crate::links::open_store;
use crate::metadata::ArchiveMetadata;
use crate::reconcile::{ReconcileOptions, ReconcileReport, Reconciler};
use crate::scanner::{hash_paths, validate_patterns, IncrementalScan, IncrementalScanner};
use crate::store::MetadataStore;
use crate::types::*;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Fill ratio below which `iso` flags a chunk as underfilled
const ISO_FILL_THRESHOLD: f64 = 0.8;

/// Options collected by [`ArchiveBuilder`]
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Requested chunk capacity; `None` keeps the persisted or default size
    pub chunk_size: Option<u64>,
    /// Hash new files before recording them
    pub hash_files: bool,
    /// Ignore patterns for the root being added
    pub ignore_patterns: Vec<String>,
    /// Requested reference strategy; `None` keeps the persisted or default one
    pub link_strategy: Option<LinkStrategy>,
    /// What `reset` does with tracked directories
    pub reset_policy: ResetPolicy,
    /// Skip burnt chunks in `check`
    pub skip_burnt: bool,
    /// Hashing threads
    pub parallel_workers: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            chunk_size: None,
            hash_files: false,
            ignore_patterns: Vec::new(),
            link_strategy: None,
            reset_policy: ResetPolicy::default(),
            skip_burnt: false,
            parallel_workers: num_cpus::get(),
        }
    }
}

/// Builder for [`Archive`]
///
/// # Examples
///
/// ```rust,no_run
/// use brarch::{ArchiveBuilder, LinkStrategy, ResetPolicy};
///
/// # fn main() -> brarch::Result<()> {
/// let archive = ArchiveBuilder::new()
///     .link_strategy(LinkStrategy::Manifest)
///     .reset_policy(ResetPolicy::ClearHistory)
///     .open("./archive")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ArchiveBuilder {
    config: ArchiveConfig,
}

impl ArchiveBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the capacity of new chunks, in bytes
    ///
    /// Only takes effect when the archive is created. An existing archive keeps
    /// its persisted chunk size and a warning is logged if it differs.
    pub fn chunk_size(mut self, bytes: u64) -> Self {
        self.config.chunk_size = Some(bytes);
        self
    }

    /// Hash new files with SHA-256 before recording them
    pub fn hash_files(mut self, enabled: bool) -> Self {
        self.config.hash_files = enabled;
        self
    }

    /// Set ignore patterns for `add`
    ///
    /// Patterns use gitignore glob syntax and are stored with the tracked
    /// directory, so rescans apply them too.
    pub fn ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.config.ignore_patterns = patterns;
        self
    }

    /// Choose how reference entries are materialised
    ///
    /// Like the chunk size, this is fixed when the archive is created.
    pub fn link_strategy(mut self, strategy: LinkStrategy) -> Self {
        self.config.link_strategy = Some(strategy);
        self
    }

    /// Choose whether `reset` keeps tracked directories
    pub fn reset_policy(mut self, policy: ResetPolicy) -> Self {
        self.config.reset_policy = policy;
        self
    }

    /// Skip burnt chunks during `check`
    pub fn skip_burnt(mut self, skip: bool) -> Self {
        self.config.skip_burnt = skip;
        self
    }

    /// Set the number of hashing threads (minimum 1)
    pub fn parallel_workers(mut self, count: usize) -> Self {
        self.config.parallel_workers = count.max(1);
        self
    }

    /// Open the archive rooted at `root`
    ///
    /// The directory does not need to exist yet; `add` creates it.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::InvalidConfiguration`] for a zero chunk size
    /// and [`ArchiveError::InvalidPattern`] for a malformed ignore pattern.
    pub fn open(self, root: impl AsRef<Path>) -> Result<Archive> {
        if self.config.chunk_size == Some(0) {
            return Err(ArchiveError::config("chunk size must be greater than zero"));
        }
        validate_patterns(&self.config.ignore_patterns)?;

        let root = absolute(root.as_ref())?;
        debug!("Opening archive at {:?}", root);
        Ok(Archive {
            store: MetadataStore::new(&root),
            layout: Layout::new(&root),
            root,
            config: self.config,
        })
    }
}

/// Canonical path if it exists, otherwise anchored at the working directory
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        Ok(fs::canonicalize(path)?)
    } else if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// An archive root and the commands that operate on it
#[derive(Debug)]
pub struct Archive {
    root: PathBuf,
    store: MetadataStore,
    layout: Layout,
    config: ArchiveConfig,
}

impl Archive {
    /// Open the archive at `root` with default options
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        ArchiveBuilder::new().open(root)
    }

    /// Archive root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Options this archive was opened with
    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Metadata store of this archive
    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    /// Chunk directory layout of this archive
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Load the current metadata
    pub fn metadata(&self) -> Result<ArchiveMetadata> {
        self.store.load()
    }

    fn requested_settings(&self) -> ArchiveSettings {
        let defaults = ArchiveSettings::default();
        ArchiveSettings {
            chunk_size: self.config.chunk_size.unwrap_or(defaults.chunk_size),
            link_strategy: self.config.link_strategy.unwrap_or(defaults.link_strategy),
        }
    }

    fn warn_on_setting_drift(&self, settings: &ArchiveSettings) {
        if let Some(requested) = self.config.chunk_size {
            if requested != settings.chunk_size {
                warn!(
                    "Archive uses a chunk size of {}; ignoring requested {}",
                    crate::utils::format_bytes(settings.chunk_size),
                    crate::utils::format_bytes(requested)
                );
            }
        }
        if let Some(requested) = self.config.link_strategy {
            if requested != settings.link_strategy {
                warn!(
                    "Archive uses {:?} reference entries; ignoring requested {:?}",
                    settings.link_strategy, requested
                );
            }
        }
    }

    fn scanner(&self) -> Result<IncrementalScanner> {
        Ok(IncrementalScanner::new()
            .with_excluded(Some(fs::canonicalize(&self.root)?))
            .with_hashing(self.config.hash_files)
            .with_workers(self.config.parallel_workers))
    }

    /// Persist, then bring reference entries and catalogues in line
    fn commit(&self, metadata: &ArchiveMetadata) -> Result<ReconcileReport> {
        self.store.save(metadata)?;
        let reconcile = self.reconcile(metadata, ReconcileOptions::fix())?;
        self.refresh_catalogues(metadata)?;
        Ok(reconcile)
    }

    fn reconcile(&self, metadata: &ArchiveMetadata, options: ReconcileOptions) -> Result<ReconcileReport> {
        let mut links = open_store(metadata.settings.link_strategy, &self.root)?;
        Reconciler::new(&self.layout, links.as_mut(), options).run(metadata)
    }

    fn refresh_catalogues(&self, metadata: &ArchiveMetadata) -> Result<()> {
        let report = write_catalogues(&self.layout, metadata)?;
        for failure in &report.failures {
            warn!("Catalogue not written to {:?}: {}", failure.path, failure.reason);
        }
        Ok(())
    }

    /// Track a new source directory and archive its files
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::InvalidConfiguration`] if `root` is not a directory,
    ///   lies inside the archive, contains a tracked directory, or shares its
    ///   name with a tracked directory
    /// - [`ArchiveError::AlreadyTracked`] if `root` is a tracked directory or
    ///   lies inside one
    /// - [`ArchiveError::ArchiveLocked`] if another invocation is running
    #[instrument(skip(self, root), fields(root = ?root.as_ref()))]
    pub fn add(&self, root: impl AsRef<Path>) -> Result<AddReport> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(ArchiveError::config(format!("{:?} is not a directory", root)));
        }
        let root = fs::canonicalize(root)?;

        fs::create_dir_all(&self.root)?;
        let _lock = self.store.lock()?;
        let archive_root = fs::canonicalize(&self.root)?;
        if root.starts_with(&archive_root) {
            return Err(ArchiveError::config(format!(
                "{:?} lies inside the archive {:?}",
                root, archive_root
            )));
        }

        let mut metadata = self.store.load_or_default(self.requested_settings())?;
        self.warn_on_setting_drift(&metadata.settings);
        check_new_root(&metadata, &root)?;

        info!("Adding {:?} to the archive", root);
        metadata.sources.push(SourceDirectoryRecord::new(
            root.clone(),
            self.config.ignore_patterns.clone(),
            Utc::now(),
        ));

        let (metadata, scan) = self.scanner()?.scan_roots(metadata, std::slice::from_ref(&root))?;
        let reconcile = self.commit(&metadata)?;

        Ok(AddReport {
            root,
            files_scanned: scan.files_seen,
            new_files: scan.new_files,
            allocation: scan.allocation,
            reconcile,
            scan_failures: scan.scan_failures,
            hash_failures: scan.hash_failures,
        })
    }

    /// Pick up new files under every tracked directory
    #[instrument(skip(self))]
    pub fn rescan(&self) -> Result<RescanReport> {
        let _lock = self.store.lock()?;
        let metadata = self.store.load()?;
        self.warn_on_setting_drift(&metadata.settings);

        let (metadata, scan) = self.scanner()?.rescan(metadata)?;
        let reconcile = self.commit(&metadata)?;

        let IncrementalScan {
            roots_scanned,
            missing_roots,
            new_files,
            allocation,
            scan_failures,
            hash_failures,
            ..
        } = scan;
        Ok(RescanReport {
            roots_scanned,
            missing_roots,
            new_files,
            allocation,
            reconcile,
            scan_failures,
            hash_failures,
        })
    }

    /// Mark chunks as burnt
    ///
    /// Unknown ids fail the whole call before anything is changed. Burning a
    /// chunk twice is not an error.
    #[instrument(skip(self))]
    pub fn burn(&self, ids: &[ChunkId]) -> Result<BurnReport> {
        let _lock = self.store.lock()?;
        let mut metadata = self.store.load()?;

        if let Some(&unknown) = ids.iter().find(|&&id| metadata.chunk(id).is_none()) {
            return Err(ArchiveError::ChunkNotFound(unknown));
        }

        let mut report = BurnReport::default();
        for &id in ids {
            if report.newly_burnt.contains(&id) || report.already_burnt.contains(&id) {
                continue;
            }
            let Some(chunk) = metadata.chunk_mut(id) else {
                continue;
            };
            if chunk.burnt {
                report.already_burnt.push(id);
            } else {
                chunk.burnt = true;
                report.newly_burnt.push(id);
            }
        }

        if !report.newly_burnt.is_empty() {
            self.store.save(&metadata)?;
            info!("Marked chunks {:?} as burnt", report.newly_burnt);
        }
        Ok(report)
    }

    /// Recompute content hashes of records under `root`
    ///
    /// Without `all`, only records without a hash or whose source size changed
    /// are hashed. Record sizes are never changed.
    #[instrument(skip(self, root), fields(root = ?root.as_ref()))]
    pub fn rehash(&self, root: impl AsRef<Path>, all: bool) -> Result<RehashReport> {
        let root = absolute(root.as_ref())?;
        let _lock = self.store.lock()?;
        let mut metadata = self.store.load()?;

        let mut report = RehashReport::default();
        let mut pending = Vec::new();
        for record in metadata.records_under(&root) {
            let current = match fs::metadata(&record.path) {
                Ok(meta) if meta.is_file() => meta.len(),
                _ => {
                    warn!("File not found: {:?}", record.path);
                    report.missing.push(record.path.clone());
                    continue;
                }
            };
            let resized = current != record.size;
            if resized {
                report.resized.push(record.path.clone());
            }
            if all || resized || record.hash.is_none() {
                pending.push(record.path.clone());
            } else {
                report.unchanged += 1;
            }
        }

        info!("Hashing {} files under {:?}", pending.len(), root);
        let hashes = hash_paths(&pending, self.config.parallel_workers)?;
        for (path, hash) in pending.into_iter().zip(hashes) {
            let hash = match hash {
                Ok(hash) => hash,
                Err(e) => {
                    warn!("Failed to hash {:?}: {}", path, e);
                    report.failures.push(ItemFailure::new(&path, e));
                    continue;
                }
            };
            let Some(record) = metadata.record_mut(&path) else {
                continue;
            };
            if let Some(old) = record.hash.as_ref().filter(|old| **old != hash) {
                info!("Hash changed for {:?}: {} -> {}", path, old, hash);
                report.changed.push(HashChange {
                    path: path.clone(),
                    old: old.clone(),
                    new: hash.clone(),
                });
            }
            record.hash = Some(hash);
            report.hashed += 1;
        }

        if report.hashed > 0 {
            self.store.save(&metadata)?;
            self.refresh_catalogues(&metadata)?;
        }
        info!(
            "Rehashed {} files, {} changed, {} missing",
            report.hashed,
            report.changed.len(),
            report.missing.len()
        );
        Ok(report)
    }

    /// Compare reference entries with the metadata, repairing them if `fix`
    ///
    /// Check mode takes no lock and changes nothing.
    #[instrument(skip(self))]
    pub fn check(&self, fix: bool) -> Result<ReconcileReport> {
        let options = if fix {
            ReconcileOptions::fix()
        } else {
            ReconcileOptions::check()
        }
        .skip_burnt(self.config.skip_burnt);

        let _lock = if fix { Some(self.store.lock()?) } else { None };
        let metadata = self.store.load()?;
        let report = self.reconcile(&metadata, options)?;
        if fix {
            self.refresh_catalogues(&metadata)?;
        }
        Ok(report)
    }

    /// Back up the metadata and clear every chunk
    #[instrument(skip(self))]
    pub fn reset(&self) -> Result<ResetReport> {
        let _lock = self.store.lock()?;
        let metadata = self.store.load()?;
        let mut links = open_store(metadata.settings.link_strategy, &self.root)?;

        let manager = LifecycleManager::new(&self.store, &self.layout);
        let (_, report) = manager.reset(metadata, links.as_mut(), self.config.reset_policy)?;
        Ok(report)
    }

    /// Rebuild the archive from a metadata snapshot
    #[instrument(skip(self, snapshot), fields(snapshot = ?snapshot.as_ref()))]
    pub fn restore(&self, snapshot: impl AsRef<Path>) -> Result<RestoreReport> {
        let snapshot = snapshot.as_ref();
        fs::create_dir_all(&self.root)?;
        let _lock = self.store.lock()?;

        let strategy = self.store.load_snapshot(snapshot)?.settings.link_strategy;
        let mut links = open_store(strategy, &self.root)?;

        let manager = LifecycleManager::new(&self.store, &self.layout);
        let (metadata, report) = manager.restore(snapshot, links.as_mut())?;
        self.refresh_catalogues(&metadata)?;
        Ok(report)
    }

    /// Tracked source directories
    pub fn list(&self) -> Result<Vec<SourceDirectoryRecord>> {
        Ok(self.store.load()?.sources)
    }

    /// Suggest a `genisoimage` command for a chunk
    ///
    /// Without an id the first chunk that is not burnt is used; `None` means
    /// every chunk is burnt.
    pub fn iso(&self, id: Option<ChunkId>) -> Result<Option<IsoSuggestion>> {
        let metadata = self.store.load()?;
        let chunk = match id {
            Some(id) => metadata.chunk(id).ok_or(ArchiveError::ChunkNotFound(id))?,
            None => match metadata.first_unburnt() {
                Some(chunk) => chunk,
                None => {
                    info!("All chunks have been burnt");
                    return Ok(None);
                }
            },
        };

        if chunk.burnt {
            warn!("Chunk {} is already burnt", chunk.id);
        }
        let underfilled = chunk.fill_ratio() < ISO_FILL_THRESHOLD;
        if underfilled {
            warn!(
                "Chunk {} is only {:.0}% full, consider adding more files before burning",
                chunk.id,
                chunk.fill_ratio() * 100.0
            );
        }

        Ok(Some(IsoSuggestion {
            chunk_id: chunk.id,
            command: format!(
                "genisoimage -o chunk_{id}.iso -f -R -J -V 'Chunk {id}' chunk_{id}/",
                id = chunk.id
            ),
            used: chunk.used,
            capacity: chunk.capacity,
            underfilled,
        }))
    }
}

/// Reject roots that overlap a tracked directory or reuse its name
fn check_new_root(metadata: &ArchiveMetadata, root: &Path) -> Result<()> {
    for source in &metadata.sources {
        if root.starts_with(&source.root) {
            return Err(ArchiveError::AlreadyTracked {
                path: root.to_path_buf(),
                tracked: source.root.clone(),
            });
        }
        if source.root.starts_with(root) {
            return Err(ArchiveError::config(format!(
                "{:?} contains tracked directory {:?}",
                root, source.root
            )));
        }
        if source.root.file_name() == root.file_name() {
            return Err(ArchiveError::config(format!(
                "{:?} has the same name as tracked directory {:?}",
                root, source.root
            )));
        }
    }
    Ok(())
}
