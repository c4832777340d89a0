//! Directory walking and incremental discovery
//!
//! [`FileScanner`] walks a single source root and returns every regular file
//! below it. [`IncrementalScanner`] drives scanners over tracked roots, keeps
//! only files the archive does not know yet, optionally hashes them, and
//! hands them to the allocator as one batch.
//!
//! ## Walking rules
//!
//! - Hidden files are included and no `.gitignore`-style files are honoured;
//!   only the ignore patterns given for the root apply.
//! - Patterns use gitignore glob syntax. A pattern without `/` matches a name
//!   at any depth, and a matching directory is not descended into.
//! - The archive root is never descended into, so chunk directories do not
//!   feed back into the archive.
//! - Symbolic links to files are resolved to their canonical target; the same
//!   target reached twice is reported once. Links to directories are not
//!   followed.
//! - Unreadable entries do not stop the walk; they are returned as
//!   [`ItemFailure`]s.
//!
//! ## Example
//!
//! ```rust,no_run
//! use brarch::scanner::FileScanner;
//!
//! # fn main() -> brarch::Result<()> {
//! let result = FileScanner::new("/data/photos")
//!     .with_ignore_patterns(vec!["*.tmp".to_string(), "cache".to_string()])
//!     .scan()?;
//! println!("{} files, {} errors", result.files.len(), result.failures.len());
//! # Ok(())
//! # }
//! ```

use crate::allocator::{AllocationReport, Allocator};
use crate::error::{ArchiveError, Result};
use crate::metadata::ArchiveMetadata;
use crate::types::{ItemFailure, ScannedFile};
use crate::utils::hash_file_content;
use chrono::Utc;
use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// Files found under one root
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Regular files, sorted by path
    pub files: Vec<ScannedFile>,
    /// Entries that could not be read
    pub failures: Vec<ItemFailure>,
}

impl ScanResult {
    /// Total bytes of the files found
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Walks one source root
#[derive(Debug, Clone)]
pub struct FileScanner {
    root: PathBuf,
    ignore_patterns: Vec<String>,
    excluded: Option<PathBuf>,
}

impl FileScanner {
    /// Create a scanner for `root`
    ///
    /// `root` should be canonical; found paths are built from it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ignore_patterns: Vec::new(),
            excluded: None,
        }
    }

    /// Skip paths matching these gitignore-style globs
    pub fn with_ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.ignore_patterns = patterns;
        self
    }

    /// Never descend into `dir` (the archive root)
    pub fn with_excluded(mut self, dir: Option<PathBuf>) -> Self {
        self.excluded = dir;
        self
    }

    /// Walk the root
    ///
    /// # Errors
    ///
    /// [`ArchiveError::InvalidPattern`] if an ignore pattern does not parse.
    /// Per-entry problems are returned in [`ScanResult::failures`].
    pub fn scan(&self) -> Result<ScanResult> {
        let start = Instant::now();
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .standard_filters(false)
            .hidden(false)
            .follow_links(false);

        if !self.ignore_patterns.is_empty() {
            builder.overrides(build_overrides(&self.root, &self.ignore_patterns)?);
        }
        if let Some(excluded) = self.excluded.clone() {
            builder.filter_entry(move |entry| entry.path() != excluded);
        }

        let mut result = ScanResult::default();
        let mut seen = HashSet::new();

        for entry in builder.build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = error_path(&e).unwrap_or_else(|| self.root.clone());
                    warn!("Walk error at {:?}: {}", path, e);
                    result.failures.push(ItemFailure::new(path, e));
                    continue;
                }
            };
            let Some(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                continue;
            }

            let path = entry.path();
            let resolved = if file_type.is_symlink() {
                match fs::canonicalize(path) {
                    Ok(target) => target,
                    Err(e) => {
                        debug!("Dangling link {:?}: {}", path, e);
                        result
                            .failures
                            .push(ItemFailure::new(path, format!("dangling link: {}", e)));
                        continue;
                    }
                }
            } else {
                path.to_path_buf()
            };

            if let Some(excluded) = &self.excluded {
                if resolved.starts_with(excluded) {
                    trace!("Skipping {:?}: resolves into the archive", path);
                    continue;
                }
            }

            let meta = match fs::metadata(&resolved) {
                Ok(meta) => meta,
                Err(e) => {
                    result.failures.push(ItemFailure::new(&resolved, e));
                    continue;
                }
            };
            if !meta.is_file() {
                trace!("Skipping {:?}: not a regular file", path);
                continue;
            }
            if !seen.insert(resolved.clone()) {
                trace!("Skipping {:?}: already seen as {:?}", path, resolved);
                continue;
            }
            result.files.push(ScannedFile::new(resolved, meta.len()));
        }

        result.files.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(
            "Scanned {:?}: {} files ({} bytes) in {:?}",
            self.root,
            result.files.len(),
            result.total_bytes(),
            start.elapsed()
        );
        Ok(result)
    }
}

/// Turn ignore patterns into override globs that exclude what they match
fn build_overrides(root: &Path, patterns: &[String]) -> Result<ignore::overrides::Override> {
    let mut builder = OverrideBuilder::new(root);
    for pattern in patterns {
        let invalid = |reason: String| ArchiveError::InvalidPattern {
            pattern: pattern.clone(),
            reason,
        };
        if pattern.trim().is_empty() {
            return Err(invalid("empty pattern".to_string()));
        }
        if pattern.starts_with('!') {
            return Err(invalid("negated patterns are not supported".to_string()));
        }
        // Override globs whitelist by default; `!` turns them into ignores
        builder
            .add(&format!("!{}", pattern))
            .map_err(|e| invalid(e.to_string()))?;
    }
    builder.build().map_err(|e| ArchiveError::InvalidPattern {
        pattern: patterns.join(", "),
        reason: e.to_string(),
    })
}

/// Check that every pattern parses, without walking anything
pub fn validate_patterns(patterns: &[String]) -> Result<()> {
    build_overrides(Path::new("/"), patterns).map(|_| ())
}

fn error_path(err: &ignore::Error) -> Option<PathBuf> {
    match err {
        ignore::Error::WithPath { path, .. } => Some(path.clone()),
        ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => {
            error_path(err)
        }
        ignore::Error::Loop { child, .. } => Some(child.clone()),
        _ => None,
    }
}

/// Hash `paths` on a pool of `workers` threads
///
/// Results come back in input order. A failure to build the pool is an error;
/// a failure to hash one file is returned in that file's slot.
pub fn hash_paths(paths: &[PathBuf], workers: usize) -> Result<Vec<Result<String>>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .map_err(|e| ArchiveError::internal(format!("failed to start hashing pool: {}", e)))?;

    Ok(pool.install(|| {
        paths
            .par_iter()
            .map(|path| hash_file_content(path))
            .collect()
    }))
}

/// Fill in the hash of every file in `files`; returns the ones that failed
pub fn hash_files(files: &mut [ScannedFile], workers: usize) -> Result<Vec<ItemFailure>> {
    let paths: Vec<PathBuf> = files.iter().map(|f| f.path.clone()).collect();
    let hashes = hash_paths(&paths, workers)?;

    let mut failures = Vec::new();
    for (file, hash) in files.iter_mut().zip(hashes) {
        match hash {
            Ok(hash) => file.hash = Some(hash),
            Err(e) => {
                warn!("Failed to hash {:?}: {}", file.path, e);
                failures.push(ItemFailure::new(&file.path, e));
            }
        }
    }
    Ok(failures)
}

/// Outcome of scanning tracked roots and allocating what was new
#[derive(Debug, Clone, Default)]
pub struct IncrementalScan {
    /// Roots that were walked
    pub roots_scanned: usize,
    /// Roots that no longer exist
    pub missing_roots: Vec<PathBuf>,
    /// Files found by the walks
    pub files_seen: usize,
    /// Files not previously known
    pub new_files: usize,
    /// Placement of the new files
    pub allocation: AllocationReport,
    /// Walk errors
    pub scan_failures: Vec<ItemFailure>,
    /// Hashing errors
    pub hash_failures: Vec<ItemFailure>,
}

/// Discovers new files under tracked roots and allocates them
#[derive(Debug, Clone)]
pub struct IncrementalScanner {
    excluded: Option<PathBuf>,
    hash_files: bool,
    workers: usize,
}

impl Default for IncrementalScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl IncrementalScanner {
    /// Create a scanner that does not hash
    pub fn new() -> Self {
        Self {
            excluded: None,
            hash_files: false,
            workers: num_cpus::get(),
        }
    }

    /// Never descend into `dir`
    pub fn with_excluded(mut self, dir: Option<PathBuf>) -> Self {
        self.excluded = dir;
        self
    }

    /// Hash new files before they are recorded
    pub fn with_hashing(mut self, enabled: bool) -> Self {
        self.hash_files = enabled;
        self
    }

    /// Threads used for hashing
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Rescan every tracked root
    pub fn rescan(&self, metadata: ArchiveMetadata) -> Result<(ArchiveMetadata, IncrementalScan)> {
        let roots: Vec<PathBuf> = metadata.sources.iter().map(|s| s.root.clone()).collect();
        self.scan_roots(metadata, &roots)
    }

    /// Scan the given tracked roots and allocate their new files as one batch
    ///
    /// Every root must already have a source record. Afterwards each scanned
    /// root's file count, byte total and last-scanned time are refreshed.
    #[instrument(skip(self, metadata, roots), fields(roots = roots.len()))]
    pub fn scan_roots(
        &self,
        metadata: ArchiveMetadata,
        roots: &[PathBuf],
    ) -> Result<(ArchiveMetadata, IncrementalScan)> {
        let now = Utc::now();
        let mut outcome = IncrementalScan::default();
        let mut batch = Vec::new();
        let mut scanned = Vec::new();

        for root in roots {
            let source = metadata.source(root).ok_or_else(|| {
                ArchiveError::internal(format!("{:?} is not a tracked root", root))
            })?;
            if !root.is_dir() {
                warn!("Tracked directory {:?} no longer exists, skipping", root);
                outcome.missing_roots.push(root.clone());
                continue;
            }

            let result = FileScanner::new(root)
                .with_ignore_patterns(source.ignore_patterns.clone())
                .with_excluded(self.excluded.clone())
                .scan()?;

            outcome.roots_scanned += 1;
            outcome.files_seen += result.files.len();
            outcome.scan_failures.extend(result.failures);
            batch.extend(
                result
                    .files
                    .into_iter()
                    .filter(|f| !metadata.contains_path(&f.path)),
            );
            scanned.push(root.clone());
        }

        if self.hash_files && !batch.is_empty() {
            info!("Hashing {} new files", batch.len());
            outcome.hash_failures = hash_files(&mut batch, self.workers)?;
        }

        let batch_len = batch.len();
        let (mut metadata, allocation) = Allocator::new()
            .with_timestamp(now)
            .allocate(metadata, batch)?;
        outcome.new_files = batch_len - allocation.already_known;
        outcome.allocation = allocation;

        for root in &scanned {
            metadata.refresh_source(root, Some(now));
        }

        info!(
            "Scanned {} roots: {} files, {} new",
            outcome.roots_scanned, outcome.files_seen, outcome.new_files
        );
        Ok((metadata, outcome))
    }
}
