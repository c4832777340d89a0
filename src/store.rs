//! Durable storage of the archive metadata
//!
//! The metadata lives in a single pretty-printed JSON document at the archive
//! root. This module owns everything that touches that document and its
//! neighbours:
//!
//! ```text
//! archive_root/
//! ├── chunks_meta.json                      # current metadata
//! ├── chunks_meta_20240101_120000.json.bak  # snapshots taken before reset
//! ├── .brarch.lock                          # advisory lock of mutating commands
//! └── chunk_<id>/                           # reference entries (see links)
//! ```
//!
//! ## Guarantees
//!
//! - **Validated both ways**: loading validates the structural invariants and
//!   fails fast with [`ArchiveError::MetadataCorruption`]; saving validates again
//!   so a broken value never reaches the disk.
//! - **Atomic saves**: the document is written to a temporary file in the same
//!   directory, fsynced, and renamed over the previous version.
//! - **Exclusive writers**: [`MetadataStore::lock`] takes an advisory lock that
//!   is released when the returned guard is dropped.

use crate::error::{ArchiveError, Result};
use crate::metadata::ArchiveMetadata;
use crate::types::ArchiveSettings;
use crate::utils::atomic_write;
use chrono::Local;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

/// Name of the metadata document
pub const METADATA_FILE: &str = "chunks_meta.json";

/// Name of the advisory lock file
pub const LOCK_FILE: &str = ".brarch.lock";

const BACKUP_PREFIX: &str = "chunks_meta_";
const BACKUP_SUFFIX: &str = ".json.bak";

/// Reads and writes `chunks_meta.json` for one archive root
#[derive(Debug, Clone)]
pub struct MetadataStore {
    root: PathBuf,
}

impl MetadataStore {
    /// Create a store for the archive rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Archive root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the metadata document
    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    /// Whether a metadata document exists
    pub fn exists(&self) -> bool {
        self.metadata_path().is_file()
    }

    /// Load and validate the metadata
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::NotInitialized`] if no document exists
    /// - [`ArchiveError::MetadataCorruption`] if it cannot be parsed or breaks
    ///   an invariant
    pub fn load(&self) -> Result<ArchiveMetadata> {
        let path = self.metadata_path();
        if !path.is_file() {
            return Err(ArchiveError::NotInitialized(self.root.clone()));
        }
        let metadata = read_metadata(&path)?;
        debug!(
            "Loaded metadata: {} chunks, {} files, {} sources",
            metadata.chunks.len(),
            metadata.files.len(),
            metadata.sources.len()
        );
        Ok(metadata)
    }

    /// Load the metadata, or start from empty metadata with `settings`
    pub fn load_or_default(&self, settings: ArchiveSettings) -> Result<ArchiveMetadata> {
        if self.exists() {
            self.load()
        } else {
            info!("No metadata at {:?}, starting a new archive", self.root);
            Ok(ArchiveMetadata::new(settings))
        }
    }

    /// Load and validate an arbitrary snapshot file
    pub fn load_snapshot(&self, path: &Path) -> Result<ArchiveMetadata> {
        if !path.is_file() {
            return Err(ArchiveError::RestoreFailed(format!(
                "snapshot {:?} does not exist",
                path
            )));
        }
        read_metadata(path)
    }

    /// Validate and atomically persist the metadata
    pub fn save(&self, metadata: &ArchiveMetadata) -> Result<()> {
        let path = self.metadata_path();
        metadata.validate(&path)?;

        let json = serde_json::to_string_pretty(metadata)?;
        atomic_write(&path, json.as_bytes())?;

        debug!("Saved metadata to {:?}", path);
        Ok(())
    }

    /// Write a timestamped snapshot of `metadata` next to the document
    ///
    /// Returns the snapshot path. A numeric suffix is added when a snapshot
    /// with the same timestamp already exists.
    pub fn backup(&self, metadata: &ArchiveMetadata) -> Result<PathBuf> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut path = self
            .root
            .join(format!("{}{}{}", BACKUP_PREFIX, stamp, BACKUP_SUFFIX));
        let mut attempt = 1;
        while path.exists() {
            path = self.root.join(format!(
                "{}{}_{}{}",
                BACKUP_PREFIX, stamp, attempt, BACKUP_SUFFIX
            ));
            attempt += 1;
        }

        let json = serde_json::to_string_pretty(metadata)?;
        atomic_write(&path, json.as_bytes())?;

        info!("Backed up metadata to {:?}", path);
        Ok(path)
    }

    /// Snapshot files in the archive root, oldest first
    pub fn list_backups(&self) -> Result<Vec<PathBuf>> {
        let mut backups = Vec::new();
        if !self.root.is_dir() {
            return Ok(backups);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(BACKUP_PREFIX) && name.ends_with(BACKUP_SUFFIX) {
                backups.push(entry.path());
            }
        }
        backups.sort();
        Ok(backups)
    }

    /// Take the archive's exclusive advisory lock
    ///
    /// # Errors
    ///
    /// [`ArchiveError::ArchiveLocked`] if another process holds it.
    pub fn lock(&self) -> Result<ArchiveLock> {
        fs::create_dir_all(&self.root)?;
        let path = self.root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                trace!("Acquired archive lock {:?}", path);
                Ok(ArchiveLock { file, path })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(ArchiveError::ArchiveLocked(self.root.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn read_metadata(path: &Path) -> Result<ArchiveMetadata> {
    let bytes = fs::read(path)?;
    let mut metadata: ArchiveMetadata = serde_json::from_slice(&bytes)
        .map_err(|e| ArchiveError::corruption(path, format!("unparseable JSON: {}", e)))?;
    metadata.validate(path)?;
    metadata.normalize();
    Ok(metadata)
}

/// Guard for the archive lock; released on drop
#[derive(Debug)]
pub struct ArchiveLock {
    file: File,
    path: PathBuf,
}

impl ArchiveLock {
    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ArchiveLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!("Failed to release archive lock {:?}: {}", self.path, e);
        } else {
            trace!("Released archive lock {:?}", self.path);
        }
    }
}
